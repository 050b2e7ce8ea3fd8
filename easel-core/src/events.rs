//! Bit-flag event group used for cross-task wakeups.
//!
//! One bus per engine. Tasks block on a mask of bits; setters wake every
//! waiter and each waiter re-checks its own predicate. `REFRESH_SHUTDOWN`
//! is in every wait mask so shutdown reaches all blocking points.

use std::{sync::Mutex, time::Duration};

use tokio::{sync::Notify, time::Instant};

use crate::{Error, Result};

/// Named bits of the engine event group.
pub mod bits {
    /// Wi-Fi came up.
    pub const WIFI_CONNECTED: u64 = 1 << 0;
    /// Wi-Fi went down.
    pub const WIFI_DISCONNECTED: u64 = 1 << 1;
    /// The MQTT session came up; the catalog is reachable.
    pub const MQTT_CONNECTED: u64 = 1 << 2;
    /// The MQTT session went down.
    pub const MQTT_DISCONNECTED: u64 = 1 << 3;
    /// Local storage is mounted and writable.
    pub const SD_AVAILABLE: u64 = 1 << 4;
    /// Local storage was handed to the USB bridge.
    pub const SD_UNAVAILABLE: u64 = 1 << 5;
    /// A refresh cycle finished.
    pub const REFRESH_DONE: u64 = 1 << 6;
    /// The cache holds artworks whose files are missing. Level-triggered;
    /// the downloader clears it after a drain finds nothing to fetch.
    pub const DOWNLOADS_NEEDED: u64 = 1 << 7;
    /// An artwork file finished downloading.
    pub const FILE_AVAILABLE: u64 = 1 << 8;
    /// Cooperative shutdown: every waiting task must exit.
    pub const REFRESH_SHUTDOWN: u64 = 1 << 9;
    /// Skip the sleep and start the next refresh cycle now.
    pub const REFRESH_IMMEDIATE: u64 = 1 << 10;
    /// A specific channel's refresh cycle finished.
    pub const CHANNEL_REFRESH_DONE: u64 = 1 << 11;
    /// A cache asked for a debounced flush; consumed by the flush task.
    pub const SAVE_SCHEDULED: u64 = 1 << 12;
}

/// A bit-flag event group: `set`/`clear` plus masked waits.
pub struct EventBus {
    state: Mutex<u64>,
    notify: Notify,
}

impl EventBus {
    /// Create an empty event group.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(0),
            notify: Notify::new(),
        }
    }

    /// Set bits and wake all waiters. Idempotent.
    pub fn set(&self, bits: u64) {
        {
            let mut state = self.state.lock().unwrap();
            *state |= bits;
        }
        self.notify.notify_waiters();
    }

    /// Clear bits. Idempotent; does not wake waiters.
    pub fn clear(&self, bits: u64) {
        let mut state = self.state.lock().unwrap();
        *state &= !bits;
    }

    /// Current snapshot of the group.
    pub fn get(&self) -> u64 {
        *self.state.lock().unwrap()
    }

    /// Whether any of `bits` is currently set.
    pub fn any_set(&self, bits: u64) -> bool {
        self.get() & bits != 0
    }

    /// Block until any bit of `mask` is set, or the timeout elapses.
    /// Returns the observed matching bits without clearing them.
    pub async fn wait_any(&self, mask: u64, timeout: Option<Duration>) -> Result<u64> {
        self.wait(mask, 0, timeout, false, false).await
    }

    /// Edge-triggered variant of [`EventBus::wait_any`]: the matching bits
    /// are cleared before returning so the next wait blocks again.
    pub async fn wait_any_clear(&self, mask: u64, timeout: Option<Duration>) -> Result<u64> {
        self.wait(mask, 0, timeout, false, true).await
    }

    /// Block until every bit of `mask` is set, or the timeout elapses.
    /// Returns the observed bits without clearing them.
    pub async fn wait_all(&self, mask: u64, timeout: Option<Duration>) -> Result<u64> {
        self.wait(mask, 0, timeout, true, false).await
    }

    /// Block until every bit of `all_mask` is set, or any bit of
    /// `interrupt_mask` is — the downloader's gate shape, where shutdown
    /// must cut through a wait for work, storage, and connectivity.
    pub async fn wait_all_or(
        &self,
        all_mask: u64,
        interrupt_mask: u64,
        timeout: Option<Duration>,
    ) -> Result<u64> {
        self.wait(all_mask, interrupt_mask, timeout, true, false).await
    }

    async fn wait(
        &self,
        mask: u64,
        interrupt_mask: u64,
        timeout: Option<Duration>,
        all: bool,
        clear: bool,
    ) -> Result<u64> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // Register before checking so a set() between the check and the
            // await cannot be missed.
            let notified = self.notify.notified();

            {
                let mut state = self.state.lock().unwrap();
                let interrupted = *state & interrupt_mask;
                if interrupted != 0 {
                    return Ok(interrupted);
                }
                let observed = *state & mask;
                let satisfied = if all { observed == mask } else { observed != 0 };
                if satisfied {
                    if clear {
                        *state &= !observed;
                    }
                    return Ok(observed);
                }
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        // Deadline passed while parked; loop once more so the
                        // final state check and the timeout report agree.
                        continue;
                    }
                }
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn wait_any_observes_already_set_bits() {
        let bus = EventBus::new();
        bus.set(bits::WIFI_CONNECTED | bits::SD_AVAILABLE);
        let observed = bus
            .wait_any(bits::SD_AVAILABLE | bits::REFRESH_SHUTDOWN, None)
            .await
            .unwrap();
        assert_eq!(observed, bits::SD_AVAILABLE);
        // Non-clearing: the bit stays set.
        assert!(bus.any_set(bits::SD_AVAILABLE));
    }

    #[tokio::test]
    async fn wait_all_blocks_until_every_bit_is_up() {
        let bus = Arc::new(EventBus::new());
        bus.set(bits::WIFI_CONNECTED);

        let waiter = tokio::spawn({
            let bus = bus.clone();
            async move {
                bus.wait_all(bits::WIFI_CONNECTED | bits::SD_AVAILABLE, None)
                    .await
            }
        });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        bus.set(bits::SD_AVAILABLE);
        let observed = waiter.await.unwrap().unwrap();
        assert_eq!(observed, bits::WIFI_CONNECTED | bits::SD_AVAILABLE);
    }

    #[tokio::test]
    async fn wait_any_clear_resets_matched_bits() {
        let bus = EventBus::new();
        bus.set(bits::FILE_AVAILABLE | bits::REFRESH_DONE);
        let observed = bus
            .wait_any_clear(bits::FILE_AVAILABLE, None)
            .await
            .unwrap();
        assert_eq!(observed, bits::FILE_AVAILABLE);
        assert!(!bus.any_set(bits::FILE_AVAILABLE));
        // Unrelated bits survive.
        assert!(bus.any_set(bits::REFRESH_DONE));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out() {
        let bus = EventBus::new();
        let result = bus
            .wait_any(bits::MQTT_CONNECTED, Some(Duration::from_secs(1)))
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn shutdown_wakes_a_parked_waiter() {
        let bus = Arc::new(EventBus::new());
        let waiter = tokio::spawn({
            let bus = bus.clone();
            async move {
                bus.wait_any(bits::MQTT_CONNECTED | bits::REFRESH_SHUTDOWN, None)
                    .await
            }
        });

        tokio::task::yield_now().await;
        bus.set(bits::REFRESH_SHUTDOWN);
        let observed = waiter.await.unwrap().unwrap();
        assert_eq!(observed, bits::REFRESH_SHUTDOWN);
    }
}
