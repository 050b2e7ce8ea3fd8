//! The process-wide set of live caches and the debounced flush task.
//!
//! Both are explicit handles owned by the engine, not globals, so tests
//! can run independent engines side by side.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    Error, Result,
    cache::ChannelCache,
    events::{EventBus, bits},
};

/// How many caches may be live at once.
pub const MAX_REGISTERED_CACHES: usize = 8;

/// How long after the last `schedule_save()` the flush fires.
pub const FLUSH_DEBOUNCE: Duration = Duration::from_secs(2);

/// A bounded set of live channel caches.
pub struct CacheRegistry {
    caches: Mutex<Vec<Arc<ChannelCache>>>,
}

impl CacheRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            caches: Mutex::new(Vec::with_capacity(MAX_REGISTERED_CACHES)),
        }
    }

    /// Add a cache. Fails with [`Error::OutOfMemory`] when all slots are
    /// taken, and with [`Error::InvalidArgument`] when the channel is
    /// already registered.
    pub fn register(&self, cache: Arc<ChannelCache>) -> Result<()> {
        let mut caches = self.caches.lock().unwrap();
        if caches.iter().any(|c| c.channel_id() == cache.channel_id()) {
            return Err(Error::InvalidArgument("channel already registered"));
        }
        if caches.len() >= MAX_REGISTERED_CACHES {
            return Err(Error::OutOfMemory);
        }
        caches.push(cache);
        Ok(())
    }

    /// Remove a channel's cache. Returns whether it was present.
    pub fn unregister(&self, channel_id: &str) -> bool {
        let mut caches = self.caches.lock().unwrap();
        let before = caches.len();
        caches.retain(|c| c.channel_id() != channel_id);
        caches.len() != before
    }

    /// The cache for a channel, if registered.
    pub fn find(&self, channel_id: &str) -> Option<Arc<ChannelCache>> {
        self.caches
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.channel_id() == channel_id)
            .cloned()
    }

    /// Sum of `|LAi|` over every registered cache.
    pub fn get_total_available(&self) -> usize {
        self.caches
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.available_count())
            .sum()
    }

    /// Flush every cache whose dirty flag is set. Failures are logged; the
    /// dirty flag survives for the next tick.
    pub fn flush_dirty(&self) {
        let caches = self.caches.lock().unwrap().clone();
        for cache in caches {
            if !cache.is_dirty() {
                continue;
            }
            if let Err(e) = cache.flush() {
                tracing::warn!("failed to flush cache for {}: {e}", cache.channel_id());
            }
        }
    }
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The flush task: every `schedule_save()` arms (or re-arms) a one-shot
/// debounce window; when a window closes without another save request, all
/// dirty caches are flushed. Shutdown flushes once more and exits.
pub async fn run_flush_task(registry: Arc<CacheRegistry>, bus: Arc<EventBus>) {
    loop {
        let observed = bus
            .wait_any(bits::SAVE_SCHEDULED | bits::REFRESH_SHUTDOWN, None)
            .await
            .expect("untimed wait cannot time out");
        if observed & bits::REFRESH_SHUTDOWN != 0 {
            break;
        }
        bus.clear(bits::SAVE_SCHEDULED);

        // Debounce window: another save request re-arms the timer.
        loop {
            match bus
                .wait_any(
                    bits::SAVE_SCHEDULED | bits::REFRESH_SHUTDOWN,
                    Some(FLUSH_DEBOUNCE),
                )
                .await
            {
                Ok(observed) if observed & bits::REFRESH_SHUTDOWN != 0 => {
                    registry.flush_dirty();
                    return;
                }
                Ok(_) => bus.clear(bits::SAVE_SCHEDULED),
                Err(_) => break,
            }
        }

        registry.flush_dirty();
    }

    registry.flush_dirty();
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::vault::Vault;

    use super::*;

    fn open_cache(dir: &Path, channel_id: &str, bus: Arc<EventBus>) -> Arc<ChannelCache> {
        ChannelCache::open(channel_id, dir, Vault::new(dir.join("vault")), bus)
    }

    #[test]
    fn registry_is_bounded_and_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let registry = CacheRegistry::new();

        for i in 0..MAX_REGISTERED_CACHES {
            let cache = open_cache(dir.path(), &format!("ch{i}"), bus.clone());
            registry.register(cache).unwrap();
        }

        let extra = open_cache(dir.path(), "overflow", bus.clone());
        assert!(matches!(registry.register(extra), Err(Error::OutOfMemory)));

        let dup = open_cache(dir.path(), "ch0", bus.clone());
        assert!(matches!(
            registry.register(dup),
            Err(Error::InvalidArgument(_))
        ));

        assert!(registry.unregister("ch0"));
        assert!(!registry.unregister("ch0"));
        assert!(registry.find("ch1").is_some());
        assert!(registry.find("ch0").is_none());
    }

    #[test]
    fn total_available_sums_over_caches() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let registry = CacheRegistry::new();

        let a = open_cache(dir.path(), "a", bus.clone());
        let b = open_cache(dir.path(), "b", bus.clone());
        a.lai_add(1);
        a.lai_add(2);
        b.lai_add(7);
        registry.register(a).unwrap();
        registry.register(b).unwrap();

        assert_eq!(registry.get_total_available(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_task_debounces_and_flushes_dirty_caches() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(CacheRegistry::new());

        let cache = open_cache(dir.path(), "a", bus.clone());
        registry.register(cache.clone()).unwrap();

        let task = tokio::spawn(run_flush_task(registry.clone(), bus.clone()));
        tokio::task::yield_now().await;

        cache.lai_add(1);
        cache.schedule_save();
        assert!(cache.is_dirty());

        // Within the window another save re-arms the timer.
        tokio::time::sleep(Duration::from_secs(1)).await;
        cache.lai_add(2);
        cache.schedule_save();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(cache.is_dirty());

        // Once the window closes the cache hits the disk.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!cache.is_dirty());
        assert!(dir.path().join("a.cache").exists());

        bus.set(bits::REFRESH_SHUTDOWN);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_a_window_still_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(CacheRegistry::new());

        let cache = open_cache(dir.path(), "a", bus.clone());
        registry.register(cache.clone()).unwrap();

        let task = tokio::spawn(run_flush_task(registry.clone(), bus.clone()));
        tokio::task::yield_now().await;

        cache.lai_add(1);
        cache.schedule_save();
        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.set(bits::REFRESH_SHUTDOWN);
        task.await.unwrap();
        assert!(!cache.is_dirty());
    }
}
