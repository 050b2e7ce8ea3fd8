//! Per-artwork failure sidecars (LTF files).
//!
//! A tracker records how often an artwork failed to load or download, when
//! it may be retried, and whether it has been given up on. A missing or
//! unparseable tracker always permits the download: terminal state only
//! exists in a well-formed file.

use std::fs;

use serde::{Deserialize, Serialize};

use easel_state::StorageKey;

use crate::{Result, fsutil, vault::Vault};

/// Load failures at which an artwork becomes terminal.
pub const MAX_LOAD_ATTEMPTS: u32 = 3;

/// First transient-failure backoff, seconds.
pub const BACKOFF_INITIAL_SECS: i64 = 1;
/// Backoff growth per transient failure.
pub const BACKOFF_MULTIPLIER: i64 = 2;
/// Ceiling on the exponential backoff, seconds.
pub const BACKOFF_CAP_SECS: i64 = 30;
/// Transient failures after which the long cooldown applies.
pub const BACKOFF_COOLDOWN_AFTER: u32 = 5;
/// The long cooldown, seconds.
pub const BACKOFF_COOLDOWN_SECS: i64 = 300;

/// Longest stored failure reason.
const MAX_REASON_LEN: usize = 31;

/// How a remote failure was classified at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// No failure recorded.
    #[default]
    None,
    /// Worth retrying: timeouts, 5xx, connection loss.
    Transient,
    /// Not worth retrying: the upstream said no.
    Permanent,
}

impl ErrorClass {
    /// Classify a download failure from its HTTP status, when one exists.
    /// Anything without a status (timeouts, connection loss) is transient.
    pub fn from_http_status(status: Option<u16>) -> Self {
        match status {
            Some(403 | 404 | 410) => ErrorClass::Permanent,
            _ => ErrorClass::Transient,
        }
    }
}

/// The contents of one LTF sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerRecord {
    /// Load (decode/display) failures; capped at [`MAX_LOAD_ATTEMPTS`].
    pub attempts: u32,
    /// Transient download failures since the last success.
    pub download_attempts: u32,
    /// Whether the artwork has been given up on.
    pub terminal: bool,
    /// Unix time of the most recent failure.
    pub last_failure: i64,
    /// Unix time before which downloads are not offered.
    pub retry_after: i64,
    /// Classification of the most recent failure.
    pub error_class: ErrorClass,
    /// Short human-readable reason, at most 31 chars.
    pub reason: String,
}

/// Reads and writes LTF sidecars under a vault.
#[derive(Debug, Clone)]
pub struct LoadTracker {
    vault: Vault,
}

impl LoadTracker {
    /// Create a tracker over the vault.
    pub fn new(vault: Vault) -> Self {
        Self { vault }
    }

    /// The stored record for a key, if a well-formed one exists.
    pub fn read(&self, key: &StorageKey) -> Option<TrackerRecord> {
        let bytes = fs::read(self.vault.tracker_path(key)).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("discarding unparseable tracker for {key}: {e}");
                None
            }
        }
    }

    fn write(&self, key: &StorageKey, record: &TrackerRecord) -> Result<()> {
        let path = self.vault.tracker_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec(record).expect("tracker record serializes");
        fsutil::write_atomic(&path, &bytes)?;
        Ok(())
    }

    /// Record a failure to load (decode/display) the artwork. Three strikes
    /// make it terminal.
    pub fn record_load_failure(
        &self,
        key: &StorageKey,
        reason: &str,
        now: i64,
    ) -> Result<TrackerRecord> {
        let mut record = self.read(key).unwrap_or_default();
        record.attempts = (record.attempts + 1).min(MAX_LOAD_ATTEMPTS);
        record.last_failure = now;
        record.reason = truncate_reason(reason);
        if record.attempts >= MAX_LOAD_ATTEMPTS {
            record.terminal = true;
        }
        self.write(key, &record)?;
        Ok(record)
    }

    /// Record a failed download attempt. Permanent failures are terminal
    /// immediately; transient ones back off exponentially, with a long
    /// cooldown once they keep happening.
    pub fn record_download_failure(
        &self,
        key: &StorageKey,
        reason: &str,
        http_status: Option<u16>,
        now: i64,
    ) -> Result<TrackerRecord> {
        let class = ErrorClass::from_http_status(http_status);
        let mut record = self.read(key).unwrap_or_default();
        record.last_failure = now;
        record.error_class = class;
        record.reason = truncate_reason(reason);

        match class {
            ErrorClass::Permanent => {
                record.terminal = true;
            }
            ErrorClass::Transient | ErrorClass::None => {
                record.download_attempts += 1;
                record.retry_after = now + backoff_secs(record.download_attempts);
            }
        }

        self.write(key, &record)?;
        Ok(record)
    }

    /// Whether the downloader may fetch this artwork right now.
    pub fn can_download_now(&self, key: &StorageKey, now: i64) -> bool {
        match self.read(key) {
            None => true,
            Some(record) => !record.terminal && record.retry_after <= now,
        }
    }

    /// Forget everything recorded about a key.
    pub fn clear(&self, key: &StorageKey) -> Result<()> {
        match fs::remove_file(self.vault.tracker_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reset the download-related fields after a successful fetch. Load
    /// failure history is kept; a record holding nothing else is deleted
    /// outright.
    pub fn clear_download_failures(&self, key: &StorageKey) -> Result<()> {
        let Some(mut record) = self.read(key) else {
            return Ok(());
        };
        if record.attempts == 0 {
            return self.clear(key);
        }
        record.download_attempts = 0;
        record.retry_after = 0;
        record.error_class = ErrorClass::None;
        self.write(key, &record)
    }
}

fn backoff_secs(download_attempts: u32) -> i64 {
    if download_attempts > BACKOFF_COOLDOWN_AFTER {
        return BACKOFF_COOLDOWN_SECS;
    }
    let exp = BACKOFF_MULTIPLIER.pow(download_attempts.saturating_sub(1));
    (BACKOFF_INITIAL_SECS * exp).min(BACKOFF_CAP_SECS)
}

fn truncate_reason(reason: &str) -> String {
    let mut reason = reason.to_string();
    if reason.len() > MAX_REASON_LEN {
        let mut end = MAX_REASON_LEN;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}
