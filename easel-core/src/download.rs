//! The download scheduler.
//!
//! Single-flight by design: one missing artwork is fetched at a time so
//! storage and radio contention stay bounded. Parallelism is a knob, not a
//! requirement. Selection follows play order when a navigator has shared a
//! prefetch plan, newest-first otherwise; the load tracker gates every
//! candidate.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use easel_state::{ChannelEntry, PostKind, ec};

use crate::{
    Result,
    cache::ChannelCache,
    events::{EventBus, bits},
    fsutil,
    tracker::{ErrorClass, LoadTracker},
    util,
    vault::Vault,
};

/// Urgency of a selected download, by distance from the play cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPriority {
    /// Within the next 3 positions.
    High,
    /// Within the next 10 positions.
    Medium,
    /// Further out, or no play position is known.
    Low,
}

impl DownloadPriority {
    fn from_offset(offset: usize) -> Self {
        if offset < 3 {
            DownloadPriority::High
        } else if offset < 10 {
            DownloadPriority::Medium
        } else {
            DownloadPriority::Low
        }
    }
}

/// The play-order artwork sequence a navigator shares with the downloader,
/// starting at its current position. Absent until playback starts.
#[derive(Default)]
pub struct PrefetchPlan {
    inner: Mutex<Option<Vec<i32>>>,
}

impl PrefetchPlan {
    /// Create an empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the post-id walk starting at the current play position.
    pub fn set(&self, post_ids: Vec<i32>) {
        *self.inner.lock().unwrap() = Some(post_ids);
    }

    /// Drop the plan; selection falls back to newest-first.
    pub fn clear(&self) {
        *self.inner.lock().unwrap() = None;
    }

    fn snapshot(&self) -> Option<Vec<i32>> {
        self.inner.lock().unwrap().clone()
    }
}

/// Fetches missing artworks for the active channel.
pub struct Downloader {
    cache: Arc<ChannelCache>,
    vault: Vault,
    tracker: LoadTracker,
    client: Arc<ec::Client>,
    bus: Arc<EventBus>,
    plan: Arc<PrefetchPlan>,
}

impl Downloader {
    /// Create a downloader for a channel's cache.
    pub fn new(
        cache: Arc<ChannelCache>,
        client: Arc<ec::Client>,
        bus: Arc<EventBus>,
        plan: Arc<PrefetchPlan>,
    ) -> Self {
        let vault = cache.vault().clone();
        Self {
            cache,
            tracker: LoadTracker::new(vault.clone()),
            vault,
            client,
            bus,
            plan,
        }
    }

    /// Pick the next artwork to fetch, or `None` when nothing qualifies.
    ///
    /// A candidate must be an artwork in `Ci`, missing from `LAi`, not
    /// marked permanently unavailable, and past its tracker backoff.
    pub fn select_next(&self, now: i64) -> Option<(ChannelEntry, DownloadPriority)> {
        if let Some(plan) = self.plan.snapshot() {
            return self.select_in_play_order(&plan, now);
        }
        self.select_newest_first(now)
    }

    fn select_in_play_order(
        &self,
        plan: &[i32],
        now: i64,
    ) -> Option<(ChannelEntry, DownloadPriority)> {
        for (offset, post_id) in plan.iter().enumerate() {
            if self.cache.lai_contains(*post_id) {
                continue;
            }
            let Some(index) = self.cache.find_by_post_id(*post_id) else {
                continue;
            };
            let Some(entry) = self.cache.get_entry(index) else {
                continue;
            };
            if entry.kind != PostKind::Artwork {
                continue;
            }
            if !self.candidate_allowed(&entry, now) {
                continue;
            }
            return Some((entry, DownloadPriority::from_offset(offset)));
        }
        None
    }

    fn select_newest_first(&self, now: i64) -> Option<(ChannelEntry, DownloadPriority)> {
        let mut candidates: Vec<ChannelEntry> = self
            .cache
            .entries_snapshot()
            .into_iter()
            .filter(|e| e.kind == PostKind::Artwork && !self.cache.lai_contains(e.post_id))
            .collect();
        candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        candidates
            .into_iter()
            .find(|e| self.candidate_allowed(e, now))
            .map(|e| (e, DownloadPriority::Low))
    }

    /// Whether any missing artwork could still be fetched, now or after
    /// its backoff. Terminal and permanently-unavailable artworks do not
    /// count: a backlog of only those is drained.
    fn backlog_retryable(&self) -> bool {
        let mut cursor = 0;
        while let Ok((entry, next)) = self.cache.next_missing(cursor) {
            cursor = next;
            let path = self.vault.artwork_path(&entry.storage_key, entry.extension);
            if Vault::marker_path(&path).exists() {
                continue;
            }
            match self.tracker.read(&entry.storage_key) {
                Some(record) if record.terminal => continue,
                _ => return true,
            }
        }
        false
    }

    fn candidate_allowed(&self, entry: &ChannelEntry, now: i64) -> bool {
        if !self.tracker.can_download_now(&entry.storage_key, now) {
            return false;
        }
        let path = self.vault.artwork_path(&entry.storage_key, entry.extension);
        !Vault::marker_path(&path).exists()
    }

    /// Fetch one artwork end to end. Success places the file atomically,
    /// joins `LAi`, clears tracker state, and signals the bus; failure is
    /// recorded in the tracker, with a `.404` marker on permanent ones.
    pub async fn fetch_one(&self, entry: &ChannelEntry, priority: DownloadPriority) {
        let url = self.client.artwork_url(
            &entry.storage_key.to_canonical_string(),
            entry.extension.suffix(),
        );
        tracing::debug!(
            "downloading post {} ({:?}) from {url}",
            entry.post_id,
            priority
        );

        match self.client.fetch_artwork(&url).await {
            Ok(bytes) => {
                if let Err(e) = self.apply_fetched(entry, &bytes) {
                    tracing::warn!("failed to store artwork for post {}: {e}", entry.post_id);
                }
            }
            Err(e) => {
                let status = e.http_status();
                tracing::warn!(
                    "download failed for post {} (status {status:?}): {e}",
                    entry.post_id
                );
                self.apply_failure(entry, &e.to_string(), status, util::unix_now());
            }
        }
    }

    fn apply_fetched(&self, entry: &ChannelEntry, bytes: &[u8]) -> Result<()> {
        let path = self.vault.artwork_path(&entry.storage_key, entry.extension);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        fsutil::write_atomic(&path, bytes)?;

        self.cache.lai_add(entry.post_id);
        if let Err(e) = self.tracker.clear_download_failures(&entry.storage_key) {
            tracing::warn!("failed to clear tracker for {}: {e}", entry.storage_key);
        }
        self.bus.set(bits::FILE_AVAILABLE);
        self.cache.schedule_save();
        tracing::info!("downloaded artwork for post {}", entry.post_id);
        Ok(())
    }

    fn apply_failure(&self, entry: &ChannelEntry, reason: &str, status: Option<u16>, now: i64) {
        match self
            .tracker
            .record_download_failure(&entry.storage_key, reason, status, now)
        {
            Ok(record) => {
                if record.error_class == ErrorClass::Permanent {
                    let path = self.vault.artwork_path(&entry.storage_key, entry.extension);
                    if let Err(e) = write_marker(&path) {
                        tracing::warn!("failed to write marker for {}: {e}", entry.storage_key);
                    }
                }
            }
            Err(e) => {
                tracing::warn!("failed to record failure for {}: {e}", entry.storage_key);
            }
        }
    }
}

fn write_marker(artwork_path: &std::path::Path) -> std::io::Result<()> {
    let marker = Vault::marker_path(artwork_path);
    if let Some(parent) = marker.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&marker, [])
}

/// The download task: park until work, storage, and connectivity line up,
/// then fetch missing artworks one at a time. `DOWNLOADS_NEEDED` is cleared
/// only once a drain finds nothing left to fetch.
pub async fn run_download_task(downloader: Downloader) {
    let bus = downloader.bus.clone();
    loop {
        let observed = bus
            .wait_all_or(
                bits::DOWNLOADS_NEEDED | bits::SD_AVAILABLE | bits::WIFI_CONNECTED,
                bits::REFRESH_SHUTDOWN,
                None,
            )
            .await
            .expect("untimed wait cannot time out");
        if observed & bits::REFRESH_SHUTDOWN != 0 {
            tracing::debug!("download task shutting down");
            return;
        }

        match downloader.select_next(util::unix_now()) {
            Some((entry, priority)) => {
                downloader.fetch_one(&entry, priority).await;
                // Let other bus clients run between fetches.
                tokio::task::yield_now().await;
            }
            None if !downloader.backlog_retryable() => {
                bus.clear(bits::DOWNLOADS_NEEDED);
                tracing::debug!("download backlog drained");
            }
            None => {
                // Everything still missing is backing off; check again
                // shortly, or sooner if shutdown arrives.
                if bus
                    .wait_any(bits::REFRESH_SHUTDOWN, Some(Duration::from_secs(1)))
                    .await
                    .is_ok()
                {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use easel_state::{Extension, StorageKey};

    use crate::events::EventBus;

    use super::*;

    fn key(n: u8) -> StorageKey {
        let mut bytes = [0u8; 16];
        bytes[15] = n;
        StorageKey::from_bytes(bytes)
    }

    fn artwork(post_id: i32, created_at: i64) -> ChannelEntry {
        ChannelEntry {
            post_id,
            kind: PostKind::Artwork,
            extension: Extension::Webp,
            filter_flags: 0,
            created_at,
            metadata_modified_at: created_at,
            artwork_modified_at: created_at,
            dwell_time_ms: 0,
            total_artworks: 0,
            storage_key: key(post_id as u8),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        downloader: Downloader,
        cache: Arc<ChannelCache>,
        plan: Arc<PrefetchPlan>,
        tracker: LoadTracker,
        vault: Vault,
        bus: Arc<EventBus>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let vault = Vault::new(dir.path().join("vault"));
        let cache = ChannelCache::open("main", dir.path(), vault.clone(), bus.clone());
        let plan = Arc::new(PrefetchPlan::new());
        let client = Arc::new(ec::Client::new(
            "http://127.0.0.1:9",
            "dev",
            "token",
            Duration::from_secs(1),
        ));
        let downloader = Downloader::new(cache.clone(), client, bus.clone(), plan.clone());
        Fixture {
            _dir: dir,
            tracker: LoadTracker::new(vault.clone()),
            downloader,
            cache,
            plan,
            vault,
            bus,
        }
    }

    #[test]
    fn newest_first_selection_without_a_plan() {
        let fx = fixture();
        fx.cache.merge_post(artwork(1, 100));
        fx.cache.merge_post(artwork(2, 300));
        fx.cache.merge_post(artwork(3, 200));

        let (entry, priority) = fx.downloader.select_next(0).unwrap();
        assert_eq!(entry.post_id, 2);
        assert_eq!(priority, DownloadPriority::Low);

        // Available artworks are not reselected.
        fx.cache.lai_add(2);
        let (entry, _) = fx.downloader.select_next(0).unwrap();
        assert_eq!(entry.post_id, 3);
    }

    #[test]
    fn play_order_selection_assigns_priority_tiers() {
        let fx = fixture();
        for id in 1..=15 {
            fx.cache.merge_post(artwork(id, id as i64));
        }
        fx.plan.set((1..=15).collect());

        let (entry, priority) = fx.downloader.select_next(0).unwrap();
        assert_eq!(entry.post_id, 1);
        assert_eq!(priority, DownloadPriority::High);

        for id in 1..=4 {
            fx.cache.lai_add(id);
        }
        let (entry, priority) = fx.downloader.select_next(0).unwrap();
        assert_eq!(entry.post_id, 5);
        assert_eq!(priority, DownloadPriority::Medium);

        for id in 5..=11 {
            fx.cache.lai_add(id);
        }
        let (entry, priority) = fx.downloader.select_next(0).unwrap();
        assert_eq!(entry.post_id, 12);
        assert_eq!(priority, DownloadPriority::Low);
    }

    #[test]
    fn tracker_and_marker_gate_selection() {
        let fx = fixture();
        let a = artwork(1, 100);
        let b = artwork(2, 200);
        fx.cache.merge_post(a);
        fx.cache.merge_post(b);

        // Newest (2) is backing off, so the older one is picked.
        fx.tracker
            .record_download_failure(&b.storage_key, "timeout", None, 1000)
            .unwrap();
        let (entry, _) = fx.downloader.select_next(1000).unwrap();
        assert_eq!(entry.post_id, 1);

        // Once the backoff passes, the newest wins again.
        let (entry, _) = fx.downloader.select_next(2000).unwrap();
        assert_eq!(entry.post_id, 2);

        // A `.404` marker removes a candidate outright.
        let path = fx.vault.artwork_path(&b.storage_key, b.extension);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(Vault::marker_path(&path), []).unwrap();
        let (entry, _) = fx.downloader.select_next(2000).unwrap();
        assert_eq!(entry.post_id, 1);
    }

    #[test]
    fn nothing_to_do_when_everything_is_available() {
        let fx = fixture();
        fx.cache.merge_post(artwork(1, 100));
        fx.cache.lai_add(1);
        assert!(fx.downloader.select_next(0).is_none());
    }

    #[test]
    fn apply_fetched_places_the_file_and_updates_state() {
        let fx = fixture();
        let entry = artwork(1, 100);
        fx.cache.merge_post(entry);
        fx.tracker
            .record_download_failure(&entry.storage_key, "timeout", None, 100)
            .unwrap();

        fx.downloader.apply_fetched(&entry, b"riff-bytes").unwrap();

        let path = fx.vault.artwork_path(&entry.storage_key, entry.extension);
        assert_eq!(std::fs::read(&path).unwrap(), b"riff-bytes");
        assert!(fx.cache.lai_contains(1));
        assert!(fx.bus.any_set(bits::FILE_AVAILABLE | bits::SAVE_SCHEDULED));
        assert!(fx.tracker.can_download_now(&entry.storage_key, 100));
    }

    #[test]
    fn permanent_failure_writes_the_marker() {
        let fx = fixture();
        let entry = artwork(1, 100);
        fx.cache.merge_post(entry);

        fx.downloader
            .apply_failure(&entry, "gone", Some(410), 1000);

        let path = fx.vault.artwork_path(&entry.storage_key, entry.extension);
        assert!(Vault::marker_path(&path).exists());
        assert!(fx.downloader.select_next(10_000).is_none());
    }

    #[test]
    fn transient_failure_backs_off_without_a_marker() {
        let fx = fixture();
        let entry = artwork(1, 100);
        fx.cache.merge_post(entry);

        fx.downloader.apply_failure(&entry, "503", Some(503), 1000);

        let path = fx.vault.artwork_path(&entry.storage_key, entry.extension);
        assert!(!Vault::marker_path(&path).exists());
        assert!(fx.downloader.select_next(1000).is_none());
        assert!(fx.downloader.select_next(1002).is_some());
    }
}
