//! The per-channel refresh pipeline.
//!
//! One background task per channel: wait for the catalog to be reachable,
//! paginate it, merge every page into the cache, reconcile server-side
//! deletions at the end of the cycle, bound local storage by count and by
//! free space, persist the cursor, and sleep until the next cycle. Every
//! failure is logged and absorbed; the cursor survives failed pages so the
//! next cycle resumes where this one stopped.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use easel_state::{ChannelEntry, PostKind, StorageKey, ec};

use crate::{
    Result,
    cache::{ChannelCache, MergeOutcome, safe_file_stem},
    events::{EventBus, bits},
    fsutil,
    playlist::{PlaylistArtwork, PlaylistManifest, PlaylistStore},
    settings::{ChannelOverrides, SharedSettings},
    util,
};

/// Posts fetched per catalog query.
pub const PAGE_SIZE: u32 = 32;
/// Most returned post ids tracked for reconciliation in one cycle.
pub const RECONCILE_TRACK_CAP: usize = 1024;
/// Most artwork files kept on local storage per channel.
pub const LOCAL_ARTWORK_CAP: usize = 1024;
/// Files deleted per pass when over the count cap.
pub const COUNT_EVICT_BATCH: usize = 32;
/// Files deleted per pass when under the free-space reserve.
pub const SPACE_EVICT_BATCH: usize = 16;
/// Free space the filesystem must keep.
pub const SPACE_RESERVE_BYTES: u64 = 10 * 1024 * 1024;

const BACKPRESSURE_WAIT: Duration = Duration::from_secs(60);
const BACKPRESSURE_BACKOFF: Duration = Duration::from_secs(2);

/// Reports a filesystem's free bytes, when the host can. Injected so the
/// engine skips space eviction where no probe exists.
pub type SpaceProbe = Arc<dyn Fn(&Path) -> Option<u64> + Send + Sync>;

/// The channel metadata sidecar: pagination cursor and last refresh time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelMeta {
    /// The cursor the next catalog query resumes from.
    pub cursor: Option<String>,
    /// Unix time of the last completed cycle.
    pub last_refresh: i64,
}

impl ChannelMeta {
    /// The sidecar path for a channel.
    pub fn path(channels_dir: &Path, channel_id: &str) -> PathBuf {
        channels_dir.join(format!("{}.json", safe_file_stem(channel_id)))
    }

    /// Read the sidecar; absent or unreadable files load as the default.
    pub fn load(path: &Path) -> Self {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!("discarding unparseable channel meta {}: {e}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Atomically write the sidecar.
    pub fn store(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec(self).expect("channel meta serializes");
        fsutil::write_atomic(path, &bytes)?;
        Ok(())
    }
}

/// Everything one channel's refresh task runs with.
pub struct RefreshContext {
    /// The channel id.
    pub channel_id: String,
    /// Which posts the channel shows.
    pub selector: ec::ChannelSelector,
    /// The server-side sort.
    pub sort: ec::PostSort,
    /// Where the cache and sidecars live.
    pub channels_dir: PathBuf,
    /// The channel's cache.
    pub cache: Arc<ChannelCache>,
    /// The channel's playlist sidecars.
    pub playlists: Arc<PlaylistStore>,
    /// The catalog client.
    pub client: Arc<ec::Client>,
    /// The engine bus.
    pub bus: Arc<EventBus>,
    /// Engine-wide settings.
    pub settings: Arc<SharedSettings>,
    /// This channel's overrides.
    pub overrides: ChannelOverrides,
    /// Free-space probe, when the host has one.
    pub space_probe: Option<SpaceProbe>,
}

impl RefreshContext {
    fn meta_path(&self) -> PathBuf {
        ChannelMeta::path(&self.channels_dir, &self.channel_id)
    }
}

/// What one merged page did to the cache.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    /// Posts appended to `Ci`.
    pub inserted: usize,
    /// Posts that replaced an existing entry.
    pub updated: usize,
    /// Artworks whose local file was deleted because the upstream file
    /// changed.
    pub invalidated: usize,
    /// Posts dropped because they could not be represented.
    pub skipped: usize,
}

impl MergeStats {
    fn absorb(&mut self, other: MergeStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.invalidated += other.invalidated;
        self.skipped += other.skipped;
    }
}

/// Merge one page of posts into the cache. Playlists write their sidecar
/// and merge their expanded artworks as ordinary posts.
pub fn merge_page(
    cache: &ChannelCache,
    playlists: &PlaylistStore,
    posts: &[ec::Post],
) -> MergeStats {
    let mut stats = MergeStats::default();
    for post in posts {
        stats.absorb(merge_post(cache, playlists, post));
    }
    stats
}

fn merge_post(cache: &ChannelCache, playlists: &PlaylistStore, post: &ec::Post) -> MergeStats {
    let mut stats = MergeStats::default();
    let Some(entry) = ChannelEntry::from_post(post) else {
        tracing::warn!("skipping post {} with no usable storage key", post.post_id);
        stats.skipped += 1;
        return stats;
    };

    match cache.merge_post(entry) {
        MergeOutcome::Inserted => stats.inserted += 1,
        MergeOutcome::Updated {
            artwork_changed,
            previous,
        } => {
            stats.updated += 1;
            if artwork_changed && entry.kind == PostKind::Artwork {
                invalidate_artwork(cache, &previous);
                stats.invalidated += 1;
            }
        }
    }

    if post.kind == ec::PostKind::Playlist {
        if let Err(e) = playlists.write(&manifest_from_post(post)) {
            tracing::warn!("failed to write playlist sidecar {}: {e}", post.post_id);
        }
        for inner in post.artworks.as_deref().unwrap_or_default() {
            stats.absorb(merge_post(cache, playlists, inner));
        }
    }

    stats
}

/// Delete the stale local file so the downloader re-fetches it.
fn invalidate_artwork(cache: &ChannelCache, previous: &ChannelEntry) {
    let path = cache
        .vault()
        .artwork_path(&previous.storage_key, previous.extension);
    if let Err(e) = fsutil::remove_if_exists(&path) {
        tracing::warn!("failed to delete stale artwork for {}: {e}", previous.post_id);
    }
    cache.lai_remove(previous.post_id);
}

fn manifest_from_post(post: &ec::Post) -> PlaylistManifest {
    let artworks = post
        .artworks
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(|inner| {
            let storage_key = StorageKey::parse(inner.storage_key.as_deref()?)?;
            Some(PlaylistArtwork {
                post_id: inner.post_id,
                storage_key,
                extension: inner
                    .extension
                    .as_deref()
                    .map(easel_state::Extension::from_suffix)
                    .unwrap_or_default(),
                dwell_time_ms: inner.dwell_time_ms,
                artwork_modified_at: inner.artwork_modified_at.unwrap_or(0),
            })
        })
        .collect();
    PlaylistManifest {
        post_id: post.post_id,
        total_artworks: post.total_artworks.unwrap_or(0),
        artworks,
    }
}

/// Track a page's returned post ids (including playlist-expanded ones) for
/// reconciliation. Returns false once the cap is exceeded; the caller must
/// then skip reconciliation rather than delete posts it merely stopped
/// tracking.
fn track_returned_ids(posts: &[ec::Post], ids: &mut HashSet<i32>, cap: usize) -> bool {
    for post in posts {
        if ids.len() >= cap {
            return false;
        }
        ids.insert(post.post_id);
        if let Some(inner) = post.artworks.as_deref()
            && !track_returned_ids(inner, ids, cap)
        {
            return false;
        }
    }
    true
}

/// Artworks in `Ci` whose file is missing locally.
fn missing_backlog(cache: &ChannelCache) -> usize {
    cache
        .entries_snapshot()
        .iter()
        .filter(|e| e.kind == PostKind::Artwork && !cache.lai_contains(e.post_id))
        .count()
}

fn present_artworks_oldest_first(cache: &ChannelCache) -> Vec<(ChannelEntry, PathBuf)> {
    let vault = cache.vault();
    let mut present: Vec<(ChannelEntry, PathBuf)> = cache
        .entries_snapshot()
        .into_iter()
        .filter(|e| e.kind == PostKind::Artwork)
        .filter_map(|e| {
            let path = vault.artwork_path(&e.storage_key, e.extension);
            path.is_file().then_some((e, path))
        })
        .collect();
    present.sort_by_key(|(e, _)| (e.created_at, e.post_id));
    present
}

/// Delete the oldest local artwork files until at most `cap` remain. The
/// `Ci` entries stay: an evicted artwork is still a re-fetchable
/// descriptor. Returns how many files were deleted.
pub async fn evict_by_count(cache: &ChannelCache, cap: usize, batch: usize) -> usize {
    let present = present_artworks_oldest_first(cache);
    if present.len() <= cap {
        return 0;
    }
    let excess = present.len() - cap;
    let mut deleted = 0;
    for chunk in present[..excess].chunks(batch.max(1)) {
        for (entry, path) in chunk {
            match fs::remove_file(path) {
                Ok(()) => {
                    cache.lai_remove(entry.post_id);
                    deleted += 1;
                }
                Err(e) => {
                    tracing::warn!("failed to evict artwork for {}: {e}", entry.post_id)
                }
            }
        }
        tokio::task::yield_now().await;
    }
    tracing::info!("evicted {deleted} artworks over the count cap");
    deleted
}

/// Delete oldest local artwork files until the filesystem reports at least
/// `reserve` free bytes. Returns how many files were deleted.
pub async fn evict_for_space(
    cache: &ChannelCache,
    probe: &SpaceProbe,
    reserve: u64,
    batch: usize,
) -> usize {
    let mut deleted = 0;
    loop {
        let Some(free) = probe(cache.vault().root()) else {
            return deleted;
        };
        if free >= reserve {
            return deleted;
        }
        let present = present_artworks_oldest_first(cache);
        if present.is_empty() {
            tracing::warn!("below the free-space reserve with nothing left to evict");
            return deleted;
        }
        for (entry, path) in present.iter().take(batch.max(1)) {
            match fs::remove_file(path) {
                Ok(()) => {
                    cache.lai_remove(entry.post_id);
                    deleted += 1;
                }
                Err(e) => {
                    tracing::warn!("failed to evict artwork for {}: {e}", entry.post_id)
                }
            }
        }
        tokio::task::yield_now().await;
    }
}

/// One full refresh cycle: paginate, merge, reconcile, evict, persist.
/// Page failures propagate so the task logs them; everything already
/// merged and the saved cursor survive.
pub async fn run_cycle(ctx: &RefreshContext) -> Result<()> {
    let engine_settings = ctx.settings.get();
    let resolved = ctx.overrides.resolve(&engine_settings);
    let meta_path = ctx.meta_path();
    let mut meta = ChannelMeta::load(&meta_path);

    let mut returned_ids = HashSet::new();
    let mut tracked_all = true;

    loop {
        if ctx.bus.any_set(bits::REFRESH_SHUTDOWN) {
            return Ok(());
        }

        let request = ec::QueryPostsRequest {
            selector: ctx.selector.clone(),
            sort: ctx.sort,
            cursor: meta.cursor.clone(),
            limit: PAGE_SIZE,
            pe: resolved.playlist_expansion,
        };
        let response = ctx.client.query_posts(&request).await?;

        tracked_all =
            tracked_all && track_returned_ids(&response.posts, &mut returned_ids, RECONCILE_TRACK_CAP);
        let stats = merge_page(&ctx.cache, &ctx.playlists, &response.posts);
        tracing::info!(
            "{}: merged page of {} posts ({} new, {} updated, {} invalidated)",
            ctx.channel_id,
            response.posts.len(),
            stats.inserted,
            stats.updated,
            stats.invalidated
        );

        if stats.inserted + stats.invalidated > 0 {
            ctx.bus.set(bits::DOWNLOADS_NEEDED);
        }
        ctx.cache.flush()?;

        if !response.has_more {
            meta.cursor = None;
            break;
        }
        meta.cursor = response.next_cursor.clone();
        meta.store(&meta_path)?;

        // Let the downloader catch up before pulling more pages.
        if missing_backlog(&ctx.cache) > engine_settings.download_backlog_threshold {
            match ctx
                .bus
                .wait_any(
                    bits::FILE_AVAILABLE | bits::REFRESH_SHUTDOWN,
                    Some(BACKPRESSURE_WAIT),
                )
                .await
            {
                Ok(observed) if observed & bits::REFRESH_SHUTDOWN != 0 => return Ok(()),
                Ok(_) => ctx.bus.clear(bits::FILE_AVAILABLE),
                Err(_) => tokio::time::sleep(BACKPRESSURE_BACKOFF).await,
            }
        }
    }

    if tracked_all {
        reconcile(ctx, &returned_ids);
    } else {
        tracing::warn!(
            "{}: returned ids exceeded {RECONCILE_TRACK_CAP}, skipping reconciliation",
            ctx.channel_id
        );
    }

    evict_by_count(&ctx.cache, LOCAL_ARTWORK_CAP, COUNT_EVICT_BATCH).await;
    if let Some(probe) = &ctx.space_probe {
        evict_for_space(&ctx.cache, probe, SPACE_RESERVE_BYTES, SPACE_EVICT_BATCH).await;
    }

    meta.last_refresh = util::unix_now();
    meta.store(&meta_path)?;
    ctx.cache.flush()?;
    ctx.playlists.invalidate();
    Ok(())
}

/// Drop every post the server no longer returns, deleting local files of
/// dropped artworks and sidecars of dropped playlists.
fn reconcile(ctx: &RefreshContext, returned_ids: &HashSet<i32>) {
    let removed = ctx.cache.retain_posts(returned_ids);
    if removed.is_empty() {
        return;
    }
    for entry in &removed {
        match entry.kind {
            PostKind::Artwork => {
                let path = ctx
                    .cache
                    .vault()
                    .artwork_path(&entry.storage_key, entry.extension);
                if let Err(e) = fsutil::remove_if_exists(&path) {
                    tracing::warn!("failed to delete artwork for dropped post {}: {e}", entry.post_id);
                }
            }
            PostKind::Playlist => {
                if let Err(e) = ctx.playlists.remove(entry.post_id) {
                    tracing::warn!(
                        "failed to delete sidecar for dropped playlist {}: {e}",
                        entry.post_id
                    );
                }
            }
        }
    }
    tracing::info!("{}: reconciled away {} posts", ctx.channel_id, removed.len());
}

/// The refresh task: gate on connectivity, run cycles, sleep between them
/// with second-granularity shutdown and immediate-refresh checks.
pub async fn run_refresh_task(ctx: RefreshContext) {
    loop {
        let observed = ctx
            .bus
            .wait_any(bits::MQTT_CONNECTED | bits::REFRESH_SHUTDOWN, None)
            .await
            .expect("untimed wait cannot time out");
        if observed & bits::REFRESH_SHUTDOWN != 0 {
            break;
        }

        match run_cycle(&ctx).await {
            Ok(()) => {
                ctx.bus
                    .set(bits::REFRESH_DONE | bits::CHANNEL_REFRESH_DONE);
            }
            Err(e) => {
                tracing::warn!("refresh cycle for {} failed: {e}", ctx.channel_id);
            }
        }

        let interval = ctx.overrides.resolve(&ctx.settings.get()).refresh_interval_secs;
        for _ in 0..interval {
            if ctx.bus.any_set(bits::REFRESH_SHUTDOWN) {
                tracing::debug!("refresh task for {} shutting down", ctx.channel_id);
                return;
            }
            if ctx.bus.any_set(bits::REFRESH_IMMEDIATE) {
                ctx.bus.clear(bits::REFRESH_IMMEDIATE);
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
    tracing::debug!("refresh task for {} shutting down", ctx.channel_id);
}
