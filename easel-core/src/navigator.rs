//! Deterministic playlist-aware navigation.
//!
//! The cursor is a `(p, q)` pair: `p` indexes the channel's play order,
//! `q` indexes within a playlist post (always 0 elsewhere). Random order is
//! a Fisher-Yates shuffle driven by PCG-32, so every device that shares a
//! channel, a global seed, and a synchronized effective seed walks the same
//! sequence. Live Mode goes further and pins the cursor to wall-clock time.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand_pcg::Pcg32;
use serde::{Deserialize, Serialize};

use easel_state::{ChannelEntry, Extension, PostKind, StorageKey};

use crate::{
    Error, Result,
    cache::ChannelCache,
    playlist::{PlaylistManifest, PlaylistStore},
    settings::{ChannelSettings, DEFAULT_DWELL_MS},
    util,
};

/// How the channel's play order is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderMode {
    /// The order the server returned posts in.
    #[default]
    Server,
    /// By `created_at` descending, stable on ties.
    Created,
    /// Deterministically shuffled.
    Random,
}

/// One displayable artwork, resolved from the cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayItem {
    /// The artwork's post id; for playlist items, the inner artwork's.
    pub post_id: i32,
    /// The enclosing playlist's post id, when the item came from one.
    pub playlist_post_id: Option<i32>,
    /// The artwork's storage key.
    pub storage_key: StorageKey,
    /// The artwork's file format.
    pub extension: Extension,
    /// The dwell time after the full cascade, milliseconds.
    pub dwell_ms: u32,
    /// The order position the item sits at.
    pub p: usize,
    /// The within-post position the item sits at.
    pub q: usize,
}

struct LiveSlot {
    p: usize,
    q: usize,
    start_ms: i64,
    dwell_ms: u32,
}

struct LiveSchedule {
    slots: Vec<LiveSlot>,
    cycle_ms: i64,
}

/// The deterministic `(p, q)` cursor over a channel.
pub struct Navigator {
    cache: Arc<ChannelCache>,
    playlists: Arc<PlaylistStore>,
    settings: ChannelSettings,
    effective_seed: u32,

    entries: Vec<ChannelEntry>,
    order_indices: Vec<usize>,
    order_dirty: bool,

    live: Option<LiveSchedule>,
    live_dirty: bool,

    p: usize,
    q: usize,
}

impl Navigator {
    /// Create a navigator. The play order builds lazily on first use.
    pub fn new(
        cache: Arc<ChannelCache>,
        playlists: Arc<PlaylistStore>,
        settings: ChannelSettings,
        effective_seed: u32,
    ) -> Self {
        Self {
            cache,
            playlists,
            settings,
            effective_seed,
            entries: Vec::new(),
            order_indices: Vec::new(),
            order_dirty: true,
            live: None,
            live_dirty: true,
            p: 0,
            q: 0,
        }
    }

    /// The current order position.
    pub fn position(&self) -> (usize, usize) {
        (self.p, self.q)
    }

    /// The number of order positions.
    pub fn order_count(&mut self) -> usize {
        self.ensure_order();
        self.order_indices.len()
    }

    /// Mark everything stale after channel data changed (a refresh
    /// completed); the next call rebuilds.
    pub fn invalidate(&mut self) {
        self.order_dirty = true;
        self.live = None;
        self.live_dirty = true;
    }

    /// Reseed the shuffle from the current effective seed. No-op outside
    /// Random order.
    pub fn request_reshuffle(&mut self, effective_seed: u32) {
        if self.settings.order != OrderMode::Random {
            return;
        }
        self.effective_seed = effective_seed;
        self.invalidate();
        self.p = 0;
        self.q = 0;
    }

    /// Switch the order mode.
    pub fn set_order(&mut self, order: OrderMode) {
        if self.settings.order != order {
            self.settings.order = order;
            self.invalidate();
        }
    }

    /// Change the playlist expansion factor.
    pub fn set_playlist_expansion(&mut self, pe: u32) {
        if self.settings.playlist_expansion != pe {
            self.settings.playlist_expansion = pe;
            self.invalidate();
        }
    }

    /// Toggle within-playlist shuffling.
    pub fn set_randomize_playlists(&mut self, randomize: bool) {
        if self.settings.randomize_playlists != randomize {
            self.settings.randomize_playlists = randomize;
            self.invalidate();
        }
    }

    /// Change the channel dwell override.
    pub fn set_channel_dwell_ms(&mut self, dwell_ms: u32) {
        if self.settings.channel_dwell_ms != dwell_ms {
            self.settings.channel_dwell_ms = dwell_ms;
            self.live = None;
            self.live_dirty = true;
        }
    }

    /// Toggle Live Mode.
    pub fn set_live_mode(&mut self, live: bool) {
        if self.settings.live_mode != live {
            self.settings.live_mode = live;
            self.live = None;
            self.live_dirty = true;
        }
    }

    /// The item under the cursor, skipping forward past holes up to one
    /// full cycle. In Live Mode the cursor is first aligned to the wall
    /// clock. [`Error::NotFound`] when nothing in the channel is available.
    pub fn current(&mut self) -> Result<PlayItem> {
        self.current_at(util::unix_now_ms())
    }

    /// [`Navigator::current`] with an explicit wall clock, for alignment
    /// and tests.
    pub fn current_at(&mut self, now_ms: i64) -> Result<PlayItem> {
        self.ensure_order();
        if self.settings.live_mode {
            self.align_to_wall_clock(now_ms);
        }
        self.scan_forward(self.p, self.q)
    }

    /// Advance the cursor and return the next available item, wrapping
    /// forward past the end of the order.
    pub fn next(&mut self) -> Result<PlayItem> {
        self.ensure_order();
        let (p, q) = self.advance(self.p, self.q);
        self.scan_forward(p, q)
    }

    /// Retreat the cursor and return the previous available item. Within a
    /// playlist this goes `q - 1`; crossing a post boundary enters the
    /// previous post's playlist at its last item.
    pub fn prev(&mut self) -> Result<PlayItem> {
        self.ensure_order();
        let (p, q) = self.retreat(self.p, self.q);
        self.scan_backward(p, q)
    }

    /// One full cycle of artwork post ids in play order, starting at the
    /// cursor. Holes are included; this is the downloader's walk, and the
    /// holes are exactly what it wants to fill.
    pub fn prefetch_order(&mut self) -> Vec<i32> {
        self.ensure_order();
        let total = self.total_positions();
        let mut ids = Vec::with_capacity(total);
        let (mut p, mut q) = (self.p, self.q);
        let max_steps = total + self.order_indices.len();
        for _ in 0..max_steps {
            if ids.len() == total {
                break;
            }
            if let Some(item) = self.item_at(p, q) {
                ids.push(item.post_id);
            }
            (p, q) = self.advance(p, q);
        }
        ids
    }

    /// Move the cursor. Out-of-bounds coordinates clamp to 0.
    pub fn jump(&mut self, p: usize, q: usize) {
        self.ensure_order();
        self.p = if p < self.order_indices.len() { p } else { 0 };
        self.q = if q < self.effective_size(self.p) { q } else { 0 };
    }

    fn ensure_order(&mut self) {
        if !self.order_dirty {
            return;
        }
        self.entries = self.cache.entries_snapshot();
        let mut indices: Vec<usize> = (0..self.entries.len()).collect();
        match self.settings.order {
            OrderMode::Server => {}
            OrderMode::Created => {
                // Stable sort keeps Ci order on created_at ties.
                indices.sort_by(|a, b| {
                    self.entries[*b].created_at.cmp(&self.entries[*a].created_at)
                });
            }
            OrderMode::Random => {
                // The stream carries the channel identity: channels that
                // share every seed still walk independent permutations,
                // while devices on the same channel walk the same one.
                let channel = crc32fast::hash(self.cache.channel_id().as_bytes());
                let state = (self.effective_seed ^ self.settings.global_seed) as u64;
                let stream = (self.settings.global_seed ^ channel) as u64;
                let mut rng = Pcg32::new(state, stream);
                indices.shuffle(&mut rng);
            }
        }
        self.order_indices = indices;
        self.order_dirty = false;
        self.live = None;
        self.live_dirty = true;

        if self.p >= self.order_indices.len() {
            self.p = 0;
            self.q = 0;
        } else if self.q >= self.effective_size(self.p).max(1) {
            self.q = 0;
        }
    }

    fn entry_at(&self, p: usize) -> Option<&ChannelEntry> {
        self.order_indices.get(p).map(|i| &self.entries[*i])
    }

    fn manifest_at(&self, p: usize) -> Option<Arc<PlaylistManifest>> {
        let entry = self.entry_at(p)?;
        if entry.kind != PostKind::Playlist {
            return None;
        }
        self.playlists.load(entry.post_id)
    }

    /// Positions a post contributes: `min(loaded, PE)` for playlists with
    /// `PE = 0` uncapped, 1 for artworks, 0 for playlists with nothing
    /// loaded.
    fn effective_size(&self, p: usize) -> usize {
        let Some(entry) = self.entry_at(p) else {
            return 0;
        };
        match entry.kind {
            PostKind::Artwork => 1,
            PostKind::Playlist => {
                let loaded = self
                    .manifest_at(p)
                    .map(|m| m.artworks.len())
                    .unwrap_or(0);
                let pe = self.settings.playlist_expansion as usize;
                if pe == 0 { loaded } else { loaded.min(pe) }
            }
        }
    }

    /// Map `q` to an artwork index within a playlist. With randomization
    /// on, each `q` draws from its own PCG stream so the mapping is stable
    /// per `(effective_seed, playlist, q)`.
    fn playlist_artwork_index(&self, playlist_post_id: i32, q: usize, size: usize) -> usize {
        if !self.settings.randomize_playlists || size <= 1 {
            return q;
        }
        let seed = (self.effective_seed ^ playlist_post_id as u32) as u64;
        let mut rng = Pcg32::new(seed, q as u64);
        (rand::RngCore::next_u32(&mut rng) as usize) % size
    }

    fn item_at(&self, p: usize, q: usize) -> Option<PlayItem> {
        let entry = self.entry_at(p)?;
        match entry.kind {
            PostKind::Artwork => {
                if q != 0 {
                    return None;
                }
                Some(PlayItem {
                    post_id: entry.post_id,
                    playlist_post_id: None,
                    storage_key: entry.storage_key,
                    extension: entry.extension,
                    dwell_ms: self.cascade_dwell(entry.dwell_time_ms, 0),
                    p,
                    q,
                })
            }
            PostKind::Playlist => {
                let manifest = self.manifest_at(p)?;
                let size = self.effective_size(p);
                if q >= size {
                    return None;
                }
                let index = self.playlist_artwork_index(entry.post_id, q, size);
                let artwork = manifest.artworks.get(index)?;
                Some(PlayItem {
                    post_id: artwork.post_id,
                    playlist_post_id: Some(entry.post_id),
                    storage_key: artwork.storage_key,
                    extension: artwork.extension,
                    dwell_ms: self.cascade_dwell(artwork.dwell_time_ms, entry.dwell_time_ms),
                    p,
                    q,
                })
            }
        }
    }

    /// Outermost non-zero wins: global override, channel override, the
    /// item's own dwell, the enclosing post's dwell, then the fallback.
    fn cascade_dwell(&self, item_dwell_ms: u32, post_dwell_ms: u32) -> u32 {
        [
            self.settings.global_dwell_ms,
            self.settings.channel_dwell_ms,
            item_dwell_ms,
            post_dwell_ms,
        ]
        .into_iter()
        .find(|d| *d != 0)
        .unwrap_or(DEFAULT_DWELL_MS)
    }

    fn item_available(&self, item: &PlayItem) -> bool {
        self.cache.lai_contains(item.post_id)
    }

    fn total_positions(&self) -> usize {
        (0..self.order_indices.len())
            .map(|p| self.effective_size(p))
            .sum()
    }

    fn advance(&self, p: usize, q: usize) -> (usize, usize) {
        if self.order_indices.is_empty() {
            return (0, 0);
        }
        if q + 1 < self.effective_size(p) {
            (p, q + 1)
        } else {
            ((p + 1) % self.order_indices.len(), 0)
        }
    }

    fn retreat(&self, p: usize, q: usize) -> (usize, usize) {
        if self.order_indices.is_empty() {
            return (0, 0);
        }
        if q > 0 {
            (p, q - 1)
        } else {
            let p = if p == 0 { self.order_indices.len() - 1 } else { p - 1 };
            (p, self.effective_size(p).saturating_sub(1))
        }
    }

    fn scan_forward(&mut self, mut p: usize, mut q: usize) -> Result<PlayItem> {
        let max_steps = self.total_positions() + self.order_indices.len();
        for _ in 0..max_steps {
            if let Some(item) = self.item_at(p, q)
                && self.item_available(&item)
            {
                self.p = p;
                self.q = q;
                return Ok(item);
            }
            (p, q) = self.advance(p, q);
        }
        Err(Error::NotFound)
    }

    fn scan_backward(&mut self, mut p: usize, mut q: usize) -> Result<PlayItem> {
        let max_steps = self.total_positions() + self.order_indices.len();
        for _ in 0..max_steps {
            if let Some(item) = self.item_at(p, q)
                && self.item_available(&item)
            {
                self.p = p;
                self.q = q;
                return Ok(item);
            }
            (p, q) = self.retreat(p, q);
        }
        Err(Error::NotFound)
    }

    fn ensure_live_schedule(&mut self) {
        if !self.live_dirty && self.live.is_some() {
            return;
        }
        let mut slots = Vec::new();
        let mut at_ms: i64 = 0;
        for p in 0..self.order_indices.len() {
            for q in 0..self.effective_size(p) {
                let Some(item) = self.item_at(p, q) else {
                    continue;
                };
                slots.push(LiveSlot {
                    p,
                    q,
                    start_ms: at_ms,
                    dwell_ms: item.dwell_ms,
                });
                at_ms += item.dwell_ms as i64;
            }
        }
        self.live = Some(LiveSchedule {
            slots,
            cycle_ms: at_ms,
        });
        self.live_dirty = false;
    }

    /// Pick the scheduled slot for `now` and move the cursor there. The
    /// schedule is anchored at the channel epoch, so every device lands on
    /// the same slot for the same wall-clock moment.
    fn align_to_wall_clock(&mut self, now_ms: i64) {
        self.ensure_live_schedule();
        let Some(schedule) = &self.live else {
            return;
        };
        if schedule.cycle_ms == 0 || schedule.slots.is_empty() {
            return;
        }
        let epoch_ms = self.settings.start_at.saturating_mul(1000);
        let phase = (now_ms - epoch_ms).rem_euclid(schedule.cycle_ms);
        let slot_index = schedule
            .slots
            .partition_point(|slot| slot.start_ms <= phase)
            .saturating_sub(1);
        let slot = &schedule.slots[slot_index];
        self.p = slot.p;
        self.q = slot.q;
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        events::EventBus,
        playlist::PlaylistArtwork,
        settings::{ChannelOverrides, Settings},
        vault::Vault,
    };

    use super::*;

    fn key(n: u8) -> StorageKey {
        let mut bytes = [0u8; 16];
        bytes[15] = n;
        StorageKey::from_bytes(bytes)
    }

    fn artwork(post_id: i32, created_at: i64, dwell_ms: u32) -> ChannelEntry {
        ChannelEntry {
            post_id,
            kind: PostKind::Artwork,
            extension: Extension::Webp,
            filter_flags: 0,
            created_at,
            metadata_modified_at: created_at,
            artwork_modified_at: created_at,
            dwell_time_ms: dwell_ms,
            total_artworks: 0,
            storage_key: key(post_id as u8),
        }
    }

    fn playlist_entry(post_id: i32, created_at: i64, total: u32, dwell_ms: u32) -> ChannelEntry {
        ChannelEntry {
            post_id,
            kind: PostKind::Playlist,
            extension: Extension::Webp,
            filter_flags: 0,
            created_at,
            metadata_modified_at: created_at,
            artwork_modified_at: 0,
            dwell_time_ms: dwell_ms,
            total_artworks: total,
            storage_key: StorageKey::from_bytes([0; 16]),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        cache: Arc<ChannelCache>,
        playlists: Arc<PlaylistStore>,
    }

    fn fixture() -> Fixture {
        fixture_named("main")
    }

    fn fixture_named(channel_id: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cache = ChannelCache::open(
            channel_id,
            dir.path(),
            Vault::new(dir.path().join("vault")),
            Arc::new(EventBus::new()),
        );
        let playlists = Arc::new(PlaylistStore::new(dir.path(), channel_id));
        Fixture {
            _dir: dir,
            cache,
            playlists,
        }
    }

    fn settings(order: OrderMode) -> ChannelSettings {
        ChannelOverrides {
            order: Some(order),
            ..ChannelOverrides::default()
        }
        .resolve(&Settings::default())
    }

    fn navigator(fx: &Fixture, s: ChannelSettings, seed: u32) -> Navigator {
        Navigator::new(fx.cache.clone(), fx.playlists.clone(), s, seed)
    }

    fn collect_post_ids(nav: &mut Navigator, n: usize) -> Vec<i32> {
        let mut ids = vec![nav.current_at(0).unwrap().post_id];
        for _ in 1..n {
            ids.push(nav.next().unwrap().post_id);
        }
        ids
    }

    #[test]
    fn empty_channel_is_not_found() {
        let fx = fixture();
        let mut nav = navigator(&fx, settings(OrderMode::Server), 1);
        assert!(matches!(nav.current_at(0), Err(Error::NotFound)));
        assert!(matches!(nav.next(), Err(Error::NotFound)));
        assert!(matches!(nav.prev(), Err(Error::NotFound)));
    }

    #[test]
    fn server_order_walks_and_wraps() {
        let fx = fixture();
        for (id, created) in [(1, 10), (2, 20), (3, 30)] {
            fx.cache.merge_post(artwork(id, created, 0));
            fx.cache.lai_add(id);
        }
        let mut nav = navigator(&fx, settings(OrderMode::Server), 1);
        assert_eq!(collect_post_ids(&mut nav, 4), vec![1, 2, 3, 1]);
        assert_eq!(nav.prev().unwrap().post_id, 3);
        assert_eq!(nav.prev().unwrap().post_id, 2);
    }

    #[test]
    fn created_order_is_newest_first_with_stable_ties() {
        let fx = fixture();
        fx.cache.merge_post(artwork(1, 100, 0));
        fx.cache.merge_post(artwork(2, 300, 0));
        fx.cache.merge_post(artwork(3, 200, 0));
        fx.cache.merge_post(artwork(4, 200, 0));
        for id in [1, 2, 3, 4] {
            fx.cache.lai_add(id);
        }
        let mut nav = navigator(&fx, settings(OrderMode::Created), 1);
        // Ties (3, 4) keep their Ci order.
        assert_eq!(collect_post_ids(&mut nav, 4), vec![2, 3, 4, 1]);
    }

    #[test]
    fn random_order_is_reproducible_across_devices() {
        let fx = fixture();
        for id in 1..=16 {
            fx.cache.merge_post(artwork(id, id as i64, 0));
            fx.cache.lai_add(id);
        }
        let mut s = settings(OrderMode::Random);
        s.global_seed = 7;

        let mut a = navigator(&fx, s.clone(), 1234);
        let mut b = navigator(&fx, s.clone(), 1234);
        let seq_a = collect_post_ids(&mut a, 16);
        let seq_b = collect_post_ids(&mut b, 16);
        assert_eq!(seq_a, seq_b);

        // The order is a permutation, not a filter.
        let mut sorted = seq_a.clone();
        sorted.sort();
        assert_eq!(sorted, (1..=16).collect::<Vec<_>>());

        // A different effective seed lands on a different walk.
        let mut c = navigator(&fx, s, 99);
        assert_ne!(collect_post_ids(&mut c, 16), seq_a);
    }

    #[test]
    fn channels_sharing_every_seed_walk_independently() {
        let fill = |fx: &Fixture| {
            for id in 1..=16 {
                fx.cache.merge_post(artwork(id, id as i64, 0));
                fx.cache.lai_add(id);
            }
        };
        let fa = fixture_named("gallery-a");
        let fb = fixture_named("gallery-b");
        fill(&fa);
        fill(&fb);

        let mut s = settings(OrderMode::Random);
        s.global_seed = 7;

        let mut a = navigator(&fa, s.clone(), 1234);
        let mut b = navigator(&fb, s.clone(), 1234);
        let seq_a = collect_post_ids(&mut a, 16);
        assert_ne!(seq_a, collect_post_ids(&mut b, 16));

        // Another device on the same channel still walks the same order.
        let fa2 = fixture_named("gallery-a");
        fill(&fa2);
        let mut a2 = navigator(&fa2, s, 1234);
        assert_eq!(collect_post_ids(&mut a2, 16), seq_a);
    }

    #[test]
    fn a_channel_seed_override_changes_only_that_channel() {
        let fx = fixture();
        for id in 1..=16 {
            fx.cache.merge_post(artwork(id, id as i64, 0));
            fx.cache.lai_add(id);
        }

        let base = Settings {
            order: OrderMode::Random,
            global_seed: 7,
            ..Settings::default()
        };
        let plain = ChannelOverrides::default().resolve(&base);
        let seeded = ChannelOverrides {
            seed: Some(1000),
            ..ChannelOverrides::default()
        }
        .resolve(&base);

        let mut a = navigator(&fx, plain, 1234);
        let mut b = navigator(&fx, seeded, 1234);
        assert_ne!(
            collect_post_ids(&mut a, 16),
            collect_post_ids(&mut b, 16)
        );
    }

    #[test]
    fn reshuffle_is_a_noop_outside_random_order() {
        let fx = fixture();
        for id in [1, 2, 3] {
            fx.cache.merge_post(artwork(id, id as i64, 0));
            fx.cache.lai_add(id);
        }
        let mut nav = navigator(&fx, settings(OrderMode::Server), 1);
        nav.current_at(0).unwrap();
        nav.next().unwrap();
        let before = nav.position();
        nav.request_reshuffle(999);
        assert_eq!(nav.position(), before);
    }

    #[test]
    fn holes_are_skipped_in_both_directions() {
        let fx = fixture();
        for id in [1, 2, 3, 4] {
            fx.cache.merge_post(artwork(id, id as i64, 0));
        }
        fx.cache.lai_add(1);
        fx.cache.lai_add(3);

        let mut nav = navigator(&fx, settings(OrderMode::Server), 1);
        assert_eq!(nav.current_at(0).unwrap().post_id, 1);
        assert_eq!(nav.next().unwrap().post_id, 3);
        assert_eq!(nav.next().unwrap().post_id, 1);
        assert_eq!(nav.prev().unwrap().post_id, 3);
    }

    #[test]
    fn wholly_unavailable_channel_is_not_found() {
        let fx = fixture();
        for id in [1, 2] {
            fx.cache.merge_post(artwork(id, id as i64, 0));
        }
        let mut nav = navigator(&fx, settings(OrderMode::Server), 1);
        assert!(matches!(nav.current_at(0), Err(Error::NotFound)));
    }

    fn add_playlist(fx: &Fixture, post_id: i32, created: i64, inner_ids: &[i32]) {
        fx.cache
            .merge_post(playlist_entry(post_id, created, inner_ids.len() as u32, 0));
        let artworks = inner_ids
            .iter()
            .map(|id| {
                fx.cache.merge_post(artwork(*id, created, 0));
                fx.cache.lai_add(*id);
                PlaylistArtwork {
                    post_id: *id,
                    storage_key: key(*id as u8),
                    extension: Extension::Webp,
                    dwell_time_ms: 0,
                    artwork_modified_at: created,
                }
            })
            .collect();
        fx.playlists
            .write(&PlaylistManifest {
                post_id,
                total_artworks: inner_ids.len() as u32,
                artworks,
            })
            .unwrap();
    }

    #[test]
    fn playlists_expand_in_place() {
        let fx = fixture();
        fx.cache.merge_post(artwork(1, 10, 0));
        fx.cache.lai_add(1);
        add_playlist(&fx, 50, 20, &[100, 101, 102]);
        fx.cache.merge_post(artwork(2, 30, 0));
        fx.cache.lai_add(2);

        let mut nav = navigator(&fx, settings(OrderMode::Server), 1);
        assert_eq!(
            collect_post_ids(&mut nav, 6),
            vec![1, 100, 101, 102, 2, 1]
        );

        let item = nav.current_at(0).unwrap();
        assert_eq!(item.playlist_post_id, None);

        nav.jump(1, 1);
        let inner = nav.current_at(0).unwrap();
        assert_eq!(inner.post_id, 101);
        assert_eq!(inner.playlist_post_id, Some(50));
    }

    #[test]
    fn prev_enters_the_previous_playlist_at_its_last_item() {
        let fx = fixture();
        add_playlist(&fx, 50, 20, &[100, 101, 102]);
        fx.cache.merge_post(artwork(2, 30, 0));
        fx.cache.lai_add(2);

        let mut nav = navigator(&fx, settings(OrderMode::Server), 1);
        nav.jump(1, 0);
        assert_eq!(nav.current_at(0).unwrap().post_id, 2);
        assert_eq!(nav.prev().unwrap().post_id, 102);
        assert_eq!(nav.position(), (0, 2));
    }

    #[test]
    fn playlist_expansion_caps_effective_size() {
        let fx = fixture();
        add_playlist(&fx, 50, 20, &[100, 101, 102, 103]);

        let mut s = settings(OrderMode::Server);
        s.playlist_expansion = 2;
        let mut nav = navigator(&fx, s, 1);
        assert_eq!(collect_post_ids(&mut nav, 3), vec![100, 101, 100]);

        // PE = 0 means uncapped.
        let mut uncapped = navigator(&fx, settings(OrderMode::Server), 1);
        assert_eq!(
            collect_post_ids(&mut uncapped, 4),
            vec![100, 101, 102, 103]
        );
    }

    #[test]
    fn randomized_playlist_mapping_is_deterministic() {
        let fx = fixture();
        add_playlist(&fx, 50, 20, &[100, 101, 102, 103, 104]);

        let mut s = settings(OrderMode::Server);
        s.randomize_playlists = true;

        let mut a = navigator(&fx, s.clone(), 777);
        let mut b = navigator(&fx, s, 777);
        let seq_a = collect_post_ids(&mut a, 5);
        let seq_b = collect_post_ids(&mut b, 5);
        assert_eq!(seq_a, seq_b);
        for id in &seq_a {
            assert!((100..=104).contains(id));
        }
    }

    #[test]
    fn jump_clamps_out_of_bounds_coordinates() {
        let fx = fixture();
        for id in [1, 2] {
            fx.cache.merge_post(artwork(id, id as i64, 0));
            fx.cache.lai_add(id);
        }
        let mut nav = navigator(&fx, settings(OrderMode::Server), 1);
        nav.jump(5, 0);
        assert_eq!(nav.position(), (0, 0));
        nav.jump(1, 9);
        assert_eq!(nav.position(), (1, 0));
    }

    #[test]
    fn dwell_cascade_prefers_the_outermost_override() {
        let fx = fixture();
        fx.cache.merge_post(artwork(1, 10, 4000));
        fx.cache.lai_add(1);

        let mut s = settings(OrderMode::Server);
        let mut nav = navigator(&fx, s.clone(), 1);
        assert_eq!(nav.current_at(0).unwrap().dwell_ms, 4000);

        s.channel_dwell_ms = 6000;
        let mut nav = navigator(&fx, s.clone(), 1);
        assert_eq!(nav.current_at(0).unwrap().dwell_ms, 6000);

        s.global_dwell_ms = 9000;
        let mut nav = navigator(&fx, s, 1);
        assert_eq!(nav.current_at(0).unwrap().dwell_ms, 9000);
    }

    #[test]
    fn dwell_falls_back_when_nothing_sets_one() {
        let fx = fixture();
        fx.cache.merge_post(artwork(1, 10, 0));
        fx.cache.lai_add(1);
        let mut nav = navigator(&fx, settings(OrderMode::Server), 1);
        assert_eq!(nav.current_at(0).unwrap().dwell_ms, DEFAULT_DWELL_MS);
    }

    #[test]
    fn live_mode_aligns_the_cursor_to_the_wall_clock() {
        let fx = fixture();
        fx.cache.merge_post(artwork(1, 10, 10_000));
        fx.cache.merge_post(artwork(2, 20, 10_000));
        fx.cache.merge_post(artwork(3, 30, 10_000));
        for id in [1, 2, 3] {
            fx.cache.lai_add(id);
        }

        let mut s = settings(OrderMode::Server);
        s.live_mode = true;
        s.start_at = 1_000;

        // Cycle is 30 s anchored at t = 1000 s.
        let mut nav = navigator(&fx, s.clone(), 1);
        assert_eq!(nav.current_at(1_000_000).unwrap().post_id, 1);
        assert_eq!(nav.current_at(1_012_000).unwrap().post_id, 2);
        assert_eq!(nav.current_at(1_029_999).unwrap().post_id, 3);
        assert_eq!(nav.current_at(1_030_000).unwrap().post_id, 1);

        // Every device computes the same slot for the same moment.
        let mut other = navigator(&fx, s, 1);
        assert_eq!(other.current_at(1_012_000).unwrap().post_id, 2);

        // Before the epoch the cycle extends backwards: -10 s into the
        // 30 s cycle is the slot starting at 20 s.
        assert_eq!(nav.current_at(990_000).unwrap().post_id, 3);
    }

    #[test]
    fn live_schedule_expands_playlists_per_q() {
        let fx = fixture();
        fx.cache.merge_post(artwork(1, 10, 10_000));
        fx.cache.lai_add(1);
        add_playlist(&fx, 50, 20, &[100, 101]);

        let mut s = settings(OrderMode::Server);
        s.live_mode = true;
        s.channel_dwell_ms = 10_000;
        s.start_at = 0;

        let mut nav = navigator(&fx, s, 1);
        assert_eq!(nav.current_at(0).unwrap().post_id, 1);
        assert_eq!(nav.current_at(10_000).unwrap().post_id, 100);
        assert_eq!(nav.current_at(20_000).unwrap().post_id, 101);
        assert_eq!(nav.current_at(30_000).unwrap().post_id, 1);
    }

    #[test]
    fn prefetch_order_starts_at_the_cursor_and_includes_holes() {
        let fx = fixture();
        fx.cache.merge_post(artwork(1, 10, 0));
        add_playlist(&fx, 50, 20, &[100, 101]);
        fx.cache.merge_post(artwork(2, 30, 0));
        fx.cache.lai_add(2);

        // Post 1 is a hole: the cursor lands past it, but the prefetch walk
        // still lists it so the downloader can fill it.
        let mut nav = navigator(&fx, settings(OrderMode::Server), 1);
        assert_eq!(nav.current_at(0).unwrap().post_id, 100);
        assert_eq!(nav.prefetch_order(), vec![100, 101, 2, 1]);
    }

    #[test]
    fn invalidate_picks_up_new_posts() {
        let fx = fixture();
        fx.cache.merge_post(artwork(1, 10, 0));
        fx.cache.lai_add(1);
        let mut nav = navigator(&fx, settings(OrderMode::Server), 1);
        assert_eq!(nav.order_count(), 1);

        fx.cache.merge_post(artwork(2, 20, 0));
        fx.cache.lai_add(2);
        assert_eq!(nav.order_count(), 1);

        nav.invalidate();
        assert_eq!(nav.order_count(), 2);
        assert_eq!(nav.next().unwrap().post_id, 2);
    }
}
