//! Engine settings, per-channel overrides, and the effective shuffle seed.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::navigator::OrderMode;

/// Fallback dwell time when nothing in the cascade sets one.
pub const DEFAULT_DWELL_MS: u32 = 30_000;
/// Seconds between refresh cycles unless overridden.
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 3600;
/// Upper bound of the playlist expansion factor.
pub const MAX_PLAYLIST_EXPANSION: u32 = 1023;

/// Engine-wide playback and refresh settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Playlist expansion factor (PE). 0 means no cap; clamped to
    /// [`MAX_PLAYLIST_EXPANSION`].
    pub playlist_expansion: u32,
    /// Global dwell override in milliseconds; 0 means unset.
    pub global_dwell_ms: u32,
    /// The fleet-wide shuffle seed, folded into both the PCG state and
    /// its stream selector.
    pub global_seed: u32,
    /// Whether playlists are shuffled internally.
    pub randomize_playlists: bool,
    /// Whether playback follows the globally aligned schedule.
    pub live_mode: bool,
    /// The play order applied to the channel.
    pub order: OrderMode,
    /// Seconds between refresh cycles.
    pub refresh_interval_secs: u64,
    /// Total timeout on every HTTP operation, seconds.
    pub http_timeout_secs: u64,
    /// Missing-artwork backlog above which refresh waits for the
    /// downloader between pages.
    pub download_backlog_threshold: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            playlist_expansion: 0,
            global_dwell_ms: 0,
            global_seed: 0,
            randomize_playlists: false,
            live_mode: false,
            order: OrderMode::Server,
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            http_timeout_secs: 30,
            download_backlog_threshold: 32,
        }
    }
}

/// Per-channel values shadowing the engine-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOverrides {
    /// Playlist expansion factor for this channel.
    pub playlist_expansion: Option<u32>,
    /// Shuffle seed for this channel, shadowing the fleet-wide one.
    pub seed: Option<u32>,
    /// Channel dwell override in milliseconds.
    pub dwell_ms: Option<u32>,
    /// Play order for this channel.
    pub order: Option<OrderMode>,
    /// Playlist shuffling for this channel.
    pub randomize_playlists: Option<bool>,
    /// Live mode for this channel.
    pub live_mode: Option<bool>,
    /// Refresh interval for this channel, seconds.
    pub refresh_interval_secs: Option<u64>,
    /// The channel's epoch: the unix time its live schedule is anchored
    /// to. Identical on every device sharing the channel.
    pub start_at: i64,
}

/// The settings a channel actually runs with, after overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSettings {
    /// Playlist expansion factor, clamped.
    pub playlist_expansion: u32,
    /// Global dwell override, milliseconds; 0 unset.
    pub global_dwell_ms: u32,
    /// Channel dwell override, milliseconds; 0 unset.
    pub channel_dwell_ms: u32,
    /// The shuffle seed this channel runs with: the fleet-wide one unless
    /// overridden.
    pub global_seed: u32,
    /// Whether playlists are shuffled internally.
    pub randomize_playlists: bool,
    /// Whether playback follows the globally aligned schedule.
    pub live_mode: bool,
    /// The play order.
    pub order: OrderMode,
    /// Seconds between refresh cycles.
    pub refresh_interval_secs: u64,
    /// The channel's schedule epoch, unix seconds.
    pub start_at: i64,
}

impl ChannelOverrides {
    /// Resolve against the engine-wide settings.
    pub fn resolve(&self, base: &Settings) -> ChannelSettings {
        ChannelSettings {
            playlist_expansion: self
                .playlist_expansion
                .unwrap_or(base.playlist_expansion)
                .min(MAX_PLAYLIST_EXPANSION),
            global_dwell_ms: base.global_dwell_ms,
            channel_dwell_ms: self.dwell_ms.unwrap_or(0),
            global_seed: self.seed.unwrap_or(base.global_seed),
            randomize_playlists: self
                .randomize_playlists
                .unwrap_or(base.randomize_playlists),
            live_mode: self.live_mode.unwrap_or(base.live_mode),
            order: self.order.unwrap_or(base.order),
            refresh_interval_secs: self
                .refresh_interval_secs
                .unwrap_or(base.refresh_interval_secs),
            start_at: self.start_at,
        }
    }
}

struct SeedState {
    effective_seed: u32,
    time_synced: bool,
}

/// The engine's shared settings handle.
///
/// The effective seed starts out random so an unsynchronized device still
/// shuffles; once wall-clock time is trusted (the SNTP callback), the seed
/// becomes the deterministic fleet value and every device shuffles alike.
pub struct SharedSettings {
    settings: RwLock<Settings>,
    seed: RwLock<SeedState>,
}

impl SharedSettings {
    /// Create a handle with a random pre-sync seed.
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
            seed: RwLock::new(SeedState {
                effective_seed: rand::random(),
                time_synced: false,
            }),
        }
    }

    /// A snapshot of the engine-wide settings.
    pub fn get(&self) -> Settings {
        self.settings.read().unwrap().clone()
    }

    /// Replace the engine-wide settings.
    pub fn set(&self, settings: Settings) {
        *self.settings.write().unwrap() = settings;
    }

    /// The seed navigators shuffle with right now.
    pub fn effective_seed(&self) -> u32 {
        self.seed.read().unwrap().effective_seed
    }

    /// Whether the wall clock has been synchronized.
    pub fn is_time_synced(&self) -> bool {
        self.seed.read().unwrap().time_synced
    }

    /// Install the deterministic fleet seed once time is trusted.
    pub fn mark_time_synced(&self, seed: u32) {
        let mut state = self.seed.write().unwrap();
        state.effective_seed = seed;
        state.time_synced = true;
    }
}
