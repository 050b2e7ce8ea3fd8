//! Channel lifecycle and the engine handle.
//!
//! An [`Engine`] owns the event bus, the cache registry, the settings, the
//! catalog client, and the flush and download tasks. A [`Channel`] owns one
//! channel's cache, playlist sidecars, and refresh task. Shutdown is
//! cooperative: the shutdown bit wakes every blocking wait, and tasks that
//! ignore the grace period are aborted.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::task::JoinHandle;

use easel_state::ec;

use crate::{
    Error, Result,
    cache::ChannelCache,
    download::{Downloader, PrefetchPlan, run_download_task},
    events::{EventBus, bits},
    navigator::Navigator,
    playlist::PlaylistStore,
    refresh::{RefreshContext, SpaceProbe, run_refresh_task},
    registry::{CacheRegistry, run_flush_task},
    settings::{ChannelOverrides, Settings, SharedSettings},
    vault::Vault,
};

/// How long a task gets to exit after the shutdown bit before it is
/// force-deleted.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Static configuration of an engine.
pub struct EngineConfig {
    /// Where cache files and sidecars live.
    pub channels_dir: PathBuf,
    /// The vault root for artwork files.
    pub vault_dir: PathBuf,
    /// Base URL of the catalog service.
    pub catalog_base_url: String,
    /// This device's id.
    pub device_id: String,
    /// This device's API token.
    pub device_token: String,
    /// Initial engine-wide settings.
    pub settings: Settings,
    /// Free-space probe, when the host has one.
    pub space_probe: Option<SpaceProbe>,
}

/// What a channel shows and how it behaves.
pub struct ChannelConfig {
    /// The channel id; also the stem of its on-disk files.
    pub channel_id: String,
    /// Which posts the channel shows.
    pub selector: ec::ChannelSelector,
    /// The server-side sort.
    pub sort: ec::PostSort,
    /// Per-channel setting overrides.
    pub overrides: ChannelOverrides,
}

/// One open channel: its cache, sidecars, prefetch plan, and refresh task.
pub struct Channel {
    config: ChannelConfig,
    cache: Arc<ChannelCache>,
    playlists: Arc<PlaylistStore>,
    plan: Arc<PrefetchPlan>,
    registry: Arc<CacheRegistry>,
    refresh_task: Option<JoinHandle<()>>,
}

impl Channel {
    /// The channel id.
    pub fn channel_id(&self) -> &str {
        &self.config.channel_id
    }

    /// The channel's cache.
    pub fn cache(&self) -> &Arc<ChannelCache> {
        &self.cache
    }

    /// The channel's prefetch plan, shared with the downloader.
    pub fn plan(&self) -> &Arc<PrefetchPlan> {
        &self.plan
    }

    /// Build a navigator over this channel with the current settings and
    /// effective seed.
    pub fn navigator(&self, shared: &SharedSettings) -> Navigator {
        let resolved = self.config.overrides.resolve(&shared.get());
        Navigator::new(
            self.cache.clone(),
            self.playlists.clone(),
            resolved,
            shared.effective_seed(),
        )
    }

    /// Share a navigator's play-order walk with the downloader, switching
    /// it from newest-first to play-order-prefetch selection.
    pub fn update_prefetch_plan(&self, navigator: &mut Navigator) {
        self.plan.set(navigator.prefetch_order());
    }

    /// Close the channel: signal shutdown, give the refresh task the grace
    /// period, force-delete it if it overstays, then flush and unregister
    /// the cache.
    pub async fn close(mut self, bus: &EventBus) {
        bus.set(bits::REFRESH_SHUTDOWN);
        if let Some(mut task) = self.refresh_task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                tracing::warn!(
                    "refresh task for {} ignored shutdown, aborting",
                    self.config.channel_id
                );
                task.abort();
            }
        }
        if let Err(e) = self.cache.flush() {
            tracing::warn!("final flush for {} failed: {e}", self.config.channel_id);
        }
        self.registry.unregister(&self.config.channel_id);
    }
}

/// The engine: shared infrastructure plus the flush and download tasks.
pub struct Engine {
    channels_dir: PathBuf,
    vault: Vault,
    client: Arc<ec::Client>,
    bus: Arc<EventBus>,
    registry: Arc<CacheRegistry>,
    settings: Arc<SharedSettings>,
    space_probe: Option<SpaceProbe>,
    flush_task: Option<JoinHandle<()>>,
    download_task: Option<JoinHandle<()>>,
}

impl Engine {
    /// Build an engine and start its flush task. Must run inside a tokio
    /// runtime.
    pub fn new(config: EngineConfig) -> Self {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(CacheRegistry::new());
        let settings = Arc::new(SharedSettings::new(config.settings.clone()));
        let client = Arc::new(ec::Client::new(
            config.catalog_base_url,
            config.device_id,
            config.device_token,
            Duration::from_secs(config.settings.http_timeout_secs),
        ));
        let flush_task = tokio::spawn(run_flush_task(registry.clone(), bus.clone()));

        Self {
            channels_dir: config.channels_dir,
            vault: Vault::new(config.vault_dir),
            client,
            bus,
            registry,
            settings,
            space_probe: config.space_probe,
            flush_task: Some(flush_task),
            download_task: None,
        }
    }

    /// The engine's event bus.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The engine's cache registry.
    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    /// The engine's shared settings.
    pub fn settings(&self) -> &Arc<SharedSettings> {
        &self.settings
    }

    /// Open a channel: load its cache off the blocking pool, register it,
    /// and spawn its refresh task.
    pub async fn open_channel(&self, config: ChannelConfig) -> Result<Channel> {
        let cache = {
            let channel_id = config.channel_id.clone();
            let channels_dir = self.channels_dir.clone();
            let vault = self.vault.clone();
            let bus = self.bus.clone();
            tokio::task::spawn_blocking(move || {
                ChannelCache::open(&channel_id, &channels_dir, vault, bus)
            })
            .await
            .map_err(|_| Error::OutOfMemory)?
        };
        self.registry.register(cache.clone())?;

        let playlists = Arc::new(PlaylistStore::new(
            self.channels_dir.clone(),
            &config.channel_id,
        ));

        let refresh_task = tokio::spawn(run_refresh_task(RefreshContext {
            channel_id: config.channel_id.clone(),
            selector: config.selector.clone(),
            sort: config.sort,
            channels_dir: self.channels_dir.clone(),
            cache: cache.clone(),
            playlists: playlists.clone(),
            client: self.client.clone(),
            bus: self.bus.clone(),
            settings: self.settings.clone(),
            overrides: config.overrides.clone(),
            space_probe: self.space_probe.clone(),
        }));

        Ok(Channel {
            config,
            cache,
            playlists,
            plan: Arc::new(PrefetchPlan::new()),
            registry: self.registry.clone(),
            refresh_task: Some(refresh_task),
        })
    }

    /// Make a channel the one the downloader serves. Replaces any previous
    /// download task.
    pub fn activate(&mut self, channel: &Channel) {
        if let Some(task) = self.download_task.take() {
            task.abort();
        }
        let downloader = Downloader::new(
            channel.cache.clone(),
            self.client.clone(),
            self.bus.clone(),
            channel.plan.clone(),
        );
        self.download_task = Some(tokio::spawn(run_download_task(downloader)));
    }

    /// Shut the engine down: wake every waiter with the shutdown bit, give
    /// the flush and download tasks the grace period, then abort
    /// stragglers. Channels are closed by their owners.
    pub async fn shutdown(mut self) {
        self.bus.set(bits::REFRESH_SHUTDOWN);
        for task in [self.flush_task.take(), self.download_task.take()]
            .into_iter()
            .flatten()
        {
            let mut task = task;
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        self.registry.flush_dirty();
    }
}
