//! Per-playlist metadata sidecars.
//!
//! A playlist's expanded artworks are merged into the channel cache as
//! ordinary artwork posts; the sidecar records only the within-playlist
//! order the navigator needs to index `q`.

use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};

use easel_state::{Extension, StorageKey};

use crate::{Result, cache::safe_file_stem, fsutil};

/// One artwork of a playlist, in play order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistArtwork {
    /// The artwork's post id.
    pub post_id: i32,
    /// The artwork's storage key.
    pub storage_key: StorageKey,
    /// The artwork's file format.
    pub extension: Extension,
    /// Dwell time in milliseconds; 0 means unset.
    #[serde(default)]
    pub dwell_time_ms: u32,
    /// When the artwork file last changed, unix seconds.
    #[serde(default)]
    pub artwork_modified_at: i64,
}

/// The sidecar contents for one playlist post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistManifest {
    /// The playlist's post id.
    pub post_id: i32,
    /// The playlist's full artwork count on the server.
    pub total_artworks: u32,
    /// The artworks expanded at query time, in play order.
    pub artworks: Vec<PlaylistArtwork>,
}

/// Reads and writes playlist sidecars for one channel, with a parsed
/// in-memory cache that refresh completion invalidates.
pub struct PlaylistStore {
    channels_dir: PathBuf,
    channel_stem: String,
    cache: Mutex<HashMap<i32, Arc<PlaylistManifest>>>,
}

impl PlaylistStore {
    /// Create a store for a channel.
    pub fn new(channels_dir: impl Into<PathBuf>, channel_id: &str) -> Self {
        Self {
            channels_dir: channels_dir.into(),
            channel_stem: safe_file_stem(channel_id),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn path(&self, post_id: i32) -> PathBuf {
        self.channels_dir
            .join(format!("{}.pl{post_id}.json", self.channel_stem))
    }

    /// Atomically write a playlist's sidecar and refresh the cached copy.
    pub fn write(&self, manifest: &PlaylistManifest) -> Result<()> {
        let path = self.path(manifest.post_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec(manifest).expect("playlist manifest serializes");
        fsutil::write_atomic(&path, &bytes)?;
        self.cache
            .lock()
            .unwrap()
            .insert(manifest.post_id, Arc::new(manifest.clone()));
        Ok(())
    }

    /// The manifest for a playlist post, from memory or disk. `None` when
    /// the sidecar is absent or unreadable.
    pub fn load(&self, post_id: i32) -> Option<Arc<PlaylistManifest>> {
        if let Some(manifest) = self.cache.lock().unwrap().get(&post_id) {
            return Some(manifest.clone());
        }
        let bytes = fs::read(self.path(post_id)).ok()?;
        match serde_json::from_slice::<PlaylistManifest>(&bytes) {
            Ok(manifest) => {
                let manifest = Arc::new(manifest);
                self.cache
                    .lock()
                    .unwrap()
                    .insert(post_id, manifest.clone());
                Some(manifest)
            }
            Err(e) => {
                tracing::warn!("discarding unparseable playlist sidecar {post_id}: {e}");
                None
            }
        }
    }

    /// Drop every cached manifest so the next load re-reads the disk.
    pub fn invalidate(&self) {
        self.cache.lock().unwrap().clear();
    }

    /// Delete a playlist's sidecar, e.g. after the server dropped the post.
    pub fn remove(&self, post_id: i32) -> Result<()> {
        self.cache.lock().unwrap().remove(&post_id);
        fsutil::remove_if_exists(&self.path(post_id))?;
        Ok(())
    }
}
