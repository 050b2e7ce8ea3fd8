//! The per-channel catalog cache.
//!
//! A [`ChannelCache`] owns the channel's post index (`Ci`), the subset of
//! artwork posts whose files exist locally (`LAi`), and hash indices over
//! both. It persists to a single CRC-protected binary file, written with
//! the temp-unlink-rename protocol, and recovers from torn writes, stale
//! temp files, and a legacy raw-entry format.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use easel_state::{ChannelEntry, ENTRY_SIZE, Fingerprint, PostKind, StorageKey};

use crate::{
    Error, Result,
    events::{EventBus, bits},
    fsutil,
    vault::Vault,
};

/// File magic of the cache format.
pub const CACHE_MAGIC: u32 = 0xE5E1_CACE;
/// Current cache format version. Older versions load with an availability
/// rebuild; newer versions are refused.
pub const CACHE_VERSION: u16 = 20;

/// Longest stored channel id, bytes, excluding the NUL.
const MAX_CHANNEL_ID_LEN: usize = 128;

/// Fixed part of the header, before the channel id.
const HEADER_FIXED_LEN: usize = 28;

/// How a merged post changed the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The post was new and was appended.
    Inserted,
    /// The post replaced an existing entry.
    Updated {
        /// Whether the artwork file itself changed and the local copy is
        /// now stale.
        artwork_changed: bool,
        /// The entry that was replaced; its storage key and extension name
        /// the file a stale local copy lives at.
        previous: ChannelEntry,
    },
}

#[derive(Default)]
struct CacheState {
    /// `Ci`: every post of the channel, in server order.
    entries: Vec<ChannelEntry>,
    /// `LAi`: post ids of artworks whose file exists under the vault.
    available: Vec<i32>,

    by_fingerprint: HashMap<Fingerprint, usize>,
    by_storage_key: HashMap<StorageKey, usize>,
    available_set: HashSet<i32>,

    dirty: bool,
}

impl CacheState {
    fn rebuild_indices(&mut self) {
        self.by_fingerprint.clear();
        self.by_storage_key.clear();
        for (i, entry) in self.entries.iter().enumerate() {
            self.by_fingerprint.insert(entry.fingerprint(), i);
            if entry.kind == PostKind::Artwork {
                self.by_storage_key.insert(entry.storage_key, i);
            }
        }
        self.available_set = self.available.iter().copied().collect();
    }
}

/// A channel's in-memory catalog state and its on-disk persistence.
pub struct ChannelCache {
    channel_id: String,
    cache_path: PathBuf,
    vault: Vault,
    bus: Arc<EventBus>,
    state: Mutex<CacheState>,
}

impl ChannelCache {
    /// Open the channel's cache: recover from torn writes, deserialize the
    /// current format, fall back to the legacy raw-entry file, and finally
    /// degrade to an empty cache. Never a hard error.
    ///
    /// Runs blocking filesystem work; call from the blocking pool in async
    /// contexts.
    pub fn open(
        channel_id: &str,
        channels_dir: &Path,
        vault: Vault,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let cache_path = channels_dir.join(format!("{}.cache", safe_file_stem(channel_id)));

        recover_and_cleanup(&cache_path, channel_id);

        let mut needs_rebuild = false;
        let mut dirty = false;
        let mut entries = Vec::new();
        let mut available = Vec::new();

        match fs::read(&cache_path) {
            Ok(bytes) => match deserialize(&bytes, channel_id) {
                Ok(loaded) => {
                    entries = loaded.entries;
                    available = loaded.available;
                    needs_rebuild = loaded.needs_rebuild;
                    dirty = loaded.needs_rebuild;
                }
                Err(e) => {
                    tracing::warn!("cache for {channel_id} failed to load ({e}), trying legacy");
                    (entries, needs_rebuild, dirty) =
                        load_legacy(channels_dir, channel_id).unwrap_or_default();
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                (entries, needs_rebuild, dirty) =
                    load_legacy(channels_dir, channel_id).unwrap_or_default();
            }
            Err(e) => {
                tracing::warn!("cache for {channel_id} unreadable ({e}), starting empty");
            }
        }

        let mut state = CacheState {
            entries,
            available,
            dirty,
            ..Default::default()
        };
        if needs_rebuild {
            state.available = rebuild_available(&state.entries, &vault);
        }
        // Keep LAi's allocation appendable up to |Ci| without reallocation.
        state.available.reserve(state.entries.len());
        state.rebuild_indices();

        tracing::info!(
            "opened cache for {channel_id}: {} posts, {} available",
            state.entries.len(),
            state.available.len()
        );

        Arc::new(Self {
            channel_id: channel_id.to_string(),
            cache_path,
            vault,
            bus,
            state: Mutex::new(state),
        })
    }

    /// The channel this cache belongs to.
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// The vault this cache resolves artwork files against.
    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    /// The `Ci` index of the post with this id, preferring the artwork
    /// fingerprint. O(1).
    pub fn find_by_post_id(&self, post_id: i32) -> Option<usize> {
        let state = self.state.lock().unwrap();
        find_by_post_id_in(&state, post_id)
    }

    /// The `Ci` index of the artwork with this storage key. O(1).
    pub fn find_by_storage_key(&self, key: &StorageKey) -> Option<usize> {
        self.state.lock().unwrap().by_storage_key.get(key).copied()
    }

    /// The entry at a `Ci` index, if in bounds.
    pub fn get_entry(&self, index: usize) -> Option<ChannelEntry> {
        self.state.lock().unwrap().entries.get(index).copied()
    }

    /// Number of posts in `Ci`.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Whether `Ci` is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of locally available artworks.
    pub fn available_count(&self) -> usize {
        self.state.lock().unwrap().available.len()
    }

    /// A copy of `Ci`. Entries are 64 bytes; channels are bounded.
    pub fn entries_snapshot(&self) -> Vec<ChannelEntry> {
        self.state.lock().unwrap().entries.clone()
    }

    /// A copy of `LAi`.
    pub fn available_snapshot(&self) -> Vec<i32> {
        self.state.lock().unwrap().available.clone()
    }

    /// Add a post id to `LAi`. Returns whether state changed; marks the
    /// cache dirty when it did.
    pub fn lai_add(&self, post_id: i32) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.available_set.insert(post_id) {
            return false;
        }
        state.available.push(post_id);
        state.dirty = true;
        true
    }

    /// Remove a post id from `LAi`. Returns whether state changed.
    pub fn lai_remove(&self, post_id: i32) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.available_set.remove(&post_id) {
            return false;
        }
        state.available.retain(|id| *id != post_id);
        state.dirty = true;
        true
    }

    /// Whether the artwork with this post id is locally available.
    pub fn lai_contains(&self, post_id: i32) -> bool {
        self.state.lock().unwrap().available_set.contains(&post_id)
    }

    /// The next artwork entry at or after `cursor` whose file is missing
    /// locally, plus the cursor to resume from. [`Error::NotFound`] when
    /// the walk is exhausted.
    pub fn next_missing(&self, cursor: usize) -> Result<(ChannelEntry, usize)> {
        let state = self.state.lock().unwrap();
        for (i, entry) in state.entries.iter().enumerate().skip(cursor) {
            if entry.kind == PostKind::Artwork && !state.available_set.contains(&entry.post_id) {
                return Ok((*entry, i + 1));
            }
        }
        Err(Error::NotFound)
    }

    /// Merge a post into `Ci` by fingerprint: append when new, replace when
    /// present. Marks the cache dirty.
    pub fn merge_post(&self, entry: ChannelEntry) -> MergeOutcome {
        let mut state = self.state.lock().unwrap();
        state.dirty = true;
        match state.by_fingerprint.get(&entry.fingerprint()).copied() {
            Some(i) => {
                let old = state.entries[i];
                let artwork_changed = entry.kind == PostKind::Artwork
                    && old.artwork_modified_at != entry.artwork_modified_at;
                if old.kind == PostKind::Artwork && old.storage_key != entry.storage_key {
                    state.by_storage_key.remove(&old.storage_key);
                }
                if entry.kind == PostKind::Artwork {
                    state.by_storage_key.insert(entry.storage_key, i);
                }
                state.entries[i] = entry;
                MergeOutcome::Updated {
                    artwork_changed,
                    previous: old,
                }
            }
            None => {
                let i = state.entries.len();
                state.entries.push(entry);
                state.by_fingerprint.insert(entry.fingerprint(), i);
                if entry.kind == PostKind::Artwork {
                    state.by_storage_key.insert(entry.storage_key, i);
                }
                MergeOutcome::Inserted
            }
        }
    }

    /// Drop every post whose id is not in `keep`, returning the removed
    /// entries. Removed artworks also leave `LAi`. Indices are rebuilt; any
    /// previously returned `Ci` index is invalidated.
    pub fn retain_posts(&self, keep: &HashSet<i32>) -> Vec<ChannelEntry> {
        let mut state = self.state.lock().unwrap();
        let mut removed = Vec::new();
        state.entries.retain(|entry| {
            if keep.contains(&entry.post_id) {
                true
            } else {
                removed.push(*entry);
                false
            }
        });
        if removed.is_empty() {
            return removed;
        }
        for entry in &removed {
            if entry.kind == PostKind::Artwork && state.available_set.remove(&entry.post_id) {
                let post_id = entry.post_id;
                state.available.retain(|id| *id != post_id);
            }
        }
        state.dirty = true;
        state.rebuild_indices();
        removed
    }

    /// Whether the cache has unsaved changes.
    pub fn is_dirty(&self) -> bool {
        self.state.lock().unwrap().dirty
    }

    /// Mark the cache dirty and reset the flush debounce timer.
    pub fn schedule_save(&self) {
        self.state.lock().unwrap().dirty = true;
        self.bus.set(bits::SAVE_SCHEDULED);
    }

    /// Atomically write the current state. Clears the dirty flag on
    /// success; a failure keeps it set for the next debounce tick.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.dirty {
            return Ok(());
        }
        let bytes = serialize(&state, &self.channel_id);
        if let Some(parent) = self.cache_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fsutil::write_atomic(&self.cache_path, &bytes)?;
        state.dirty = false;
        tracing::debug!(
            "flushed cache for {}: {} posts, {} available",
            self.channel_id,
            state.entries.len(),
            state.available.len()
        );
        Ok(())
    }
}

/// Replace every character outside `[A-Za-z0-9_-]` by dropping it.
pub fn safe_file_stem(channel_id: &str) -> String {
    channel_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

#[derive(Debug)]
struct Loaded {
    entries: Vec<ChannelEntry>,
    available: Vec<i32>,
    needs_rebuild: bool,
}

fn serialize(state: &CacheState, channel_id: &str) -> Vec<u8> {
    let mut id = channel_id.as_bytes().to_vec();
    id.truncate(MAX_CHANNEL_ID_LEN);
    let ci_offset = HEADER_FIXED_LEN + id.len() + 1;
    let lai_offset = ci_offset + state.entries.len() * ENTRY_SIZE;
    let total = lai_offset + state.available.len() * 4;

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&CACHE_MAGIC.to_le_bytes());
    buf.extend_from_slice(&CACHE_VERSION.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes()); // flags
    buf.extend_from_slice(&(state.entries.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(state.available.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(ci_offset as u32).to_le_bytes());
    buf.extend_from_slice(&(lai_offset as u32).to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // checksum, patched below
    buf.extend_from_slice(&id);
    buf.push(0);
    for entry in &state.entries {
        buf.extend_from_slice(&entry.encode());
    }
    for post_id in &state.available {
        buf.extend_from_slice(&post_id.to_le_bytes());
    }

    let checksum = crc32fast::hash(&buf);
    buf[24..28].copy_from_slice(&checksum.to_le_bytes());
    buf
}

fn deserialize(bytes: &[u8], expected_channel_id: &str) -> Result<Loaded> {
    if bytes.len() < HEADER_FIXED_LEN + 1 {
        return Err(Error::Corruption("file shorter than header".to_string()));
    }

    let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if magic != CACHE_MAGIC {
        return Err(Error::Corruption(format!("bad magic {magic:#010x}")));
    }
    let version = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
    if version > CACHE_VERSION {
        return Err(Error::Corruption(format!(
            "version {version} is newer than {CACHE_VERSION}"
        )));
    }
    let ci_count = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
    let lai_count = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
    let ci_offset = u32::from_le_bytes(bytes[16..20].try_into().unwrap()) as usize;
    let lai_offset = u32::from_le_bytes(bytes[20..24].try_into().unwrap()) as usize;
    let checksum = u32::from_le_bytes(bytes[24..28].try_into().unwrap());

    let mut crc_input = bytes.to_vec();
    crc_input[24..28].fill(0);
    let actual = crc32fast::hash(&crc_input);
    if actual != checksum {
        return Err(Error::Corruption(format!(
            "checksum mismatch: stored {checksum:#010x}, computed {actual:#010x}"
        )));
    }

    let id_end = bytes[HEADER_FIXED_LEN..]
        .iter()
        .position(|b| *b == 0)
        .map(|i| HEADER_FIXED_LEN + i)
        .ok_or_else(|| Error::Corruption("unterminated channel id".to_string()))?;
    if id_end - HEADER_FIXED_LEN > MAX_CHANNEL_ID_LEN {
        return Err(Error::Corruption("channel id too long".to_string()));
    }
    if ci_offset != id_end + 1
        || lai_offset != ci_offset + ci_count * ENTRY_SIZE
        || bytes.len() != lai_offset + lai_count * 4
    {
        return Err(Error::Corruption("section offsets disagree".to_string()));
    }

    let stored_id = String::from_utf8_lossy(&bytes[HEADER_FIXED_LEN..id_end]);
    if stored_id != expected_channel_id {
        tracing::warn!("cache file names channel {stored_id:?}, expected {expected_channel_id:?}");
    }

    let mut entries = Vec::with_capacity(ci_count);
    for chunk in bytes[ci_offset..lai_offset].chunks_exact(ENTRY_SIZE) {
        entries.push(ChannelEntry::decode(chunk.try_into().unwrap()));
    }
    let mut available = Vec::with_capacity(lai_count);
    for chunk in bytes[lai_offset..].chunks_exact(4) {
        available.push(i32::from_le_bytes(chunk.try_into().unwrap()));
    }

    Ok(Loaded {
        entries,
        available,
        // Older formats did not persist LAi; rebuild it from the vault.
        needs_rebuild: version < CACHE_VERSION,
    })
}

/// Load the legacy raw-entry file: a bare `Ci` array, no header, no `LAi`.
/// Returns `(entries, needs_rebuild, dirty)`.
fn load_legacy(channels_dir: &Path, channel_id: &str) -> Option<(Vec<ChannelEntry>, bool, bool)> {
    let path = channels_dir.join(format!("{}.bin", safe_file_stem(channel_id)));
    let bytes = fs::read(&path).ok()?;
    if bytes.is_empty() || bytes.len() % ENTRY_SIZE != 0 {
        tracing::warn!(
            "legacy cache {} has unusable size {}, ignoring",
            path.display(),
            bytes.len()
        );
        return None;
    }
    let entries = bytes
        .chunks_exact(ENTRY_SIZE)
        .map(|chunk| ChannelEntry::decode(chunk.try_into().unwrap()))
        .collect::<Vec<_>>();
    tracing::info!(
        "loaded legacy cache for {channel_id}: {} posts, promoting on next flush",
        entries.len()
    );
    Some((entries, true, true))
}

/// Walk `Ci` and collect the artworks whose file exists and whose `.404`
/// marker does not.
fn rebuild_available(entries: &[ChannelEntry], vault: &Vault) -> Vec<i32> {
    let mut available = Vec::new();
    for entry in entries {
        if entry.kind != PostKind::Artwork {
            continue;
        }
        if vault.artwork_available(&entry.storage_key, entry.extension) {
            available.push(entry.post_id);
        }
    }
    available
}

/// Resolve a torn save: when both the final file and its temp sibling
/// exist, keep whichever is valid, preferring the newer of two valid
/// files; promote a valid orphaned temp.
fn recover_and_cleanup(cache_path: &Path, channel_id: &str) {
    let tmp = fsutil::tmp_path(cache_path);
    if !tmp.exists() {
        return;
    }

    let tmp_valid = fs::read(&tmp)
        .ok()
        .is_some_and(|bytes| deserialize(&bytes, channel_id).is_ok());

    if !cache_path.exists() {
        if tmp_valid {
            tracing::info!("promoting orphaned cache temp for {channel_id}");
            if let Err(e) = fsutil::replace(&tmp, cache_path) {
                tracing::warn!("failed to promote cache temp for {channel_id}: {e}");
            }
        } else {
            let _ = fsutil::remove_if_exists(&tmp);
        }
        return;
    }

    let final_valid = fs::read(cache_path)
        .ok()
        .is_some_and(|bytes| deserialize(&bytes, channel_id).is_ok());

    let prefer_tmp = match (final_valid, tmp_valid) {
        (false, true) => true,
        (true, true) => {
            let mtime = |p: &Path| fs::metadata(p).and_then(|m| m.modified()).ok();
            match (mtime(cache_path), mtime(&tmp)) {
                (Some(final_time), Some(tmp_time)) => tmp_time > final_time,
                _ => false,
            }
        }
        _ => false,
    };

    if prefer_tmp {
        tracing::info!("recovering cache for {channel_id} from its temp file");
        if let Err(e) = fsutil::replace(&tmp, cache_path) {
            tracing::warn!("failed to recover cache temp for {channel_id}: {e}");
        }
    } else {
        let _ = fsutil::remove_if_exists(&tmp);
    }
}

fn find_by_post_id_in(state: &CacheState, post_id: i32) -> Option<usize> {
    state
        .by_fingerprint
        .get(&Fingerprint {
            post_id,
            kind: PostKind::Artwork,
        })
        .or_else(|| {
            state.by_fingerprint.get(&Fingerprint {
                post_id,
                kind: PostKind::Playlist,
            })
        })
        .copied()
}
