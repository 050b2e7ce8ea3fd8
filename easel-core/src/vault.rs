//! Content-addressed local storage of artwork files.
//!
//! The path for a storage key is derived from the SHA-256 of its 36-char
//! canonical form, not its raw bytes. Every device in a shared channel must
//! compute the same path for the same key, so the hash input is pinned.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use easel_state::{Extension, StorageKey};

/// Suffix of the marker file recording a permanently unavailable upstream.
pub const UNAVAILABLE_MARKER_SUFFIX: &str = ".404";

/// Resolves storage keys to sharded paths under a vault root.
#[derive(Debug, Clone)]
pub struct Vault {
    root: PathBuf,
}

impl Vault {
    /// Create a resolver over `root`. No filesystem access happens here.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The vault root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The artwork file path:
    /// `{root}/{sha[0]:02x}/{sha[1]:02x}/{sha[2]:02x}/{key}{ext}`.
    pub fn artwork_path(&self, key: &StorageKey, extension: Extension) -> PathBuf {
        let canonical = key.to_canonical_string();
        let sha = Sha256::digest(canonical.as_bytes());
        self.root
            .join(hex_byte(sha[0]))
            .join(hex_byte(sha[1]))
            .join(hex_byte(sha[2]))
            .join(format!("{canonical}{}", extension.suffix()))
    }

    /// The `.404` marker path next to an artwork file.
    pub fn marker_path(artwork_path: &Path) -> PathBuf {
        let mut path = artwork_path.as_os_str().to_owned();
        path.push(UNAVAILABLE_MARKER_SUFFIX);
        PathBuf::from(path)
    }

    /// The load tracker sidecar path:
    /// `{root}/{sha[0]:02x}/{sha[1]:02x}/{key}.ltf`.
    pub fn tracker_path(&self, key: &StorageKey) -> PathBuf {
        let canonical = key.to_canonical_string();
        let sha = Sha256::digest(canonical.as_bytes());
        self.root
            .join(hex_byte(sha[0]))
            .join(hex_byte(sha[1]))
            .join(format!("{canonical}.ltf"))
    }

    /// Whether the artwork file is present and not marked unavailable.
    pub fn artwork_available(&self, key: &StorageKey, extension: Extension) -> bool {
        let path = self.artwork_path(key, extension);
        path.is_file() && !Self::marker_path(&path).exists()
    }
}

fn hex_byte(b: u8) -> String {
    hex::encode([b])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> StorageKey {
        StorageKey::parse("0d9fa1f0-8c3b-4a5e-9d2f-6b7c8d9e0f1a").unwrap()
    }

    #[test]
    fn paths_are_deterministic_across_resolvers() {
        let a = Vault::new("/vault");
        let b = Vault::new("/vault");
        assert_eq!(
            a.artwork_path(&key(), Extension::Webp),
            b.artwork_path(&key(), Extension::Webp)
        );
        assert_eq!(a.tracker_path(&key()), b.tracker_path(&key()));
    }

    #[test]
    fn artwork_path_shards_on_the_canonical_string_hash() {
        let vault = Vault::new("/vault");
        let canonical = key().to_canonical_string();
        let sha = Sha256::digest(canonical.as_bytes());

        let path = vault.artwork_path(&key(), Extension::Png);
        let expected: PathBuf = [
            "/vault",
            &hex::encode([sha[0]]),
            &hex::encode([sha[1]]),
            &hex::encode([sha[2]]),
            &format!("{canonical}.png"),
        ]
        .iter()
        .collect();
        assert_eq!(path, expected);
    }

    #[test]
    fn tracker_path_uses_two_shard_levels() {
        let vault = Vault::new("/vault");
        let path = vault.tracker_path(&key());
        // root + two shard dirs + file name
        assert_eq!(path.strip_prefix("/vault").unwrap().components().count(), 3);
        assert!(path.to_string_lossy().ends_with(".ltf"));
    }

    #[test]
    fn marker_path_appends_the_suffix() {
        let vault = Vault::new("/vault");
        let art = vault.artwork_path(&key(), Extension::Gif);
        let marker = Vault::marker_path(&art);
        assert_eq!(
            marker.to_string_lossy(),
            format!("{}.404", art.to_string_lossy())
        );
    }

    #[test]
    fn availability_requires_file_and_no_marker() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::new(dir.path());
        assert!(!vault.artwork_available(&key(), Extension::Webp));

        let path = vault.artwork_path(&key(), Extension::Webp);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"riff").unwrap();
        assert!(vault.artwork_available(&key(), Extension::Webp));

        std::fs::write(Vault::marker_path(&path), b"").unwrap();
        assert!(!vault.artwork_available(&key(), Extension::Webp));
    }
}
