//! Atomic file replacement.
//!
//! The deployment filesystem refuses to overwrite on rename, so every
//! replacement goes temp-write → unlink final → rename. Hosts that allow
//! rename-overwrite take the same path; the unlink also recovers from
//! `EEXIST`-style rename failures.

use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

/// The sibling temp path a file is staged at before the rename.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Write `bytes` to `path` atomically: stage at the temp path, flush and
/// sync, then swap in. A stale temp file from an earlier crash is removed
/// first.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = tmp_path(path);
    remove_if_exists(&tmp)?;

    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_all()?;
    drop(file);

    replace(&tmp, path)
}

/// Move `tmp` into place at `path`, unlinking any existing target first.
pub fn replace(tmp: &Path, path: &Path) -> io::Result<()> {
    remove_if_exists(path)?;
    match fs::rename(tmp, path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            // The target reappeared between unlink and rename, or the
            // filesystem reported the unlink late. Retry once.
            remove_if_exists(path)?;
            fs::rename(tmp, path)
        }
        Err(e) => Err(e),
    }
}

/// Remove a file, treating "not found" as success.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_replaces_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");

        write_atomic(&path, b"first").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");

        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn write_atomic_clears_a_stale_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(tmp_path(&path), b"crashed").unwrap();

        write_atomic(&path, b"fresh").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"fresh");
        assert!(!tmp_path(&path).exists());
    }
}
