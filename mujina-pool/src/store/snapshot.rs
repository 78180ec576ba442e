//! JSON snapshot of the store tables.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::Tables;
use crate::error::{Error, Result};

/// Load tables from `path`. A missing file is not an error.
pub(super) fn load(path: &Path) -> Result<Option<Tables>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| Error::Persistence(format!("corrupt state file {}: {e}", path.display())))
}

pub(super) fn encode(tables: &Tables) -> Result<Vec<u8>> {
    serde_json::to_vec(tables).map_err(|e| Error::Persistence(format!("cannot encode state: {e}")))
}

/// The state file.
///
/// Snapshots are encoded under the store lock but written after it is
/// released, so writers can finish out of order. Every encoding carries a
/// generation number; a write older than the one on disk is skipped.
#[derive(Debug)]
pub(super) struct SnapshotFile {
    path: PathBuf,
    written: Mutex<u64>,
}

impl SnapshotFile {
    pub(super) fn new(path: PathBuf) -> Self {
        Self {
            path,
            written: Mutex::new(0),
        }
    }

    pub(super) fn path(&self) -> &Path {
        &self.path
    }

    /// Blocking. Run on the blocking pool.
    pub(super) fn write(&self, generation: u64, bytes: &[u8]) -> io::Result<()> {
        let mut written = self.written.lock();
        if generation <= *written {
            return Ok(());
        }
        write_atomic(&self.path, bytes)?;
        *written = generation;
        Ok(())
    }
}

/// Write `bytes` to `path` atomically: temp file, fsync, then rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("state.json")).unwrap().is_none());
    }

    #[test]
    fn corrupt_file_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{not json").unwrap();

        let err = load(&path).unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
    }

    #[test]
    fn older_generation_never_overwrites_newer() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("state.json"));

        file.write(2, b"second").unwrap();
        file.write(1, b"first").unwrap();

        assert_eq!(fs::read(file.path()).unwrap(), b"second");
    }

    #[test]
    fn creates_missing_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("nested").join("state.json"));

        file.write(1, b"{}").unwrap();

        assert_eq!(fs::read(file.path()).unwrap(), b"{}");
        assert!(!file.path().with_extension("tmp").exists());
    }
}
