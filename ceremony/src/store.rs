//! Artifact storage. The presence of terminal artifacts is the only checkpoint
//! record the pipeline keeps, so every idempotency decision goes through
//! [`ArtifactStore::exists`].

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

pub trait ArtifactStore {
    fn exists(&self, path: &Path) -> bool;

    fn ensure_dir(&self, path: &Path) -> io::Result<()>;

    /// Moves `from` onto `to`, replacing a file or directory already there.
    /// On a single filesystem this is a rename, so `to` never holds a
    /// half-written artifact.
    fn promote(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn remove(&self, path: &Path) -> io::Result<()>;

    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Length in bytes of the file at `path`.
    fn size(&self, path: &Path) -> io::Result<u64>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FsStore;

impl ArtifactStore for FsStore {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn ensure_dir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn promote(&self, from: &Path, to: &Path) -> io::Result<()> {
        if to.exists() {
            self.remove(to)?;
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(from, to)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        }
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }
}

/// In-memory store for embedding the pipeline without touching disk.
///
/// Clones share the same contents, so a fake gateway can "produce" files the
/// sequencer later probes. Directories exist implicitly while they contain a
/// file.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    files: Arc<Mutex<BTreeMap<PathBuf, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
        self.lock().insert(path.into(), contents.into());
    }

    pub fn read(&self, path: &Path) -> Option<Vec<u8>> {
        self.lock().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<PathBuf, Vec<u8>>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.files.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} does not exist", path.display()),
    )
}

impl ArtifactStore for MemoryStore {
    fn exists(&self, path: &Path) -> bool {
        self.lock().keys().any(|key| key.starts_with(path))
    }

    fn ensure_dir(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn promote(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut files = self.lock();
        let moved: Vec<PathBuf> = files
            .keys()
            .filter(|key| key.starts_with(from))
            .cloned()
            .collect();
        if moved.is_empty() {
            return Err(not_found(from));
        }
        files.retain(|key, _| !key.starts_with(to));
        for old in moved {
            if let Some(contents) = files.remove(&old) {
                let suffix = old.strip_prefix(from).unwrap_or(Path::new(""));
                let new = if suffix.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(suffix)
                };
                files.insert(new, contents);
            }
        }
        Ok(())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let mut files = self.lock();
        let before = files.len();
        files.retain(|key, _| !key.starts_with(path));
        if files.len() == before {
            return Err(not_found(path));
        }
        Ok(())
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let bytes = self.read(path).ok_or_else(|| not_found(path))?;
        String::from_utf8(bytes).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        self.lock()
            .get(path)
            .map(|contents| contents.len() as u64)
            .ok_or_else(|| not_found(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_promotes_directories() {
        let store = MemoryStore::new();
        store.write("build/.staging-Demo/Demo_js/Demo.wasm", b"wasm".to_vec());
        store.write("build/.staging-Demo/Demo.r1cs", b"r1cs".to_vec());

        store
            .promote(
                Path::new("build/.staging-Demo/Demo_js"),
                Path::new("build/Demo_js"),
            )
            .unwrap();

        assert!(store.exists(Path::new("build/Demo_js")));
        assert_eq!(
            store.read(Path::new("build/Demo_js/Demo.wasm")).as_deref(),
            Some(&b"wasm"[..])
        );
        assert!(!store.exists(Path::new("build/.staging-Demo/Demo_js")));
        assert!(store.exists(Path::new("build/.staging-Demo/Demo.r1cs")));
    }

    #[test]
    fn memory_store_remove_reports_missing() {
        let store = MemoryStore::new();
        let err = store.remove(Path::new("nope")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn size_tracks_rewrites() {
        let store = MemoryStore::new();
        store.write("response", Vec::new());
        assert_eq!(store.size(Path::new("response")).unwrap(), 0);
        store.write("response", b"filled".to_vec());
        assert_eq!(store.size(Path::new("response")).unwrap(), 6);
        assert!(store.size(Path::new("missing")).is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("response");
        fs::write(&path, "abc").unwrap();
        assert_eq!(FsStore.size(&path).unwrap(), 3);
    }

    #[test]
    fn fs_store_promote_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("key.partial.zkey");
        let to = dir.path().join("key.zkey");
        fs::write(&from, "new").unwrap();
        fs::write(&to, "stale").unwrap();

        FsStore.promote(&from, &to).unwrap();

        assert!(!from.exists());
        assert_eq!(fs::read_to_string(&to).unwrap(), "new");
    }

    #[test]
    fn fs_store_removes_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("Demo_js");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("Demo.wasm"), "wasm").unwrap();

        FsStore.remove(&nested).unwrap();
        assert!(!FsStore.exists(&nested));
    }
}
