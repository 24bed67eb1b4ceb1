//! Artifact storage
//!
//! Artifacts live in a sharded directory tree:
//! ```text
//! root/
//!   temp/
//!     5f0c...e1      (pending writes, 64 hex chars)
//!   <namespace>/
//!     ab/
//!       ab3f7c9d.../
//!         0          (slot number)
//!         1
//! ```
//! Writes land in `temp/` and are renamed into place, so readers never see
//! a partial artifact. An optional hot tier keeps recently committed
//! artifacts in memory.

pub mod handle;
pub mod hot;

pub use handle::{
    ArtifactSink, DiskHandle, HttpPassthroughHandle, MemoryHandle, NullHandle, PendingWrite,
    ReadHandle,
};
pub use hot::HotTier;

use crate::protocol::{ArtifactKey, TEMP_NAMESPACE};
use rand::RngCore;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("size mismatch: declared {expected} bytes, received {written}")]
    SizeMismatch { expected: u64, written: u64 },
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Content-addressed artifact store
pub struct Storage {
    root: PathBuf,
    temp_dir: PathBuf,
    hot: Arc<HotTier>,
}

impl Storage {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// `hot_capacity` is the hot tier byte budget; 0 disables it.
    pub fn open<P: AsRef<Path>>(root: P, hot_capacity: u64) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        let temp_dir = root.join(TEMP_NAMESPACE);
        fs::create_dir_all(&temp_dir)?;

        Ok(Self {
            root,
            temp_dir,
            hot: Arc::new(HotTier::new(hot_capacity)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn hot_tier(&self) -> &HotTier {
        &self.hot
    }

    /// Directory holding every artifact of a namespace
    pub fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }

    /// Directory holding every slot of a digest
    fn digest_dir(&self, namespace: &str, key: &ArtifactKey) -> PathBuf {
        let hex = key.digest.to_hex();
        self.namespace_dir(namespace).join(&hex[..2]).join(hex)
    }

    /// Final on-disk location of an artifact
    pub fn location(&self, namespace: &str, key: &ArtifactKey) -> PathBuf {
        self.digest_dir(namespace, key).join(key.slot.to_string())
    }

    /// Whether the artifact is present in memory or on disk
    pub fn contains(&self, namespace: &str, key: &ArtifactKey) -> bool {
        let path = self.location(namespace, key);
        if self.hot.contains(&path) {
            return true;
        }
        fs::metadata(&path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
    }

    /// Open an artifact for reading.
    ///
    /// Returns `None` when it does not exist. Empty files are treated as
    /// absent so a hit always carries a body.
    pub fn open_artifact(&self, namespace: &str, key: &ArtifactKey) -> StorageResult<Option<ReadHandle>> {
        let path = self.location(namespace, key);
        if let Some(data) = self.hot.get(&path) {
            return Ok(Some(ReadHandle::Memory(MemoryHandle::new(data))));
        }

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let metadata = file.metadata()?;
        if !metadata.is_file() || metadata.len() == 0 {
            return Ok(None);
        }
        Ok(Some(ReadHandle::Disk(DiskHandle::new(file, metadata.len()))))
    }

    /// Start writing an artifact of exactly `size` bytes
    pub fn create(&self, namespace: &str, key: &ArtifactKey, size: u64) -> StorageResult<PendingWrite> {
        let dir = self.digest_dir(namespace, key);
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(&self.temp_dir)?;

        let temp_path = self.temp_dir.join(random_temp_name());
        let final_path = dir.join(key.slot.to_string());
        PendingWrite::create(temp_path, final_path, size, Arc::clone(&self.hot))
    }

    /// Delete an artifact file, dropping any in-memory copy first
    pub fn remove(&self, path: &Path) -> io::Result<()> {
        self.hot.evict(path);
        fs::remove_file(path)
    }
}

fn random_temp_name() -> String {
    let mut name = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut name);
    hex::encode(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Digest;
    use std::io::{Read, Write};
    use tempfile::TempDir;

    fn key(fill: u8, slot: u32) -> ArtifactKey {
        ArtifactKey::new(Digest::from_bytes([fill; 32]), slot)
    }

    fn read_all(handle: &mut ReadHandle) -> Vec<u8> {
        let mut out = Vec::new();
        handle.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_location_layout() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::open(temp.path(), 0).unwrap();

        let path = storage.location("v1", &key(0xAB, 7));
        let hex = "ab".repeat(32);
        assert_eq!(path, temp.path().join("v1").join("ab").join(&hex).join("7"));
        assert!(storage.temp_dir().is_dir());
    }

    #[test]
    fn test_write_and_read() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::open(temp.path(), 0).unwrap();
        let k = key(0, 0);

        let mut pending = storage.create("v1", &k, 5).unwrap();
        pending.write_all(b"hello").unwrap();
        assert_eq!(pending.commit().unwrap(), 5);

        let mut handle = storage.open_artifact("v1", &k).unwrap().unwrap();
        assert_eq!(handle.kind(), "disk");
        assert_eq!(handle.size(), 5);
        assert_eq!(read_all(&mut handle), b"hello");
        assert!(storage.contains("v1", &k));
        assert!(!storage.contains("v2", &k));
    }

    #[test]
    fn test_contains_keeps_hot_tier_order() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::open(temp.path(), 8).unwrap();
        for fill in 1..=2u8 {
            let mut pending = storage.create("v1", &key(fill, 0), 4).unwrap();
            pending.write_all(b"data").unwrap();
            pending.commit().unwrap();
        }

        assert!(storage.contains("v1", &key(1, 0)));
        let mut pending = storage.create("v1", &key(3, 0), 4).unwrap();
        pending.write_all(b"data").unwrap();
        pending.commit().unwrap();

        // The presence check did not save the oldest entry from eviction
        let oldest = storage.open_artifact("v1", &key(1, 0)).unwrap().unwrap();
        assert_eq!(oldest.kind(), "disk");
        let newer = storage.open_artifact("v1", &key(2, 0)).unwrap().unwrap();
        assert_eq!(newer.kind(), "memory");
    }

    #[test]
    fn test_missing_artifact() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::open(temp.path(), 0).unwrap();
        assert!(storage.open_artifact("v1", &key(0xFF, 0)).unwrap().is_none());
    }

    #[test]
    fn test_uncommitted_write_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::open(temp.path(), 0).unwrap();
        let k = key(1, 0);

        let mut pending = storage.create("v1", &k, 10).unwrap();
        pending.write_all(b"part").unwrap();
        let temp_path = pending.temp_path().to_path_buf();
        assert!(temp_path.exists());
        drop(pending);

        assert!(!temp_path.exists());
        assert!(!storage.location("v1", &k).exists());
    }

    #[test]
    fn test_short_write_refuses_commit() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::open(temp.path(), 0).unwrap();
        let k = key(2, 0);

        let mut pending = storage.create("v1", &k, 10).unwrap();
        pending.write_all(b"short").unwrap();
        let result = pending.commit();
        assert!(matches!(
            result,
            Err(StorageError::SizeMismatch { expected: 10, written: 5 })
        ));
        assert!(!storage.location("v1", &k).exists());
        assert_eq!(fs::read_dir(storage.temp_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_write_past_size_rejected() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::open(temp.path(), 0).unwrap();

        let mut pending = storage.create("v1", &key(3, 0), 3).unwrap();
        let err = pending.write_all(b"toolong").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_hot_tier_serves_from_memory() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::open(temp.path(), 1024).unwrap();
        let k = key(4, 1);

        let mut pending = storage.create("v1", &k, 4).unwrap();
        pending.write_all(b"warm").unwrap();
        pending.commit().unwrap();

        // Disk copy gone, memory copy still answers
        fs::remove_file(storage.location("v1", &k)).unwrap();
        let mut handle = storage.open_artifact("v1", &k).unwrap().unwrap();
        assert_eq!(handle.kind(), "memory");
        assert_eq!(read_all(&mut handle), b"warm");
    }

    #[test]
    fn test_oversized_commit_evicts_stale_memory_copy() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::open(temp.path(), 8).unwrap();
        let k = key(5, 0);

        let mut pending = storage.create("v1", &k, 4).unwrap();
        pending.write_all(b"tiny").unwrap();
        pending.commit().unwrap();
        assert_eq!(storage.hot_tier().usage(), (1, 4));

        let mut pending = storage.create("v1", &k, 16).unwrap();
        pending.write_all(&[7u8; 16]).unwrap();
        pending.commit().unwrap();
        assert_eq!(storage.hot_tier().usage(), (0, 0));

        let mut handle = storage.open_artifact("v1", &k).unwrap().unwrap();
        assert_eq!(handle.kind(), "disk");
        assert_eq!(read_all(&mut handle), vec![7u8; 16]);
    }

    #[test]
    fn test_remove_evicts_memory() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::open(temp.path(), 1024).unwrap();
        let k = key(6, 0);

        let mut pending = storage.create("v1", &k, 3).unwrap();
        pending.write_all(b"bye").unwrap();
        pending.commit().unwrap();

        storage.remove(&storage.location("v1", &k)).unwrap();
        assert!(storage.open_artifact("v1", &k).unwrap().is_none());
        assert!(!storage.contains("v1", &k));
    }

    #[test]
    fn test_passthrough_persists_full_body() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::open(temp.path(), 0).unwrap();
        let k = key(7, 0);

        let pending = storage.create("v1", &k, 6).unwrap();
        let body: Box<dyn Read + Send> = Box::new(io::Cursor::new(b"origin".to_vec()));
        let mut handle = ReadHandle::HttpPassthrough(HttpPassthroughHandle::new(body, pending));
        assert_eq!(handle.size(), 6);
        assert_eq!(read_all(&mut handle), b"origin");
        assert!(handle.finish().unwrap());

        assert_eq!(fs::read(storage.location("v1", &k)).unwrap(), b"origin");
    }

    #[test]
    fn test_passthrough_short_body_discarded() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::open(temp.path(), 0).unwrap();
        let k = key(8, 0);

        let pending = storage.create("v1", &k, 100).unwrap();
        let body: Box<dyn Read + Send> = Box::new(io::Cursor::new(b"cut".to_vec()));
        let mut handle = ReadHandle::HttpPassthrough(HttpPassthroughHandle::new(body, pending));
        assert_eq!(read_all(&mut handle), b"cut");
        assert!(!handle.finish().unwrap());

        assert!(!storage.location("v1", &k).exists());
        assert_eq!(fs::read_dir(storage.temp_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_null_handle() {
        let mut handle = ReadHandle::Null(NullHandle::new(3));
        assert_eq!(read_all(&mut handle), vec![0u8; 3]);

        let mut sink = ArtifactSink::Null(NullHandle::default());
        sink.write_all(b"ignored").unwrap();
        assert_eq!(sink.commit().unwrap(), None);
    }
}
