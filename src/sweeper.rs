//! Retention sweeper
//!
//! Removes artifacts whose last access is older than a client-supplied
//! number of days. Sweeps are rate limited process-wide: at most one per
//! cooldown window, requests inside the window are dropped.

use crate::storage::Storage;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

/// Minimum spacing between two sweeps
pub const SWEEP_COOLDOWN: Duration = Duration::from_secs(60 * 60);

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Outcome of one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Regular files examined
    pub scanned: u64,
    /// Files deleted
    pub removed: u64,
    /// Bytes freed
    pub bytes: u64,
    /// Files that could not be examined or deleted
    pub skipped: u64,
}

/// Access-time based artifact eviction
pub struct Sweeper {
    storage: Arc<Storage>,
    cooldown: Duration,
    last_run: Mutex<Option<Instant>>,
}

impl Sweeper {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self::with_cooldown(storage, SWEEP_COOLDOWN)
    }

    pub fn with_cooldown(storage: Arc<Storage>, cooldown: Duration) -> Self {
        Self {
            storage,
            cooldown,
            last_run: Mutex::new(None),
        }
    }

    /// Claim the next sweep, or return false if one ran inside the cooldown
    fn try_claim(&self) -> bool {
        let mut last_run = self.last_run.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match *last_run {
            Some(at) if now.duration_since(at) < self.cooldown => false,
            _ => {
                *last_run = Some(now);
                true
            }
        }
    }

    /// Start a sweep of `namespace` on a background thread.
    ///
    /// Returns false when the request fell inside the cooldown.
    pub fn trigger(self: &Arc<Self>, namespace: &str, days: u16) -> bool {
        if !self.try_claim() {
            log::debug!("clean {} ({} days) skipped: cooldown active", namespace, days);
            return false;
        }

        let sweeper = Arc::clone(self);
        let namespace = namespace.to_string();
        let spawned = thread::Builder::new()
            .name("sweeper".to_string())
            .spawn(move || {
                let stats = sweeper.sweep(&namespace, days);
                log::info!(
                    "clean {} ({} days): removed {} of {} files, {} bytes freed, {} skipped",
                    namespace,
                    days,
                    stats.removed,
                    stats.scanned,
                    stats.bytes,
                    stats.skipped
                );
            });
        if let Err(e) = spawned {
            log::error!("failed to start sweeper thread: {}", e);
            return false;
        }
        true
    }

    /// Sweep synchronously, subject to the same cooldown as `trigger`
    pub fn sweep_now(&self, namespace: &str, days: u16) -> Option<SweepStats> {
        if !self.try_claim() {
            return None;
        }
        Some(self.sweep(namespace, days))
    }

    fn sweep(&self, namespace: &str, days: u16) -> SweepStats {
        let started = SystemTime::now();
        let max_age = Duration::from_secs(u64::from(days) * SECS_PER_DAY);
        let dir = self.storage.namespace_dir(namespace);
        let mut stats = SweepStats::default();

        for entry in WalkDir::new(&dir) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::debug!("clean walk error under {:?}: {}", dir, e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            stats.scanned += 1;

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(_) => {
                    stats.skipped += 1;
                    continue;
                }
            };
            let accessed = match metadata.accessed() {
                Ok(t) if t != UNIX_EPOCH => t,
                _ => {
                    stats.skipped += 1;
                    continue;
                }
            };
            let expired = started
                .duration_since(accessed)
                .map(|age| age > max_age)
                .unwrap_or(false);
            if !expired {
                continue;
            }

            match self.storage.remove(entry.path()) {
                Ok(()) => {
                    stats.removed += 1;
                    stats.bytes += metadata.len();
                    log::debug!("clean removed {:?} ({} bytes)", entry.path(), metadata.len());
                }
                Err(_) => stats.skipped += 1,
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ArtifactKey, Digest};
    use std::io::Write;
    use tempfile::TempDir;

    fn store(storage: &Storage, namespace: &str, fill: u8) -> std::path::PathBuf {
        let key = ArtifactKey::new(Digest::from_bytes([fill; 32]), 0);
        let mut pending = storage.create(namespace, &key, 4).unwrap();
        pending.write_all(b"data").unwrap();
        pending.commit().unwrap();
        storage.location(namespace, &key)
    }

    #[test]
    fn test_zero_days_removes_accessed_files() {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp.path(), 1024).unwrap());
        let a = store(&storage, "v1", 1);
        let b = store(&storage, "v1", 2);
        let other = store(&storage, "v2", 3);
        thread::sleep(Duration::from_millis(50));

        let sweeper = Sweeper::new(Arc::clone(&storage));
        let stats = sweeper.sweep_now("v1", 0).unwrap();

        assert_eq!(stats.scanned, 2);
        assert_eq!(stats.removed, 2);
        assert_eq!(stats.bytes, 8);
        assert!(!a.exists());
        assert!(!b.exists());
        assert!(other.exists());
        // Memory copies go with the files
        assert_eq!(storage.hot_tier().usage(), (1, 4));
    }

    #[test]
    fn test_recent_files_survive() {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp.path(), 0).unwrap());
        let path = store(&storage, "v1", 1);

        let sweeper = Sweeper::new(Arc::clone(&storage));
        let stats = sweeper.sweep_now("v1", 30).unwrap();
        assert_eq!(stats.removed, 0);
        assert!(path.exists());
    }

    #[test]
    fn test_second_sweep_inside_cooldown_is_noop() {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp.path(), 0).unwrap());
        let sweeper = Arc::new(Sweeper::new(Arc::clone(&storage)));
        thread::sleep(Duration::from_millis(10));
        assert!(sweeper.sweep_now("v1", 0).is_some());

        let path = store(&storage, "v1", 9);
        thread::sleep(Duration::from_millis(50));
        assert!(sweeper.sweep_now("v1", 0).is_none());
        assert!(!sweeper.trigger("v1", 0));
        assert!(path.exists());
    }

    #[test]
    fn test_missing_namespace() {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp.path(), 0).unwrap());
        let sweeper = Sweeper::with_cooldown(storage, Duration::ZERO);
        assert_eq!(sweeper.sweep_now("absent", 0).unwrap(), SweepStats::default());
    }

    #[test]
    fn test_background_trigger() {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp.path(), 0).unwrap());
        let path = store(&storage, "v1", 4);
        thread::sleep(Duration::from_millis(50));

        let sweeper = Arc::new(Sweeper::new(Arc::clone(&storage)));
        assert!(sweeper.trigger("v1", 0));

        let deadline = Instant::now() + Duration::from_secs(5);
        while path.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!path.exists());
    }
}
