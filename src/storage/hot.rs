//! In-memory hot tier
//!
//! Byte-budget LRU of recently committed artifacts, keyed by their on-disk
//! location. One mutex guards the whole structure so admission and eviction
//! of an entry are observed atomically by concurrent readers.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

struct Entry {
    data: Arc<[u8]>,
    tick: u64,
}

#[derive(Default)]
struct HotState {
    entries: HashMap<PathBuf, Entry>,
    /// Recency order, oldest first
    order: BTreeMap<u64, PathBuf>,
    used: u64,
    tick: u64,
}

impl HotState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, path: &Path) -> Option<Entry> {
        let entry = self.entries.remove(path)?;
        self.order.remove(&entry.tick);
        self.used -= entry.data.len() as u64;
        Some(entry)
    }
}

/// Bounded in-memory artifact cache
pub struct HotTier {
    capacity: u64,
    state: Mutex<HotState>,
}

impl HotTier {
    /// Create a hot tier holding at most `capacity` bytes; 0 disables it
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Mutex::new(HotState::default()),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Whether an artifact of `size` bytes could ever be admitted
    pub fn accepts(&self, size: u64) -> bool {
        self.is_enabled() && size <= self.capacity
    }

    /// Look up an entry, marking it most recently used
    pub fn get(&self, path: &Path) -> Option<Arc<[u8]>> {
        if !self.is_enabled() {
            return None;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let tick = state.next_tick();
        let state = &mut *state;
        let entry = state.entries.get_mut(path)?;
        state.order.remove(&entry.tick);
        entry.tick = tick;
        state.order.insert(tick, path.to_path_buf());
        Some(Arc::clone(&entry.data))
    }

    /// Presence check that leaves recency untouched
    pub fn contains(&self, path: &Path) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.entries.contains_key(path)
    }

    /// Admit an entry, evicting least recently used entries to make room.
    ///
    /// Replaces any existing entry for the same path. Returns false when the
    /// entry can never fit.
    pub fn admit(&self, path: PathBuf, data: Arc<[u8]>) -> bool {
        let size = data.len() as u64;
        if !self.accepts(size) {
            return false;
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.remove(&path);

        while state.used + size > self.capacity {
            let Some((_, oldest)) = state.order.pop_first() else {
                break;
            };
            if let Some(evicted) = state.entries.remove(&oldest) {
                state.used -= evicted.data.len() as u64;
                log::trace!("hot tier evicted {:?} ({} bytes)", oldest, evicted.data.len());
            }
        }

        let tick = state.next_tick();
        state.order.insert(tick, path.clone());
        state.entries.insert(path, Entry { data, tick });
        state.used += size;
        true
    }

    /// Drop an entry if present
    pub fn evict(&self, path: &Path) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.remove(path).is_some()
    }

    /// Number of entries and bytes currently held
    pub fn usage(&self) -> (usize, u64) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        (state.entries.len(), state.used)
    }
}
