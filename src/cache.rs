//! Bounded in-memory key→bytes store with size-based admission and LRU
//! eviction.

use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

/// Cache of remote objects, admitting entries up to a per-entry cap and
/// evicting least-recently-used entries to stay under a total byte budget.
///
/// A single mutex guards both the LRU map and the resident-byte counter so
/// admission/eviction decisions are atomic, per the design's requirement
/// that `pendingBytes`-style accounting never be updated out of step with
/// the structure it describes.
pub struct MemoryCache {
    inner: Mutex<Inner>,
    max_entry_size: u64,
    max_total_bytes: u64,
}

struct Inner {
    entries: LruCache<Box<[u8]>, Arc<[u8]>>,
    resident_bytes: u64,
}

impl MemoryCache {
    /// Creates a cache with no entry limit other than `max_total_bytes`
    /// unless `max_entry_size` is non-zero.
    pub fn new(max_total_bytes: u64, max_entry_size: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                resident_bytes: 0,
            }),
            max_entry_size,
            max_total_bytes,
        }
    }

    /// Returns whether `key` is present, bumping its recency.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.inner.lock().entries.get(key).is_some()
    }

    /// Returns the cached bytes for `key`, bumping its recency.
    pub fn get(&self, key: &[u8]) -> Option<Arc<[u8]>> {
        self.inner.lock().entries.get(key).cloned()
    }

    /// Admits `bytes` under `key` if it fits the per-entry cap and the
    /// total budget after evicting LRU entries as needed. Silently rejects
    /// entries that alone exceed `max_total_bytes`.
    pub fn maybe_add(&self, key: &[u8], bytes: Arc<[u8]>) {
        let size = bytes.len() as u64;

        if self.max_entry_size != 0 && size > self.max_entry_size {
            return;
        }
        if size > self.max_total_bytes {
            return;
        }

        let mut inner = self.inner.lock();

        if let Some(old) = inner.entries.peek(key) {
            inner.resident_bytes -= old.len() as u64;
        }

        while inner.resident_bytes + size > self.max_total_bytes {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => inner.resident_bytes -= evicted.len() as u64,
                None => break,
            }
        }

        inner.resident_bytes += size;
        inner.entries.put(key.into(), bytes);
    }

    /// Removes `key` if present. Idempotent.
    pub fn delete(&self, key: &[u8]) {
        let mut inner = self.inner.lock();
        if let Some(removed) = inner.entries.pop(key) {
            inner.resident_bytes -= removed.len() as u64;
        }
    }

    /// Current resident byte count, for tests and diagnostics.
    pub fn resident_bytes(&self) -> u64 {
        self.inner.lock().resident_bytes
    }
}
