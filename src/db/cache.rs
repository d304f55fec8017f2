//! Bounded LRU cache of loaded segment artifacts, keyed by file location.
//!
//! The resident byte total never exceeds the configured capacity: an insert
//! evicts least-recently-used entries until the new artifact fits, and an
//! artifact larger than the whole capacity is refused outright. Preload
//! admission (capacity - usage) is checked by the caller and is advisory
//! only; correctness relies on eviction here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::engine::SegmentData;

pub struct CacheManager {
    name: &'static str,
    capacity: u64,
    usage: AtomicU64,
    entries: Mutex<LruCache<String, Arc<SegmentData>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheManager {
    pub fn new(name: &'static str, capacity: u64) -> Self {
        Self {
            name,
            capacity,
            usage: AtomicU64::new(0),
            entries: Mutex::new(LruCache::unbounded()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn usage(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }

    /// Insert an artifact, evicting LRU entries until it fits. Oversized
    /// artifacts are refused so the capacity invariant always holds.
    pub fn insert(&self, key: String, data: Arc<SegmentData>) -> bool {
        let size = data.mem_size();
        if size > self.capacity {
            warn!(
                cache = self.name,
                key = %key,
                size,
                capacity = self.capacity,
                "artifact larger than cache capacity, not admitted"
            );
            return false;
        }

        let mut entries = self.entries.lock();
        if let Some(old) = entries.pop(&key) {
            self.usage.fetch_sub(old.mem_size(), Ordering::Relaxed);
        }
        while self.usage.load(Ordering::Relaxed) + size > self.capacity {
            match entries.pop_lru() {
                Some((evicted_key, evicted)) => {
                    self.usage.fetch_sub(evicted.mem_size(), Ordering::Relaxed);
                    debug!(cache = self.name, key = %evicted_key, "evicted");
                }
                None => break,
            }
        }
        entries.push(key, data);
        self.usage.fetch_add(size, Ordering::Relaxed);
        true
    }

    /// Fetch an artifact, marking it most-recently-used.
    pub fn lookup(&self, key: &str) -> Option<Arc<SegmentData>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(data) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(data.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn erase(&self, key: &str) {
        let mut entries = self.entries.lock();
        if let Some(old) = entries.pop(key) {
            self.usage.fetch_sub(old.mem_size(), Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn print_info(&self) {
        debug!(
            cache = self.name,
            capacity = self.capacity,
            usage = self.usage(),
            entries = self.len(),
            hits = self.hits.load(Ordering::Relaxed),
            misses = self.misses.load(Ordering::Relaxed),
            "cache info"
        );
    }
}
