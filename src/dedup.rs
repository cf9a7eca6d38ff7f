//! Nonce-based deduplication: the hub-global broadcast cache and the
//! per-connection inbound-only cache.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use hashlink::LinkedHashMap;
use lru::LruCache;
use parking_lot::Mutex;

/// Bounded set of recently broadcast nonces with time-windowed eviction.
///
/// This is the single authority for outbound dedup (see the Open Questions
/// decision: the per-connection `SeenNonces` set below is inbound-only).
/// Capacity eviction and the time window are both enforced: an entry can
/// leave either because the cache is full (LRU) or because it has aged out
/// of `window`, whichever happens first.
pub struct GlobalDedupCache {
    inner: Mutex<LruCache<String, Instant>>,
    window: Duration,
}

impl GlobalDedupCache {
    pub fn new(capacity: usize, window: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            window,
        }
    }

    /// Returns `true` if `nonce` was already present within the window
    /// (a duplicate); inserts it either way so the window slides forward.
    pub fn insert_if_absent(&self, nonce: &str) -> bool {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        if let Some(seen_at) = guard.get(nonce) {
            if now.duration_since(*seen_at) < self.window {
                return true;
            }
        }
        guard.put(nonce.to_string(), now);
        false
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-connection bounded FIFO set of nonces seen on inbound (client-
/// originated) frames. Capacity `K`, FIFO eviction — oldest entry is
/// dropped first regardless of access recency, unlike an LRU.
pub struct SeenNonces {
    entries: LinkedHashMap<String, ()>,
    capacity: usize,
}

impl SeenNonces {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LinkedHashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns `true` if `nonce` was already present.
    pub fn check_and_insert(&mut self, nonce: &str) -> bool {
        if self.entries.contains_key(nonce) {
            return true;
        }
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.insert(nonce.to_string(), ());
        false
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_cache_rejects_duplicate_within_window() {
        let cache = GlobalDedupCache::new(100, Duration::from_secs(60));
        assert!(!cache.insert_if_absent("n1"));
        assert!(cache.insert_if_absent("n1"));
    }

    #[test]
    fn global_cache_admits_after_window_elapses() {
        let cache = GlobalDedupCache::new(100, Duration::from_millis(20));
        assert!(!cache.insert_if_absent("n1"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!cache.insert_if_absent("n1"));
    }

    #[test]
    fn global_cache_evicts_lru_when_full() {
        let cache = GlobalDedupCache::new(2, Duration::from_secs(60));
        assert!(!cache.insert_if_absent("a"));
        assert!(!cache.insert_if_absent("b"));
        assert!(!cache.insert_if_absent("c"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn seen_nonces_fifo_eviction() {
        let mut set = SeenNonces::new(2);
        assert!(!set.check_and_insert("a"));
        assert!(!set.check_and_insert("b"));
        assert!(!set.check_and_insert("c"));
        assert_eq!(set.len(), 2);
        // "a" was evicted FIFO, so re-inserting it is not a duplicate.
        assert!(!set.check_and_insert("a"));
    }

    #[test]
    fn seen_nonces_detects_duplicate() {
        let mut set = SeenNonces::new(4);
        assert!(!set.check_and_insert("x"));
        assert!(set.check_and_insert("x"));
    }
}
