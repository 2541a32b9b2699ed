//! Bounded keyed cache with TTL and max-size eviction.
//!
//! Backs the poller's memo of terminal operation outcomes so a long-running
//! process does not accumulate one entry per operation forever.
//!
//! Each entry is an operation id (~40 bytes) plus a small outcome, so the
//! default 10k entries stay well under 2 MB.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// - **Max capacity:** when full, the oldest entry is evicted on insert.
/// - **TTL:** expired entries are invisible to `get` and purged on insert.
pub struct BoundedCache<K, V> {
    map: HashMap<K, (V, Instant)>,
    max_size: usize,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone, V: Clone> BoundedCache<K, V> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            map: HashMap::new(),
            max_size: max_size.max(1),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map
            .get(key)
            .filter(|(_, t)| t.elapsed() < self.ttl)
            .map(|(v, _)| v.clone())
    }

    pub fn insert(&mut self, key: K, value: V) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.map.retain(|_, (_, t)| now.duration_since(*t) < ttl);
        while self.map.len() >= self.max_size && !self.map.contains_key(&key) {
            let oldest = self
                .map
                .iter()
                .min_by_key(|(_, (_, t))| *t)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.map.remove(&k);
                }
                None => break,
            }
        }
        self.map.insert(key, (value, now));
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key).map(|(v, _)| v)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut cache = BoundedCache::new(10, Duration::from_secs(3600));
        cache.insert("opid-1".to_string(), "hello");
        assert_eq!(cache.get(&"opid-1".to_string()), Some("hello"));
        assert_eq!(cache.get(&"opid-2".to_string()), None);
    }

    #[test]
    fn test_evicts_oldest() {
        let mut cache = BoundedCache::new(2, Duration::from_secs(3600));
        cache.insert(1, "a");
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(2, "b");
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(3, "c");
        assert!(cache.get(&1).is_none());
        assert_eq!(cache.get(&3), Some("c"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let mut cache = BoundedCache::new(2, Duration::from_secs(3600));
        cache.insert(1, "a");
        cache.insert(2, "b");
        cache.insert(2, "b2");
        assert_eq!(cache.get(&1), Some("a"));
        assert_eq!(cache.get(&2), Some("b2"));
    }

    #[test]
    fn test_expired_entries_are_hidden_and_purged() {
        let mut cache = BoundedCache::new(10, Duration::from_millis(5));
        cache.insert(1, "a");
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.get(&1).is_none());
        cache.insert(2, "b");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut cache = BoundedCache::new(10, Duration::from_secs(3600));
        cache.insert(1, 42);
        assert_eq!(cache.remove(&1), Some(42));
        assert!(cache.is_empty());
    }
}
