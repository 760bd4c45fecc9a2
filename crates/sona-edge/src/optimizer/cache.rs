//! Result cache keyed by user and goal fingerprint.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::controller::OptimizationResult;

#[derive(Debug)]
struct CacheEntry {
    result: OptimizationResult,
    inserted: Instant,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<(String, String), CacheEntry>,
    hits: u64,
    misses: u64,
}

/// Bounded TTL cache of completed optimization results.
///
/// Keys use the pseudonymous user tag, never the raw user id.
#[derive(Debug)]
pub struct OptimizationCache {
    ttl: Duration,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl OptimizationCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self { ttl, capacity: capacity.max(1), state: Mutex::new(CacheState::default()) }
    }

    /// Fresh entry for `(user_tag, fingerprint)`, if any.
    pub fn get(&self, user_tag: &str, fingerprint: &str) -> Option<OptimizationResult> {
        let mut state = self.state.lock();
        let key = (user_tag.to_string(), fingerprint.to_string());
        let fresh = state.entries.get(&key).map(|e| e.inserted.elapsed() <= self.ttl);
        match fresh {
            Some(true) => {
                state.hits += 1;
                state.entries.get(&key).map(|e| e.result.clone())
            }
            Some(false) => {
                state.entries.remove(&key);
                state.misses += 1;
                None
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Store a result. Expired entries are dropped first, then the oldest
    /// entry if the cache is still full.
    pub fn insert(&self, user_tag: &str, fingerprint: &str, result: OptimizationResult) {
        let mut state = self.state.lock();
        let ttl = self.ttl;
        state.entries.retain(|_, e| e.inserted.elapsed() <= ttl);

        let key = (user_tag.to_string(), fingerprint.to_string());
        while state.entries.len() >= self.capacity && !state.entries.contains_key(&key) {
            let oldest = state.entries.iter().min_by_key(|(_, e)| e.inserted).map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    state.entries.remove(&k);
                }
                None => break,
            }
        }
        state.entries.insert(key, CacheEntry { result, inserted: Instant::now() });
    }

    /// Drop every entry for a user. Called whenever the user's model changes.
    pub fn invalidate_user(&self, user_tag: &str) {
        self.state.lock().entries.retain(|(tag, _), _| tag != user_tag);
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.hits, state.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::controller::tests::sample_result;

    #[test]
    fn hit_after_insert_and_miss_for_other_goals() {
        let cache = OptimizationCache::new(Duration::from_secs(60), 4);
        cache.insert("u-a", "g1", sample_result("u-a"));
        assert!(cache.get("u-a", "g1").is_some());
        assert!(cache.get("u-a", "g2").is_none());
        assert!(cache.get("u-b", "g1").is_none());
        assert_eq!(cache.stats(), (1, 2));
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = OptimizationCache::new(Duration::from_millis(0), 4);
        cache.insert("u-a", "g1", sample_result("u-a"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("u-a", "g1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn oldest_entry_evicted_at_capacity() {
        let cache = OptimizationCache::new(Duration::from_secs(60), 2);
        cache.insert("u-a", "g", sample_result("u-a"));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("u-b", "g", sample_result("u-b"));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("u-c", "g", sample_result("u-c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("u-a", "g").is_none());
        assert!(cache.get("u-c", "g").is_some());
    }

    #[test]
    fn invalidate_only_touches_one_user() {
        let cache = OptimizationCache::new(Duration::from_secs(60), 8);
        cache.insert("u-a", "g1", sample_result("u-a"));
        cache.insert("u-a", "g2", sample_result("u-a"));
        cache.insert("u-b", "g1", sample_result("u-b"));
        cache.invalidate_user("u-a");
        assert_eq!(cache.len(), 1);
        assert!(cache.get("u-b", "g1").is_some());
    }
}
