//! Per-component TTL cache
//!
//! Uses tokio's clock so tests can drive expiry with a paused runtime.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

/// Cache owned by one component, with its TTL set at construction
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Value stored less than `ttl` ago
    pub fn get_fresh(&self, key: &K) -> Option<V> {
        self.get_within(key, self.ttl)
    }

    /// Value stored less than `max_age` ago, regardless of ttl
    pub fn get_within(&self, key: &K, max_age: Duration) -> Option<V> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|e| e.stored_at.elapsed() < max_age)
            .map(|e| e.value.clone())
    }

    /// Value and its age, however old
    pub fn get_any(&self, key: &K) -> Option<(V, Duration)> {
        let entries = self.entries.lock();
        entries.get(key).map(|e| (e.value.clone(), e.stored_at.elapsed()))
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.lock().insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop everything older than `max_age`
    pub fn evict_older_than(&self, max_age: Duration) {
        self.entries.lock().retain(|_, e| e.stored_at.elapsed() < max_age);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
