//! Bounded, time-boxed LRU cache used to deduplicate tracked events.
use std::{
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use lru::LruCache;

struct CacheItem<V> {
    value: V,
    expires_at: Instant,
}

/// Fixed-capacity LRU cache whose entries expire `ttl` after they were last set.
///
/// Not synchronized; wrap in a `Mutex` to share.
pub struct Cache<V> {
    items: LruCache<String, CacheItem<V>>,
    ttl: Duration,
}

impl<V: Clone> Cache<V> {
    /// A capacity of zero behaves as one.
    pub fn new(capacity: usize, ttl: Duration) -> Cache<V> {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Cache {
            items: LruCache::new(capacity),
            ttl,
        }
    }

    /// Value for `key` if present and unexpired, marking it most recently used. Expired entries
    /// are evicted.
    pub fn get(&mut self, key: &str) -> Option<V> {
        match self.items.get(key) {
            Some(item) if Instant::now() < item.expires_at => return Some(item.value.clone()),
            Some(_) => {}
            None => return None,
        }
        self.items.pop(key);
        None
    }

    /// Insert or refresh `key`, evicting the least recently used entry when full.
    pub fn set(&mut self, key: impl Into<String>, value: V) {
        let item = CacheItem {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.items.put(key.into(), item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
