//! Bounded recency cache for decoded values.

use crate::error::{Error, Result};

use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;

/// A least-recently-used value cache in front of log reads. It is a pure
/// memoization layer: it never reads the log and never checks expiry; the
/// engine decides what to insert and invalidate. Both inserts and lookups
/// count as use.
pub struct RecencyCache {
    entries: LruCache<String, Value>,
}

impl RecencyCache {
    /// Creates a cache with the given capacity, which must be positive.
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| Error::InvalidInput("cache capacity must be positive".to_string()))?;
        Ok(Self { entries: LruCache::new(capacity) })
    }

    /// Returns the cached value for a key, marking it most recently used.
    pub fn lookup(&mut self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Caches a value, marking it most recently used. If the cache is full,
    /// the least recently used entry is evicted.
    pub fn insert(&mut self, key: String, value: Value) {
        self.entries.put(key, value);
    }

    /// Drops a key from the cache, if cached.
    pub fn invalidate(&mut self, key: &str) {
        self.entries.pop(key);
    }

    /// Drops all cached entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Maximum number of entries the cache will hold.
    pub fn cap(&self) -> usize {
        self.entries.cap().get()
    }
}
