//! Tier 4: small LRU cache for transient entries outside the main write path.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::types::Pattern;

pub struct EphemeralTier {
    cache: LruCache<u64, Pattern>,
}

impl EphemeralTier {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
        }
    }

    pub fn get(&mut self, id: u64) -> Option<Pattern> {
        self.cache.get(&id).cloned()
    }

    /// Insert, returning the ID pushed out if the cache was full.
    pub fn put(&mut self, pattern: Pattern) -> Option<u64> {
        let id = pattern.header.id;
        match self.cache.push(id, pattern) {
            Some((evicted, _)) if evicted != id => Some(evicted),
            _ => None,
        }
    }

    pub fn remove(&mut self, id: u64) -> Option<Pattern> {
        self.cache.pop(&id)
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
