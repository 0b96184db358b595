//! Identity cache, one per transaction chain
//!
//! Maps (entity type, identity) to the shared instance loaded earlier in the
//! chain. Bounded by an LRU; the root clears it when it ends.

use crate::entity::IdentityKey;
use lru::LruCache;
use std::any::{Any, TypeId};
use std::num::NonZeroUsize;
use std::sync::Arc;

type CacheKey = (TypeId, IdentityKey);

struct CacheEntry {
    entity: Arc<dyn Any + Send + Sync>,
    /// `false` for relation stubs that only carry prefixed columns
    loaded: bool,
}

/// Bounded identity map.
pub struct IdentityCache {
    entries: LruCache<CacheKey, CacheEntry>,
    hits: u64,
    misses: u64,
}

impl IdentityCache {
    /// Creates a cache holding at most `capacity` entities (at least one).
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
            hits: 0,
            misses: 0,
        }
    }

    /// Any cached instance, stub or fully loaded.
    pub fn get<E: Send + Sync + 'static>(&mut self, key: &IdentityKey) -> Option<Arc<E>> {
        self.get_entry::<E>(key).map(|(entity, _)| entity)
    }

    /// Only instances that were loaded from their own row.
    pub fn get_loaded<E: Send + Sync + 'static>(&mut self, key: &IdentityKey) -> Option<Arc<E>> {
        match self.get_entry::<E>(key) {
            Some((entity, true)) => Some(entity),
            _ => None,
        }
    }

    pub fn put<E: Send + Sync + 'static>(&mut self, key: IdentityKey, entity: Arc<E>, loaded: bool) {
        self.entries.put(
            (TypeId::of::<E>(), key),
            CacheEntry {
                entity,
                loaded,
            },
        );
    }

    pub fn invalidate<E: 'static>(&mut self, key: &IdentityKey) {
        self.entries.pop(&(TypeId::of::<E>(), key.clone()));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.len(),
            capacity: self.entries.cap().get(),
            hits: self.hits,
            misses: self.misses,
        }
    }

    fn get_entry<E: Send + Sync + 'static>(&mut self, key: &IdentityKey) -> Option<(Arc<E>, bool)> {
        let found = self
            .entries
            .get(&(TypeId::of::<E>(), key.clone()))
            .and_then(|entry| {
                Arc::clone(&entry.entity)
                    .downcast::<E>()
                    .ok()
                    .map(|entity| (entity, entry.loaded))
            });
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}
