// ============================================================================
// Entity Cache
// ============================================================================
//
// The cache never decides when to invalidate; the save engine does. Every
// operation here is idempotent so the engine can remove an entry right after
// a write and again when the surrounding transaction completes.
//
// Row versions are remembered separately from the cached records and survive
// removal. A record read before a concurrent write carries an older row
// version and is refused by `add`. The versions live in their own LRU of the
// same capacity, and `clear` forgets them along with the records.
//
// ============================================================================

use crate::core::{EntityId, EntityRecord};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

pub trait EntityCache: Send + Sync {
    fn get(&self, type_name: &str, id: &EntityId) -> Option<EntityRecord>;

    /// Caches a loaded record. Returns false when the record is older than
    /// the last row version seen for its identity.
    fn add(&self, record: EntityRecord) -> bool;

    fn remove(&self, type_name: &str, id: &EntityId);

    fn remove_type(&self, type_name: &str);

    fn update_row_version(&self, type_name: &str, id: &EntityId, row_version: u64);

    fn row_version(&self, type_name: &str, id: &EntityId) -> Option<u64>;

    fn clear(&self);
}

type CacheKey = (String, String);

fn cache_key(type_name: &str, id: &EntityId) -> CacheKey {
    (type_name.to_string(), id.to_string())
}

struct CacheState {
    records: LruCache<CacheKey, EntityRecord>,
    row_versions: LruCache<CacheKey, u64>,
}

/// Bounded in-process cache with least-recently-used eviction.
pub struct LruEntityCache {
    state: Mutex<CacheState>,
}

impl LruEntityCache {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                records: LruCache::new(capacity),
                row_versions: LruCache::new(capacity),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LruEntityCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl EntityCache for LruEntityCache {
    fn get(&self, type_name: &str, id: &EntityId) -> Option<EntityRecord> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.records.get(&cache_key(type_name, id)).cloned()
    }

    fn add(&self, record: EntityRecord) -> bool {
        let Some(id) = record.id.as_ref() else {
            return false;
        };
        let key = cache_key(&record.type_name, id);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(known) = state.row_versions.peek(&key) {
            if record.row_version < *known {
                debug!(entity = %record.type_name, id = %id, "refusing outdated cache entry");
                return false;
            }
        }
        state.row_versions.put(key.clone(), record.row_version);
        state.records.put(key, record);
        true
    }

    fn remove(&self, type_name: &str, id: &EntityId) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.records.pop(&cache_key(type_name, id));
    }

    fn remove_type(&self, type_name: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let keys: Vec<CacheKey> = state
            .records
            .iter()
            .filter(|(key, _)| key.0 == type_name)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            state.records.pop(&key);
        }
    }

    fn update_row_version(&self, type_name: &str, id: &EntityId, row_version: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let key = cache_key(type_name, id);
        match state.row_versions.get_mut(&key) {
            Some(known) if row_version > *known => *known = row_version,
            Some(_) => {}
            None => {
                state.row_versions.put(key, row_version);
            }
        }
    }

    fn row_version(&self, type_name: &str, id: &EntityId) -> Option<u64> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.row_versions.peek(&cache_key(type_name, id)).copied()
    }

    fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.records.clear();
        state.row_versions.clear();
    }
}

impl std::fmt::Debug for LruEntityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruEntityCache").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(type_name: &str, id: i64, row_version: u64) -> EntityRecord {
        let mut record = EntityRecord::new(type_name, Some(EntityId::Int(id)), json!({ "n": id }));
        record.row_version = row_version;
        record.is_new = false;
        record
    }

    #[test]
    fn test_add_get_remove() {
        let cache = LruEntityCache::new(16);
        assert!(cache.add(record("Person", 1, 1)));
        assert_eq!(cache.get("Person", &EntityId::Int(1)).unwrap().row_version, 1);

        cache.remove("Person", &EntityId::Int(1));
        assert!(cache.get("Person", &EntityId::Int(1)).is_none());
    }

    #[test]
    fn test_invalidation_is_idempotent() {
        let cache = LruEntityCache::new(16);
        cache.add(record("Person", 1, 1));
        cache.add(record("Person", 2, 1));
        cache.add(record("Order", 1, 1));

        cache.remove("Person", &EntityId::Int(1));
        cache.remove("Person", &EntityId::Int(1));
        cache.remove_type("Person");
        cache.remove_type("Person");

        assert!(cache.get("Person", &EntityId::Int(2)).is_none());
        assert!(cache.get("Order", &EntityId::Int(1)).is_some());

        cache.clear();
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_outdated_record_is_refused() {
        let cache = LruEntityCache::new(16);
        cache.update_row_version("Person", &EntityId::Int(1), 3);
        assert!(!cache.add(record("Person", 1, 2)));
        assert!(cache.get("Person", &EntityId::Int(1)).is_none());
        assert!(cache.add(record("Person", 1, 3)));
    }

    #[test]
    fn test_row_version_only_moves_forward() {
        let cache = LruEntityCache::new(16);
        cache.update_row_version("Person", &EntityId::Int(1), 5);
        cache.update_row_version("Person", &EntityId::Int(1), 4);
        assert_eq!(cache.row_version("Person", &EntityId::Int(1)), Some(5));
    }

    #[test]
    fn test_capacity_evicts_least_recent() {
        let cache = LruEntityCache::new(2);
        cache.add(record("Person", 1, 1));
        cache.add(record("Person", 2, 1));
        cache.get("Person", &EntityId::Int(1));
        cache.add(record("Person", 3, 1));

        assert!(cache.get("Person", &EntityId::Int(1)).is_some());
        assert!(cache.get("Person", &EntityId::Int(2)).is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_row_versions_are_bounded_by_capacity() {
        let cache = LruEntityCache::new(2);
        for id in 1..=3 {
            cache.update_row_version("Person", &EntityId::Int(id), 2);
        }

        assert_eq!(cache.row_version("Person", &EntityId::Int(1)), None);
        assert_eq!(cache.row_version("Person", &EntityId::Int(3)), Some(2));
    }

    #[test]
    fn test_clear_forgets_row_versions() {
        let cache = LruEntityCache::new(4);
        cache.update_row_version("Person", &EntityId::Int(1), 3);
        cache.remove("Person", &EntityId::Int(1));
        assert_eq!(cache.row_version("Person", &EntityId::Int(1)), Some(3));

        cache.clear();
        assert_eq!(cache.row_version("Person", &EntityId::Int(1)), None);
        assert!(cache.add(record("Person", 1, 1)));
    }
}
