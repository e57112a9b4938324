// ============================================================================
// Keyed Async Lock
// ============================================================================
//
// One async mutex per entity identity. Entries are created on first use and
// kept for the life of the registry, so two callers asking for the same key
// always receive the same mutex.
//
// ============================================================================

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub type KeyedMutex = Arc<AsyncMutex<()>>;

/// Guard returned by [`LockRegistry::lock`]. The critical section ends when
/// it is dropped.
pub type KeyedLockGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<String, KeyedMutex>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mutex for `key`, creating it atomically on first use.
    pub fn get_sync_lock(&self, key: &str) -> KeyedMutex {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = locks.get(key) {
            return Arc::clone(existing);
        }
        let created: KeyedMutex = Arc::new(AsyncMutex::new(()));
        locks.insert(key.to_string(), Arc::clone(&created));
        created
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyedLockGuard {
        self.get_sync_lock(key).lock_owned().await
    }

    /// Number of keys ever locked.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
