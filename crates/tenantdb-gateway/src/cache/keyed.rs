//! Per-key async mutexes
//!
//! Each key gets its own `tokio::sync::Mutex`, created on first use and
//! dropped from the map once the last holder or waiter lets go.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Map of lazily created per-key locks.
#[derive(Debug, Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<LockMap>,
}

/// Holds the lock for one key until dropped.
#[derive(Debug)]
pub struct KeyedGuard {
    locks: Arc<LockMap>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks.entry(key.to_string()).or_default().clone()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let guard = self.mutex_for(key).lock_owned().await;
        self.guard(key, guard)
    }

    /// Take `key` only if nobody else holds it.
    pub fn try_lock(&self, key: &str) -> Option<KeyedGuard> {
        let mutex = self.mutex_for(key);
        match mutex.try_lock_owned() {
            Ok(guard) => Some(self.guard(key, guard)),
            Err(_) => None,
        }
    }

    /// Number of keys with a live lock.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn guard(&self, key: &str, guard: OwnedMutexGuard<()>) -> KeyedGuard {
        KeyedGuard {
            locks: Arc::clone(&self.locks),
            key: key.to_string(),
            guard: Some(guard),
        }
    }
}

impl KeyedGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        // Release the mutex first so its Arc count reflects only the map
        // and any waiters.
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
