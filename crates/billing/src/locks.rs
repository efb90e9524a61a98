//! Keyed async mutexes
//!
//! One lock per key (user id, correlation id). Entries are pruned when the
//! last guard for a key is dropped, so the map only holds keys that are in
//! use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = HashMap<String, Arc<AsyncMutex<()>>>;

#[derive(Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<Mutex<LockMap>>,
}

/// Holds a key's lock until dropped
pub struct KeyedGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    map: Arc<Mutex<LockMap>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: impl Into<String>) -> KeyedGuard {
        let key = key.into();
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        let guard = mutex.lock_owned().await;
        KeyedGuard {
            key,
            guard: Some(guard),
            map: self.inner.clone(),
        }
    }

    /// Keys currently held or waited on
    pub fn active_keys(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        // Release first so a waiter can proceed, then prune if nobody else
        // holds a reference to this key's mutex.
        drop(self.guard.take());

        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mutex) = map.get(&self.key) {
            if Arc::strong_count(mutex) == 1 {
                map.remove(&self.key);
            }
        }
    }
}
