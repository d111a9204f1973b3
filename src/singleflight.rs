//! Per-key async locks for cache-fill coalescing.
//!
//! The embedding and context caches use this to guarantee that a miss
//! triggers exactly one upstream call per key while leaving other keys
//! untouched: take the key's lock, re-check the cache, then do the work.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Lock handle for `key`. Callers hold the returned mutex across the
    /// cache re-check and fill. Idle entries are swept opportunistically.
    pub fn for_key(&self, key: &K) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("keyed locks poisoned");
        // only this map holds idle entries; strong_count 1 means nobody is
        // using or awaiting that key's lock
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}
