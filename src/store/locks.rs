//! Per-key lock table
//!
//! Fine-grained locks serializing operations on a single key. Locks live
//! in a weak map: the table holds `Weak` references and hands out `Arc`s,
//! so a lock is reclaimed as soon as no operation is using it and the
//! table cannot grow without bound.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Reclaim dead entries once the table grows past this many slots
const REAP_THRESHOLD: usize = 1024;

/// Weak map of per-key mutexes
pub struct KeyLocks {
    map: Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Get the lock for a key, creating it if no operation holds one.
    ///
    /// Callers keep the returned `Arc` alive for the duration of their
    /// critical section: `let lock = locks.acquire(key); let _g = lock.lock();`
    pub fn acquire(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.map.lock();

        if let Some(existing) = map.get(key).and_then(Weak::upgrade) {
            return existing;
        }

        if map.len() >= REAP_THRESHOLD {
            map.retain(|_, weak| weak.strong_count() > 0);
        }

        let lock = Arc::new(Mutex::new(()));
        map.insert(key.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Number of live entries (testing)
    pub fn live_count(&self) -> usize {
        self.map
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_returns_same_lock() {
        let locks = KeyLocks::new();
        let a = locks.acquire("k");
        let b = locks.acquire("k");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_dropped_locks_are_reclaimable() {
        let locks = KeyLocks::new();
        {
            let _held = locks.acquire("k");
            assert_eq!(locks.live_count(), 1);
        }
        assert_eq!(locks.live_count(), 0);
    }

    #[test]
    fn test_distinct_keys_get_distinct_locks() {
        let locks = KeyLocks::new();
        let a = locks.acquire("a");
        let b = locks.acquire("b");
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
