//! Keyed advisory locks.
//!
//! A key is held while its guard lives. Contention is rejected, never
//! queued. Entries exist only while held, so the table never grows past the
//! number of in-flight holders.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Clone, Default)]
pub struct KeyedLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when `key` is already held.
    pub fn try_acquire(&self, key: &str) -> Option<KeyGuard> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(key.to_string()) {
            return None;
        }
        Some(KeyGuard {
            key: key.to_string(),
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[must_use = "the lock is released when the guard is dropped"]
pub struct KeyGuard {
    key: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}
