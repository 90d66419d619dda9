//! Async mutual exclusion keyed by string.
//!
//! Each key maps to a tokio `Mutex`, which queues waiters in FIFO order. The
//! guard is released on drop, so a critical section that returns an error,
//! panics, or is cancelled frees the key exactly once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

type Slot = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug, Default)]
pub struct KeyedLock {
    slots: Mutex<HashMap<String, Slot>>,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `critical_section` while holding `key`.
    ///
    /// Calls for other keys are not affected. Whatever the section returns is
    /// handed back unchanged, errors included.
    pub async fn run<F, Fut, T>(&self, key: &str, critical_section: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let release = Release {
            owner: self,
            key,
            slot: self.checkout(key),
        };
        let _guard = release.slot.lock().await;
        critical_section().await
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.lock_slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn checkout(&self, key: &str) -> Slot {
        self.lock_slots()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        // The map is only touched in short non-panicking sections
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Drops the map entry once nobody else references the slot.
struct Release<'a> {
    owner: &'a KeyedLock,
    key: &'a str,
    slot: Slot,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        let mut slots = self.owner.lock_slots();
        // One reference in the map, one here: no other holder or waiter.
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(self.key);
        }
    }
}
