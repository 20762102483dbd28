//! Per-correlation-key lock registry.
//!
//! Operations on different keys proceed in parallel; operations on the same
//! key are serialized in acquisition order (tokio's mutex is FIFO fair).
//! Entries exist only while some task holds or waits for the key.

use std::sync::Arc;

use correlator_core::CorrelationKey;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of async mutexes, one per correlation key in use.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<CorrelationKey, Arc<Mutex<()>>>,
}

impl KeyLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    ///
    /// The mutex is cloned out while the map entry is held, so a concurrent
    /// guard drop cannot remove an entry that a waiter is about to use.
    pub async fn lock(&self, key: &CorrelationKey) -> KeyLockGuard<'_> {
        let mutex = Arc::clone(self.locks.entry(key.clone()).or_default().value());
        let guard = mutex.lock_owned().await;
        KeyLockGuard {
            locks: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or awaited.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one correlation key. Dropping it unlocks the key and
/// reclaims the registry entry when nobody else is waiting.
#[derive(Debug)]
pub struct KeyLockGuard<'a> {
    locks: &'a KeyLocks,
    key: CorrelationKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLockGuard<'_> {
    fn drop(&mut self) {
        // Two references: the registry's and the one inside our guard.
        // Anything above that is a waiter that still needs this entry.
        self.locks
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 2);
        self.guard.take();
    }
}
