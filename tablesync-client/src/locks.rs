//! Keyed asynchronous locks.
//!
//! The engine serializes work per table and per item rather than
//! globally, so two writers touching different rows never contend. Locks
//! are created lazily per key and reference-counted: an entry is removed
//! from the map as soon as nobody holds or waits for it, keeping the maps
//! proportional to current contention instead of total keys ever seen.
//!
//! Each acquisition takes a [`RefLease`] before parking on the lock and
//! returns it when the lease drops, so a key is never removed while a
//! waiter is parked on it and a waiter whose acquire future is cancelled
//! (e.g. by a timeout) still checks itself back in.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{
    Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock,
};

struct Entry<L> {
    lock: Arc<L>,
    refs: usize,
}

/// One counted reference to a map entry, returned on drop.
struct RefLease<L> {
    map: Arc<DashMap<String, Entry<L>>>,
    key: String,
}

impl<L> Drop for RefLease<L> {
    fn drop(&mut self) {
        if let Some(mut entry) = self.map.get_mut(&self.key) {
            entry.refs -= 1;
        }
        self.map.remove_if(&self.key, |_, entry| entry.refs == 0);
    }
}

fn checkout<L>(
    map: &Arc<DashMap<String, Entry<L>>>,
    key: &str,
    init: impl FnOnce() -> L,
) -> (Arc<L>, RefLease<L>) {
    let lock = {
        let mut entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            lock: Arc::new(init()),
            refs: 0,
        });
        entry.refs += 1;
        entry.lock.clone()
    };
    let lease = RefLease {
        map: map.clone(),
        key: key.to_string(),
    };
    (lock, lease)
}

/// A map of per-key mutexes.
#[derive(Clone, Default)]
pub struct KeyedMutexes {
    map: Arc<DashMap<String, Entry<Mutex<()>>>>,
}

impl KeyedMutexes {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the given key, creating its mutex on first use.
    pub async fn acquire(&self, key: &str) -> KeyedMutexGuard {
        let (lock, lease) = checkout(&self.map, key, || Mutex::new(()));
        let guard = lock.lock_owned().await;
        KeyedMutexGuard {
            _guard: guard,
            _lease: lease,
        }
    }

    /// Number of keys with live or awaited locks (test observability).
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no key is currently locked or awaited.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Exclusive hold on one key of a [`KeyedMutexes`].
///
/// Field order releases the lock before the lease returns the key.
pub struct KeyedMutexGuard {
    _guard: OwnedMutexGuard<()>,
    _lease: RefLease<Mutex<()>>,
}

/// A map of per-key reader/writer locks.
#[derive(Clone, Default)]
pub struct KeyedRwLocks {
    map: Arc<DashMap<String, Entry<RwLock<()>>>>,
}

impl KeyedRwLocks {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a shared hold on the given key.
    pub async fn read(&self, key: &str) -> KeyedReadGuard {
        let (lock, lease) = checkout(&self.map, key, || RwLock::new(()));
        let guard = lock.read_owned().await;
        KeyedReadGuard {
            _guard: guard,
            _lease: lease,
        }
    }

    /// Take an exclusive hold on the given key.
    pub async fn write(&self, key: &str) -> KeyedWriteGuard {
        let (lock, lease) = checkout(&self.map, key, || RwLock::new(()));
        let guard = lock.write_owned().await;
        KeyedWriteGuard {
            _guard: guard,
            _lease: lease,
        }
    }

    /// Number of keys with live or awaited locks (test observability).
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no key is currently locked or awaited.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Shared hold on one key of a [`KeyedRwLocks`].
///
/// Field order releases the lock before the lease returns the key.
pub struct KeyedReadGuard {
    _guard: OwnedRwLockReadGuard<()>,
    _lease: RefLease<RwLock<()>>,
}

/// Exclusive hold on one key of a [`KeyedRwLocks`].
///
/// Field order releases the lock before the lease returns the key.
pub struct KeyedWriteGuard {
    _guard: OwnedRwLockWriteGuard<()>,
    _lease: RefLease<RwLock<()>>,
}
