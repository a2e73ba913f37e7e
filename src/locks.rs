//! Per-file lock registry
//!
//! Conflicting operations on the same `(user, filename)` pair must be
//! serialised without serialising the server as a whole. The registry hands
//! out reference-counted exclusive locks keyed by `"user/filename"`,
//! created on demand and reclaimed once the last holder releases.
//!
//! Lock order is registry mutex → entry mutex on acquire and entry mutex →
//! registry mutex on release; a thread never holds two entry locks at once,
//! so there are no circular waits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

/// Default number of simultaneously contended files the registry admits.
pub const MAX_FILE_LOCKS: usize = 1024;

/// The registry is at capacity; the caller should retry later.
///
/// Capacity bounds the number of *distinct files under active contention*,
/// not the number of files the system knows about.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("file lock registry full")]
pub struct RegistryFull;

struct LockEntry {
    mutex: Mutex<()>,
    // Mutated only under the registry mutex.
    refs: AtomicUsize,
}

/// Registration on a file's lock entry.
///
/// Obtained from [`FileLockRegistry::acquire`]; call [`FileLock::lock`] to
/// take the exclusive section. Dropping the handle deregisters (the entry is
/// reclaimed when its reference count reaches zero).
pub struct FileLock<'a> {
    registry: &'a FileLockRegistry,
    key: String,
    entry: Arc<LockEntry>,
}

impl std::fmt::Debug for FileLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock").field("key", &self.key).finish()
    }
}

impl FileLock<'_> {
    /// Block until this thread holds the file exclusively. The returned
    /// guard must be dropped before the handle itself.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.entry.mutex.lock()
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.key, &self.entry);
    }
}

/// Table of on-demand, reference-counted file locks.
pub struct FileLockRegistry {
    capacity: usize,
    table: Mutex<HashMap<String, Arc<LockEntry>>>,
}

impl FileLockRegistry {
    /// Create a registry bounding contention to `capacity` distinct files.
    pub fn new(capacity: usize) -> Self {
        FileLockRegistry {
            capacity,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Register interest in `(user, filename)`, creating the entry if this
    /// is the first holder. Fails with [`RegistryFull`] when the table is at
    /// capacity and the key is not yet present.
    pub fn acquire(&self, user: &str, filename: &str) -> Result<FileLock<'_>, RegistryFull> {
        let key = format!("{}/{}", user, filename);
        let mut table = self.table.lock();
        let entry = match table.get(&key) {
            Some(entry) => {
                entry.refs.fetch_add(1, Ordering::Relaxed);
                Arc::clone(entry)
            }
            None => {
                if table.len() >= self.capacity {
                    return Err(RegistryFull);
                }
                let entry = Arc::new(LockEntry {
                    mutex: Mutex::new(()),
                    refs: AtomicUsize::new(1),
                });
                table.insert(key.clone(), Arc::clone(&entry));
                entry
            }
        };
        drop(table);
        debug!("file lock registered for '{}'", key);
        Ok(FileLock {
            registry: self,
            key,
            entry,
        })
    }

    fn release(&self, key: &str, entry: &Arc<LockEntry>) {
        let mut table = self.table.lock();
        let remaining = entry.refs.fetch_sub(1, Ordering::Relaxed) - 1;
        if remaining == 0 {
            table.remove(key);
            debug!("file lock for '{}' reclaimed", key);
        }
    }

    /// Number of distinct files currently registered.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// True when no file is currently registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn entry_reclaimed_at_zero_refs() {
        let registry = FileLockRegistry::new(4);
        {
            let lock = registry.acquire("alice", "a.txt").unwrap();
            let _guard = lock.lock();
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn same_key_shares_one_entry() {
        let registry = FileLockRegistry::new(1);
        let first = registry.acquire("alice", "a.txt").unwrap();
        // Table is at capacity but the key already exists.
        let second = registry.acquire("alice", "a.txt").unwrap();
        drop(first);
        drop(second);
        assert!(registry.is_empty());
    }

    #[test]
    fn full_registry_is_retryable() {
        let registry = FileLockRegistry::new(1);
        let held = registry.acquire("alice", "a.txt").unwrap();
        assert_eq!(
            registry.acquire("alice", "b.txt").unwrap_err(),
            RegistryFull
        );
        drop(held);
        assert!(registry.acquire("alice", "b.txt").is_ok());
    }

    #[test]
    fn distinct_files_do_not_block_each_other() {
        let registry = FileLockRegistry::new(8);
        let a = registry.acquire("alice", "a.txt").unwrap();
        let b = registry.acquire("alice", "b.txt").unwrap();
        let _ga = a.lock();
        // Must not deadlock: different entry mutex.
        let _gb = b.lock();
    }

    #[test]
    fn same_file_is_mutually_exclusive() {
        let registry = Arc::new(FileLockRegistry::new(8));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for t in 0..4u32 {
            let registry = Arc::clone(&registry);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                let lock = registry.acquire("bob", "shared.bin").unwrap();
                let _guard = lock.lock();
                order.lock().push((t, "enter"));
                thread::sleep(Duration::from_millis(10));
                order.lock().push((t, "exit"));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // Critical sections never interleave: every enter is followed by the
        // same thread's exit.
        let order = order.lock();
        for pair in order.chunks(2) {
            assert_eq!(pair[0].0, pair[1].0);
            assert_eq!(pair[0].1, "enter");
            assert_eq!(pair[1].1, "exit");
        }
        assert!(registry.is_empty());
    }
}
