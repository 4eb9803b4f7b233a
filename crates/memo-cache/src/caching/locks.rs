use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;
use tokio::sync::{AcquireError, Semaphore, SemaphorePermit};

use super::CacheKey;

/// A mutual-exclusion handle for one key, only alive while that key is being computed.
///
/// A closed lock is "disposed": every current and future acquire fails.
#[derive(Debug)]
pub(crate) struct KeyLock {
    semaphore: Semaphore,
}

impl KeyLock {
    fn new() -> Self {
        Self {
            semaphore: Semaphore::new(1),
        }
    }

    fn close(&self) {
        self.semaphore.close();
    }
}

/// The table of locks for keys that are currently being computed.
///
/// Once [closed](Self::close_all), the table hands out no more locks. The flag is only ever
/// changed under the table mutex, so no lock can be created after the table was drained.
///
/// Every clone of a lock handed out by this table is dropped while holding the table mutex (see
/// [`InFlight`]), so [`Arc::strong_count`] observed under the mutex is exactly the number of
/// callers interested in that lock, plus one for the table itself.
#[derive(Default)]
pub(crate) struct KeyLocks {
    locks: Mutex<FxHashMap<CacheKey, Arc<KeyLock>>>,
    closed: AtomicBool,
}

impl fmt::Debug for KeyLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLocks")
            .field("in_flight", &self.len())
            .finish()
    }
}

impl KeyLocks {
    fn table(&self) -> MutexGuard<'_, FxHashMap<CacheKey, Arc<KeyLock>>> {
        // The critical sections never panic halfway through a mutation.
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers interest in the lock for `key`, creating it if this is the first caller.
    ///
    /// Concurrent callers for the same key always share the same lock instance. Returns `None` if
    /// the table has been closed.
    pub fn get_or_insert(&self, key: CacheKey) -> Option<InFlight<'_>> {
        let lock = {
            let mut table = self.table();
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            let lock = table
                .entry(key.clone())
                .or_insert_with(|| {
                    tracing::trace!(%key, "Creating key lock");
                    Arc::new(KeyLock::new())
                });
            Arc::clone(lock)
        };

        Some(InFlight {
            locks: self,
            key,
            lock: Some(lock),
            completed: AtomicBool::new(false),
        })
    }

    /// Gives up one interest in `lock`.
    ///
    /// The lock is removed from the table only if it is still the very instance stored for `key`,
    /// and either a terminal entry was written by the caller, or nobody else is interested in it.
    fn release(&self, key: &CacheKey, lock: Arc<KeyLock>, completed: bool) {
        let mut table = self.table();
        if let Some(current) = table.get(key) {
            // `current`, `lock`, and nobody else.
            let unshared = Arc::strong_count(&lock) <= 2;
            if Arc::ptr_eq(current, &lock) && (completed || unshared) {
                table.remove(key);
                tracing::trace!(%key, completed, "Removed key lock");
            }
        }
        drop(lock);
    }

    /// Removes the lock for `key` if no caller is interested in it anymore.
    ///
    /// This is a safety net for locks that were left behind, the regular removal happens when the
    /// computation completes.
    pub fn remove_if_idle(&self, key: &CacheKey) -> bool {
        let mut table = self.table();
        match table.get(key) {
            Some(lock) if Arc::strong_count(lock) == 1 => {
                table.remove(key);
                true
            }
            _ => false,
        }
    }

    /// The number of keys currently being computed or waited for.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    /// Closes all locks and clears the table.
    ///
    /// Callers waiting on any of the locks observe an [`AcquireError`]. Returns `false` if the
    /// table was already closed.
    pub fn close_all(&self) -> bool {
        let locks: Vec<_> = {
            let mut table = self.table();
            if self.closed.swap(true, Ordering::AcqRel) {
                return false;
            }
            table.drain().collect()
        };
        for (key, lock) in &locks {
            tracing::trace!(%key, "Closing key lock");
            lock.close();
        }
        // The drained locks are not in the table anymore, so their counts no longer matter.
        drop(locks);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// One caller's interest in a [`KeyLock`].
///
/// Dropping it releases that interest, removing the lock from the table as described in
/// [`KeyLocks::release`]. This also happens when the owning future is dropped, or the factory
/// panics.
pub(crate) struct InFlight<'a> {
    locks: &'a KeyLocks,
    key: CacheKey,
    lock: Option<Arc<KeyLock>>,
    completed: AtomicBool,
}

impl InFlight<'_> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Waits for exclusive access to the key.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>, AcquireError> {
        match &self.lock {
            Some(lock) => lock.semaphore.acquire().await,
            None => unreachable!("the lock is only taken on drop"),
        }
    }

    /// Whether the lock was closed, making the release of its permit a no-op.
    pub fn is_disposed(&self) -> bool {
        self.lock
            .as_ref()
            .is_none_or(|lock| lock.semaphore.is_closed())
    }

    /// Marks that a terminal entry has been written for the key.
    pub fn complete(&self) {
        self.completed.store(true, Ordering::Release);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            let completed = self.completed.load(Ordering::Acquire);
            self.locks.release(&self.key, lock, completed);
        }
    }
}
