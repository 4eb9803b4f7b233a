//! # Memoization infrastructure
//!
//! The [`MemoCache`] sits in front of slow, async computations (remote lookups, database queries,
//! expensive transformations) and makes sure that each of them runs at most once per [`CacheKey`]
//! at any given time.
//!
//! ## Request Coalescing
//!
//! A lookup goes through the following steps:
//! - First, the [`BackingStore`] is consulted without taking any lock. A cached value is returned
//!   right away, a cached failure is re-raised.
//! - On miss, the caller registers with the per-key lock table and waits for the lock of its key.
//!   Concurrent callers for the same key share one lock, callers for distinct keys never block each
//!   other.
//! - Once the lock is held, the store is checked again. If another caller finished the computation
//!   in the meantime, its result is used.
//! - Otherwise, the factory runs and its result is written to the store.
//!
//! Locks only exist while a key is being computed. They are removed once a result was written, and
//! the removal is identity-checked: a caller only ever removes the exact lock instance it used, so
//! a late caller can never tear down the lock of a newer generation of computations.
//!
//! ## Failure Caching
//!
//! Failed computations are cached as well, for a fixed, short time
//! ([`MemoCacheBuilder::failure_ttl`], 5 seconds by default) that is independent of the
//! [`CachePolicy`] of the call. Every caller within that window observes the very same error,
//! instead of re-running a computation that is likely to fail again.
//!
//! Failures that happen after the caller's [`CancellationToken`](tokio_util::sync::CancellationToken)
//! was cancelled are not cached by default, as they usually say nothing about the computation
//! itself. See [`MemoCacheBuilder::cache_cancelled_failures`] and
//! [`MemoCacheBuilder::failure_filter`].
//!
//! ## Cancellation
//!
//! Callers can abandon the wait for a key lock at any time, which results in
//! [`MemoError::Cancelled`]. The factory receives a clone of the caller's token, and is free to
//! observe it. The cache never cancels a running factory on its own.
//!
//! ### Metrics
//!
//! Every metric is tagged with a `cache` field holding the name of the cache:
//!
//! - `memo.access`: All accesses.
//! - `memo.memory.hit`: Accesses served from the store without waiting, tagged with the `status`
//!   (`value` or `failure`) of the entry.
//! - `memo.lock.wait`: The time spent waiting for a key lock.
//! - `memo.coalesced`: Accesses served by a computation another caller ran while we were waiting.
//! - `memo.computation`: Actual computations being run.
//! - `memo.computation.duration`: How long those took.
//! - `memo.computation.failed`: Computations that returned an error.
//! - `memo.cancelled`: Callers that gave up waiting for a key lock.
//! - `memo.locks.in_flight`: A gauge of the keys currently being computed.
//! - `memo.lock.disposed`: Computations whose key lock was closed by a teardown while running.

mod cache_key;
mod locks;
mod memo;
mod memo_error;
mod policy;
mod store;

pub use cache_key::{CacheKey, CacheKeyBuilder};
pub use memo::{DEFAULT_CAPACITY, DEFAULT_FAILURE_TTL, MemoCache, MemoCacheBuilder};
pub use memo_error::MemoError;
pub use policy::CachePolicy;
pub use store::{BackingStore, CacheEntry, EntryOptions, EvictionCallback, MokaStore};
