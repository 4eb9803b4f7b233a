use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use sentry::{Hub, SentryFutureExt};
use tokio_util::sync::CancellationToken;

use super::locks::KeyLocks;
use super::{
    BackingStore, CacheEntry, CacheKey, CachePolicy, EntryOptions, EvictionCallback, MemoError,
    MokaStore,
};
use crate::config::MemoConfig;

/// The default time a failed computation is replayed to callers before it is retried.
pub const DEFAULT_FAILURE_TTL: Duration = Duration::from_secs(5);

/// The default capacity (in entries) of the [`MokaStore`] created by the builder.
pub const DEFAULT_CAPACITY: u64 = 100 * 1024;

type FailureFilter<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

struct Inner<V, E> {
    name: Arc<str>,
    store: Arc<dyn BackingStore<V, E>>,
    locks: Arc<KeyLocks>,
    failure_ttl: Duration,
    failure_filter: Option<FailureFilter<E>>,
    cache_cancelled_failures: bool,
}

impl<V, E> Drop for Inner<V, E> {
    fn drop(&mut self) {
        self.locks.close_all();
    }
}

/// Memoizes async computations per [`CacheKey`].
///
/// For every key, at most one factory runs at any time: concurrent callers missing the cache wait
/// for the per-key lock and then observe the result of the caller that won it. Values are kept
/// according to the [`CachePolicy`] of the call that computed them, failures are kept for the
/// fixed [`failure_ttl`](Self::failure_ttl).
///
/// Cloning is cheap, all clones share the same entries and locks.
pub struct MemoCache<V, E> {
    inner: Arc<Inner<V, E>>,
}

impl<V, E> Clone for MemoCache<V, E> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, E> fmt::Debug for MemoCache<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoCache")
            .field("name", &self.inner.name)
            .field("entries", &self.inner.store.entry_count())
            .field("in_flight", &self.inner.locks.len())
            .field("failure_ttl", &self.inner.failure_ttl)
            .field("closed", &self.inner.locks.is_closed())
            .finish()
    }
}

impl<V, E> MemoCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a cache with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> MemoCacheBuilder<V, E> {
        MemoCacheBuilder::default()
    }

    /// Creates a cache as configured in the `memo` section of the config file.
    pub fn from_config(config: &MemoConfig) -> Self {
        Self::builder()
            .name(&config.name)
            .capacity(config.capacity)
            .failure_ttl(config.failure_ttl)
            .cache_cancelled_failures(config.cache_cancelled_failures)
            .build()
    }

    /// Creates a cache on top of a custom [`BackingStore`].
    pub fn with_store(store: impl BackingStore<V, E> + 'static) -> Self {
        Self::builder().store(store).build()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// How long failed computations are replayed before the factory is invoked again.
    pub fn failure_ttl(&self) -> Duration {
        self.inner.failure_ttl
    }

    /// Returns the cached result for `key`, or computes it with `factory`.
    ///
    /// 1. A cached value is returned (and a cached failure re-raised) right away, without taking
    ///    any lock.
    /// 2. Otherwise, the caller waits for the lock of `key`. The wait can be aborted via `cancel`,
    ///    which results in [`MemoError::Cancelled`].
    /// 3. Once the lock is held, the cache is checked again, as another caller may have just
    ///    finished the computation.
    /// 4. If still missing, `factory` is invoked with a clone of `cancel`. A value is stored
    ///    according to `policy`, a failure for [`failure_ttl`](Self::failure_ttl).
    ///
    /// # Errors
    ///
    /// - [`MemoError::InvalidArgument`] for an empty key origin or a zero TTL in `policy`.
    /// - [`MemoError::Factory`] with the error the most recent factory invocation for this key
    ///   failed with, whether that was this caller's or a cached one.
    /// - [`MemoError::Cancelled`] if `cancel` fired before the factory was started.
    /// - [`MemoError::Disposed`] if the cache was [closed](Self::close) before the factory was
    ///   started.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: CacheKey,
        policy: &CachePolicy,
        cancel: &CancellationToken,
        factory: F,
    ) -> Result<V, MemoError<E>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let inner = &*self.inner;
        let name = &*inner.name;

        if key.origin().is_empty() {
            return Err(MemoError::InvalidArgument("the key origin must not be empty"));
        }
        policy.validate().map_err(MemoError::InvalidArgument)?;

        metric!(counter("memo.access") += 1, "cache" => name);

        if let Some(entry) = inner.store.get(&key) {
            metric!(counter("memo.memory.hit") += 1, "cache" => name, "status" => entry.status());
            return entry.into_result().map_err(MemoError::Factory);
        }

        let Some(in_flight) = inner.locks.get_or_insert(key) else {
            return Err(MemoError::Disposed);
        };
        let key = in_flight.key();
        metric!(gauge("memo.locks.in_flight") = inner.locks.len() as u64, "cache" => name);

        let wait_start = Instant::now();
        let _permit = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!(%key, "Cancelled while waiting for key lock");
                metric!(counter("memo.cancelled") += 1, "cache" => name);
                return Err(MemoError::Cancelled);
            }
            permit = in_flight.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::debug!(%key, "Key lock was closed while waiting");
                    return Err(MemoError::Disposed);
                }
            },
        };
        metric!(timer("memo.lock.wait") = wait_start.elapsed(), "cache" => name);

        if let Some(entry) = inner.store.get(key) {
            // Somebody else computed this while we were waiting for the lock.
            metric!(counter("memo.coalesced") += 1, "cache" => name, "status" => entry.status());
            return entry.into_result().map_err(MemoError::Factory);
        }

        metric!(counter("memo.computation") += 1, "cache" => name);
        tracing::debug!(%key, "Computing memoized value");

        let compute_start = Instant::now();
        // Computations run with a fresh hub, so they can not mess up the scopes of the caller.
        let result = factory(cancel.clone())
            .bind_hub(Hub::new_from_top(Hub::current()))
            .await;
        metric!(timer("memo.computation.duration") = compute_start.elapsed(), "cache" => name);

        if in_flight.is_disposed() {
            // The result is still written and returned, only the lock release does nothing.
            tracing::warn!(%key, cache = name, "Key lock was disposed during the computation");
            metric!(counter("memo.lock.disposed") += 1, "cache" => name);
        }

        match result {
            Ok(value) => {
                let options = self.entry_options(policy);
                inner
                    .store
                    .insert(key.clone(), CacheEntry::Value(value.clone()), options);
                in_flight.complete();
                Ok(value)
            }
            Err(error) => {
                metric!(counter("memo.computation.failed") += 1, "cache" => name);
                if self.should_cache_failure(&error, cancel) {
                    let options = self.failure_options();
                    inner
                        .store
                        .insert(key.clone(), CacheEntry::failure(error.clone()), options);
                    in_flight.complete();
                } else {
                    tracing::debug!(%key, "Not caching failed computation");
                }
                Err(MemoError::Factory(error))
            }
        }
    }

    /// Returns the cached result for `key`, if there is one.
    pub fn get(&self, key: &CacheKey) -> Option<Result<V, E>> {
        self.inner.store.get(key).map(CacheEntry::into_result)
    }

    /// Removes the cached result for `key`, so that the next call computes it again.
    pub fn invalidate(&self, key: &CacheKey) {
        self.inner.store.invalidate(key);
    }

    /// The (approximate) number of cached results.
    pub fn entry_count(&self) -> u64 {
        self.inner.store.run_pending_tasks();
        self.inner.store.entry_count()
    }

    /// The number of keys that are currently being computed or waited for.
    pub fn in_flight(&self) -> usize {
        self.inner.locks.len()
    }

    /// Tears down the cache.
    ///
    /// All key locks are closed, so callers currently waiting for one fail with
    /// [`MemoError::Disposed`]. Callers that are already running their factory finish normally.
    /// Cached results can still be read, but no new computations are started.
    pub fn close(&self) {
        if self.inner.locks.close_all() {
            tracing::debug!(cache = %self.inner.name, "Closing memo cache");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.locks.is_closed()
    }

    fn should_cache_failure(&self, error: &E, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() && !self.inner.cache_cancelled_failures {
            return false;
        }
        self.inner
            .failure_filter
            .as_ref()
            .is_none_or(|filter| filter(error))
    }

    fn entry_options(&self, policy: &CachePolicy) -> EntryOptions {
        EntryOptions::from_policy(policy).with_eviction_callback(self.eviction_callback())
    }

    fn failure_options(&self) -> EntryOptions {
        EntryOptions::from_policy(&CachePolicy::absolute(self.inner.failure_ttl))
            .with_eviction_callback(self.eviction_callback())
    }

    /// Cleans up a lock that might have been left behind for an evicted key.
    fn eviction_callback(&self) -> EvictionCallback {
        let locks: Weak<KeyLocks> = Arc::downgrade(&self.inner.locks);
        Arc::new(move |key: &CacheKey| {
            if let Some(locks) = locks.upgrade() {
                if locks.remove_if_idle(key) {
                    tracing::warn!(%key, "Removed stray key lock on eviction");
                }
            }
        })
    }
}

impl<V, E> Default for MemoCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Configures and creates a [`MemoCache`].
pub struct MemoCacheBuilder<V, E> {
    name: String,
    capacity: u64,
    failure_ttl: Duration,
    failure_filter: Option<FailureFilter<E>>,
    cache_cancelled_failures: bool,
    store: Option<Arc<dyn BackingStore<V, E>>>,
}

impl<V, E> Default for MemoCacheBuilder<V, E> {
    fn default() -> Self {
        Self {
            name: "memo".into(),
            capacity: DEFAULT_CAPACITY,
            failure_ttl: DEFAULT_FAILURE_TTL,
            failure_filter: None,
            cache_cancelled_failures: false,
            store: None,
        }
    }
}

impl<V, E> MemoCacheBuilder<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// The name used to tag metrics and logs.
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.into();
        self
    }

    /// The maximum number of entries in the default [`MokaStore`].
    ///
    /// Has no effect if a custom [`store`](Self::store) is used.
    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// How long failures are cached.
    ///
    /// This is deliberately independent of any [`CachePolicy`], so that a failing dependency is
    /// retried soon, but not by every single caller.
    pub fn failure_ttl(mut self, failure_ttl: Duration) -> Self {
        self.failure_ttl = failure_ttl;
        self
    }

    /// Decides which errors are cached. By default, all of them are.
    ///
    /// Errors for which `filter` returns `false` are returned to the caller that ran the factory,
    /// and the next waiting caller will invoke the factory again.
    pub fn failure_filter(mut self, filter: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.failure_filter = Some(Arc::new(filter));
        self
    }

    /// Whether failures are cached even if the caller's cancellation token was cancelled by the
    /// time the factory returned. Defaults to `false`.
    pub fn cache_cancelled_failures(mut self, cache_cancelled_failures: bool) -> Self {
        self.cache_cancelled_failures = cache_cancelled_failures;
        self
    }

    /// Uses a custom [`BackingStore`] instead of a [`MokaStore`].
    pub fn store(mut self, store: impl BackingStore<V, E> + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn build(self) -> MemoCache<V, E> {
        // A zero TTL would make failures invisible right away, and defeat the herd protection.
        let failure_ttl = self.failure_ttl.max(Duration::from_millis(1));
        tracing::debug!(
            cache = %self.name,
            failure_ttl = %humantime::format_duration(failure_ttl),
            "Creating memo cache"
        );

        let store: Arc<dyn BackingStore<V, E>> = match self.store {
            Some(store) => store,
            None => Arc::new(MokaStore::new(&self.name, self.capacity)),
        };

        MemoCache {
            inner: Arc::new(Inner {
                name: self.name.into(),
                store,
                locks: Default::default(),
                failure_ttl,
                failure_filter: self.failure_filter,
                cache_cancelled_failures: self.cache_cancelled_failures,
            }),
        }
    }
}
