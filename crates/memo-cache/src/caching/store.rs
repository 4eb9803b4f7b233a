use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use moka::notification::RemovalCause;

use super::{CacheKey, CachePolicy};

/// The value stored under a key in a [`BackingStore`].
///
/// Entries are never edited in place, a new computation replaces the entry wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEntry<V, E> {
    /// A successfully computed value.
    ///
    /// "Empty" values such as `None`, `0` or `""` are regular values, they are present all the same.
    Value(V),
    /// The most recent computation for this key failed.
    Failure {
        /// The error the computation failed with, replayed to every reader.
        error: E,
        /// When the failing computation finished.
        computed_at: SystemTime,
    },
}

impl<V, E> CacheEntry<V, E> {
    /// Creates a failure entry timestamped with the current time.
    pub fn failure(error: E) -> Self {
        Self::Failure {
            error,
            computed_at: SystemTime::now(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    /// Turns this entry into the result a caller observes.
    pub fn into_result(self) -> Result<V, E> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Failure { error, .. } => Err(error),
        }
    }

    /// A short tag used for metrics and logging.
    pub(crate) fn status(&self) -> &'static str {
        match self {
            Self::Value(_) => "value",
            Self::Failure { .. } => "failure",
        }
    }
}

/// Invoked by the store when an entry is naturally evicted (expired or pushed out by capacity).
pub type EvictionCallback = Arc<dyn Fn(&CacheKey) + Send + Sync>;

/// Expiration parameters for a single write.
#[derive(Clone, Default)]
pub struct EntryOptions {
    /// Maximum time since the write.
    pub absolute_ttl: Option<Duration>,
    /// Maximum time since the last read.
    pub sliding_ttl: Option<Duration>,
    /// Called once the entry is evicted by the store itself.
    pub on_evict: Option<EvictionCallback>,
}

impl EntryOptions {
    /// Options honoring the given [`CachePolicy`].
    pub fn from_policy(policy: &CachePolicy) -> Self {
        Self {
            absolute_ttl: policy.absolute_ttl,
            sliding_ttl: policy.sliding_ttl,
            on_evict: None,
        }
    }

    pub fn with_eviction_callback(mut self, on_evict: EvictionCallback) -> Self {
        self.on_evict = Some(on_evict);
        self
    }

    /// The time an entry written at `written_at` may still live, as seen from `now`.
    fn time_to_live(&self, written_at: Instant, now: Instant) -> Option<Duration> {
        let remaining = self
            .absolute_ttl
            .map(|ttl| saturating_duration_since(now, written_at + ttl));
        match (remaining, self.sliding_ttl) {
            (Some(remaining), Some(sliding)) => Some(remaining.min(sliding)),
            (remaining, sliding) => remaining.or(sliding),
        }
    }
}

impl fmt::Debug for EntryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryOptions")
            .field("absolute_ttl", &self.absolute_ttl)
            .field("sliding_ttl", &self.sliding_ttl)
            .field("on_evict", &self.on_evict.is_some())
            .finish()
    }
}

/// Returns the duration between `current_time` and the `target_time` in the future, or zero if
/// the `target_time` has already passed.
fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Duration {
    target_time
        .checked_duration_since(current_time)
        .unwrap_or_default()
}

/// The key-value store a [`MemoCache`](super::MemoCache) keeps its entries in.
///
/// Implementations have to be internally synchronized, and are responsible for expiring entries
/// according to the [`EntryOptions`] they were written with.
pub trait BackingStore<V, E>: Send + Sync {
    /// Looks up the entry for `key` without any locking on the caller's side.
    fn get(&self, key: &CacheKey) -> Option<CacheEntry<V, E>>;

    /// Writes an entry, replacing whatever was stored under `key` before.
    fn insert(&self, key: CacheKey, entry: CacheEntry<V, E>, options: EntryOptions);

    /// Removes the entry for `key`, without invoking its eviction callback.
    fn invalidate(&self, key: &CacheKey);

    /// The (approximate) number of entries in the store.
    fn entry_count(&self) -> u64;

    /// Performs any pending housekeeping, such as running eviction callbacks.
    fn run_pending_tasks(&self) {}
}

/// An item saved in the moka cache.
#[derive(Clone)]
struct StoredItem<V, E> {
    entry: CacheEntry<V, E>,
    options: EntryOptions,
}

/// A [`moka::Expiry`] implementing absolute and sliding expiration per item.
struct EntryExpiry;

impl<V, E> moka::Expiry<CacheKey, StoredItem<V, E>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &StoredItem<V, E>,
        created_at: Instant,
    ) -> Option<Duration> {
        value.options.time_to_live(created_at, created_at)
    }

    fn expire_after_read(
        &self,
        _key: &CacheKey,
        value: &StoredItem<V, E>,
        read_at: Instant,
        duration_until_expiry: Option<Duration>,
        last_modified_at: Instant,
    ) -> Option<Duration> {
        if value.options.sliding_ttl.is_some() {
            value.options.time_to_live(last_modified_at, read_at)
        } else {
            duration_until_expiry
        }
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &StoredItem<V, E>,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.options.time_to_live(updated_at, updated_at)
    }
}

/// The default [`BackingStore`], an in-memory [`moka`] cache bounded by entry count.
pub struct MokaStore<V, E> {
    cache: moka::sync::Cache<CacheKey, StoredItem<V, E>>,
}

impl<V, E> MokaStore<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a store holding at most `capacity` entries.
    pub fn new(name: &str, capacity: u64) -> Self {
        let cache = moka::sync::Cache::builder()
            .name(name)
            .max_capacity(capacity)
            .expire_after(EntryExpiry)
            .eviction_listener(
                |key: Arc<CacheKey>, item: StoredItem<V, E>, cause: RemovalCause| {
                    // Replacements and explicit invalidations are not evictions.
                    if !cause.was_evicted() {
                        return;
                    }
                    tracing::trace!(%key, ?cause, "Evicted {} entry", item.entry.status());
                    if let Some(on_evict) = item.options.on_evict {
                        on_evict(&key);
                    }
                },
            )
            .build();

        Self { cache }
    }
}

impl<V, E> fmt::Debug for MokaStore<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MokaStore")
            .field("name", &self.cache.name())
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl<V, E> BackingStore<V, E> for MokaStore<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &CacheKey) -> Option<CacheEntry<V, E>> {
        self.cache.get(key).map(|item| item.entry)
    }

    fn insert(&self, key: CacheKey, entry: CacheEntry<V, E>, options: EntryOptions) {
        self.cache.insert(key, StoredItem { entry, options });
    }

    fn invalidate(&self, key: &CacheKey) {
        self.cache.invalidate(key);
    }

    fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks();
    }
}
