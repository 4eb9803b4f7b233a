//! Async memoization with per-key request coalescing.
//!
//! The [`MemoCache`] returns previously computed results for a [`CacheKey`], or runs the supplied
//! factory exactly once per key while any number of concurrent callers wait for it. Failed
//! computations are cached for a short, fixed time so that a failing dependency is not hammered by
//! every waiting caller in turn.
//!
//! See the [`caching`] module for the details.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;

pub use caching::{
    BackingStore, CacheEntry, CacheKey, CacheKeyBuilder, CachePolicy, EntryOptions,
    EvictionCallback, MemoCache, MemoCacheBuilder, MemoError, MokaStore,
};
pub use tokio_util::sync::CancellationToken;
