//! Helpers for testing the memo cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test, as the directory is deleted once it is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `memo_cache` crate and mutes all
///    other logs (such as moka).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("memo_cache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Counts how often a factory was invoked, shared between clones.
#[derive(Clone, Debug, Default)]
pub struct Invocations(Arc<AtomicUsize>);

impl Invocations {
    /// Records one invocation and returns the new total.
    pub fn record(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
