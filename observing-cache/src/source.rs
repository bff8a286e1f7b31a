//! Source Adapters
//!
//! A source is anything that can push values for a key over time. The cache
//! talks to it through a single capability: subscribe with a callback, get
//! back a way to unsubscribe.
//!
//! Closures with the right shape implement [`Source`] directly:
//!
//! ```rust
//! use observing_cache::{ObservingCache, OnValue, SourceError, Unsubscribe};
//!
//! let cache = ObservingCache::new(
//!     |key: &String, on_value: OnValue<String>| -> Result<Unsubscribe, SourceError> {
//!         on_value.deliver(format!("hello, {key}"));
//!         Ok(Unsubscribe::noop())
//!     },
//! );
//! # let _ = cache;
//! ```

use std::fmt;
use std::sync::Arc;

use crate::error::SourceError;

/// Callback a source invokes for each value it delivers.
///
/// It may be cloned freely and called from any thread, any number of times.
pub struct OnValue<V> {
    deliver: Arc<dyn Fn(V) + Send + Sync>,
}

impl<V> OnValue<V> {
    pub(crate) fn new<F>(deliver: F) -> Self
    where
        F: Fn(V) + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// Push a value to the cache.
    pub fn deliver(&self, value: V) {
        (self.deliver)(value)
    }
}

impl<V> Clone for OnValue<V> {
    fn clone(&self) -> Self {
        Self {
            deliver: Arc::clone(&self.deliver),
        }
    }
}

impl<V> fmt::Debug for OnValue<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnValue").finish_non_exhaustive()
    }
}

/// Teardown capability returned by [`Source::subscribe`].
///
/// Once it has run, the source must not invoke that subscription's
/// [`OnValue`] again.
#[must_use = "dropping an Unsubscribe without running it leaves the source subscription open"]
pub struct Unsubscribe {
    teardown: Box<dyn FnOnce() -> Result<(), SourceError> + Send>,
}

impl Unsubscribe {
    /// Wrap an infallible teardown.
    pub fn new<F>(teardown: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::fallible(move || {
            teardown();
            Ok(())
        })
    }

    /// Wrap a teardown that may fail.
    pub fn fallible<F>(teardown: F) -> Self
    where
        F: FnOnce() -> Result<(), SourceError> + Send + 'static,
    {
        Self {
            teardown: Box::new(teardown),
        }
    }

    /// A teardown with nothing to do, for sources that finish on their own.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Run the teardown.
    pub fn run(self) -> Result<(), SourceError> {
        (self.teardown)()
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe").finish_non_exhaustive()
    }
}

/// A push-based data source.
pub trait Source<K, V>: Send + Sync {
    /// Start delivering values for `key` to `on_value`.
    ///
    /// Values may be delivered synchronously before this returns, later from
    /// another task, or never.
    fn subscribe(&self, key: &K, on_value: OnValue<V>) -> Result<Unsubscribe, SourceError>;
}

impl<K, V, F> Source<K, V> for F
where
    F: Fn(&K, OnValue<V>) -> Result<Unsubscribe, SourceError> + Send + Sync,
{
    fn subscribe(&self, key: &K, on_value: OnValue<V>) -> Result<Unsubscribe, SourceError> {
        self(key, on_value)
    }
}
