//! Error types for the observing cache.

use thiserror::Error;

/// Error returned by a source adapter's subscribe or unsubscribe capability.
pub type SourceError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by [`ObservingCache`](crate::ObservingCache) and
/// [`DeferredEntry`](crate::DeferredEntry).
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache was disposed.
    ///
    /// Returned by every cache operation after `dispose`, and by awaiting
    /// the result of an entry that was abandoned before its first value.
    #[error("observing cache has been disposed")]
    Disposed,

    /// The source adapter failed to subscribe.
    ///
    /// The entry stays armed; the next read retries the subscription.
    #[error("failed to subscribe to source for key {key}")]
    Subscribe {
        key: String,
        #[source]
        source: SourceError,
    },

    /// The source adapter's teardown failed. The subscription is considered
    /// inactive regardless.
    #[error("failed to unsubscribe from source for key {key}")]
    Unsubscribe {
        key: String,
        #[source]
        source: SourceError,
    },

    /// Invalid cache options.
    #[error("invalid cache options: {0}")]
    Config(#[from] serde_json::Error),
}

impl CacheError {
    pub(crate) fn subscribe(key: &impl std::fmt::Debug, source: SourceError) -> Self {
        Self::Subscribe {
            key: format!("{key:?}"),
            source,
        }
    }

    pub(crate) fn unsubscribe(key: &impl std::fmt::Debug, source: SourceError) -> Self {
        Self::Unsubscribe {
            key: format!("{key:?}"),
            source,
        }
    }
}
