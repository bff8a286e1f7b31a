//! Observing Cache
//!
//! A keyed, deduplicating cache that sits between a consumer and a push-based
//! data source. It implements:
//!
//! - At most one live source subscription per key
//! - One shared [`DeferredEntry`] per key, combining a one-shot result for
//!   the first value with observable `busy`/`current` state
//! - Lazy subscription: the source is only subscribed when an entry is
//!   first read
//! - Two subscription lifetimes: tear down after the first value, or keep
//!   observing until the cache is disposed
//!
//! # Architecture
//!
//! - `reactive`: observable cells and the lazy activation guard
//! - `entry`: the per-key deferred entry
//! - `subscription`: per-key subscription bookkeeping
//! - `cache`: orchestration and the strategy switch
//! - `source`: the adapter interface sources implement
//!
//! # Example
//!
//! ```rust,ignore
//! use observing_cache::ObservingCache;
//!
//! let cache = ObservingCache::new(repository_source);
//! cache.use_observing_strategy(true)?;
//!
//! let user = cache.get(user_id)?;
//! let first = user.result().await?;
//! user.on_update(|latest| println!("user changed: {latest:?}"));
//!
//! cache.dispose()?;
//! ```

pub mod cache;
pub mod config;
pub mod entry;
pub mod error;
pub mod reactive;
pub mod source;
pub mod subscription;

pub use cache::ObservingCache;
pub use config::{CacheOptions, ObservingStrategy};
pub use entry::DeferredEntry;
pub use error::{CacheError, SourceError};
pub use source::{OnValue, Source, Unsubscribe};
pub use subscription::{Activated, SubscriptionManager};
