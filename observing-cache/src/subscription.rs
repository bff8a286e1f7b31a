//! Subscription Manager
//!
//! Tracks, per key, whether a source subscription is live and how to tear it
//! down. It is the single place that decides whether `Source::subscribe` may
//! be called for a key.
//!
//! # States
//!
//! ```text
//! (missing) --activate--> Subscribing --subscribe returns--> Active
//!                              |                               |
//!                      deactivate (deferred)               deactivate
//!                              v                               v
//!                   subscribe returns, teardown runs ----> Inactive
//! ```
//!
//! The record lock is never held while calling into the source, so a source
//! may deliver synchronously from inside `subscribe`, and that delivery may
//! ask for a teardown before the `Unsubscribe` handle even exists. Such a
//! teardown is recorded and executed as soon as `subscribe` returns.
//!
//! Once [`SubscriptionManager::deactivate_all`] has run the manager is closed
//! and refuses new subscriptions, so a dispose racing a first read cannot
//! leave a subscription behind.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use parking_lot::Mutex;

use crate::error::{CacheError, SourceError};
use crate::source::Unsubscribe;

/// Lifecycle of one key's subscription.
enum SubscriptionState {
    /// `Source::subscribe` is running.
    Subscribing { teardown_requested: bool },

    /// Subscribed; holds the teardown capability.
    Active(Unsubscribe),

    /// Torn down.
    Inactive,
}

impl SubscriptionState {
    fn is_live(&self) -> bool {
        match self {
            Self::Subscribing { teardown_requested } => !teardown_requested,
            Self::Active(_) => true,
            Self::Inactive => false,
        }
    }

    fn is_open(&self) -> bool {
        !matches!(self, Self::Inactive)
    }
}

/// Result of [`SubscriptionManager::activate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activated {
    /// The source was subscribed and the subscription is live.
    Subscribed,

    /// The source was subscribed, but a teardown was requested while
    /// subscribing, so it has already been torn down again.
    TornDown,

    /// A subscription for the key already existed; nothing was called.
    AlreadyActive,
}

/// Per-key subscription bookkeeping.
pub struct SubscriptionManager<K> {
    records: Mutex<Records<K>>,
}

struct Records<K> {
    states: HashMap<K, SubscriptionState>,
    closed: bool,
}

impl<K> SubscriptionManager<K>
where
    K: Eq + Hash + Clone + Debug,
{
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Records {
                states: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Subscribe `key` by running `subscribe`, unless a subscription for it
    /// is already subscribing or active.
    ///
    /// Fails with [`CacheError::Disposed`] once the manager is closed.
    pub fn activate<F>(&self, key: &K, subscribe: F) -> Result<Activated, CacheError>
    where
        F: FnOnce() -> Result<Unsubscribe, SourceError>,
    {
        {
            let mut records = self.records.lock();
            if records.closed {
                return Err(CacheError::Disposed);
            }
            if records.states.get(key).is_some_and(SubscriptionState::is_open) {
                tracing::trace!(?key, "subscription already open");
                return Ok(Activated::AlreadyActive);
            }
            records.states.insert(
                key.clone(),
                SubscriptionState::Subscribing {
                    teardown_requested: false,
                },
            );
        }

        tracing::debug!(?key, "subscribing to source");
        let outcome = subscribe();

        let mut records = self.records.lock();
        let unsubscribe = match outcome {
            Ok(unsubscribe) => unsubscribe,
            Err(source) => {
                records.states.remove(key);
                return Err(CacheError::subscribe(key, source));
            }
        };

        // A missing record means the manager was cleared while subscribing.
        let teardown_now = records.closed
            || match records.states.get(key) {
                Some(SubscriptionState::Subscribing { teardown_requested }) => *teardown_requested,
                _ => true,
            };

        if !teardown_now {
            records
                .states
                .insert(key.clone(), SubscriptionState::Active(unsubscribe));
            return Ok(Activated::Subscribed);
        }

        if let Some(state) = records.states.get_mut(key) {
            *state = SubscriptionState::Inactive;
        }
        drop(records);

        tracing::debug!(?key, "tearing down subscription requested during subscribe");
        unsubscribe
            .run()
            .map_err(|source| CacheError::unsubscribe(key, source))?;
        Ok(Activated::TornDown)
    }

    /// Tear down `key`'s subscription.
    ///
    /// Returns `true` if a teardown ran. If the key is still subscribing, the
    /// teardown is deferred until `subscribe` returns and `false` is
    /// returned. A failing teardown still leaves the record inactive.
    pub fn deactivate(&self, key: &K) -> Result<bool, CacheError> {
        let unsubscribe = {
            let mut records = self.records.lock();
            let Some(state) = records.states.get_mut(key) else {
                return Ok(false);
            };

            match std::mem::replace(state, SubscriptionState::Inactive) {
                SubscriptionState::Active(unsubscribe) => unsubscribe,
                SubscriptionState::Subscribing { .. } => {
                    *state = SubscriptionState::Subscribing {
                        teardown_requested: true,
                    };
                    return Ok(false);
                }
                SubscriptionState::Inactive => return Ok(false),
            }
        };

        tracing::debug!(?key, "tearing down subscription");
        unsubscribe
            .run()
            .map_err(|source| CacheError::unsubscribe(key, source))?;
        Ok(true)
    }

    /// Tear down every live subscription exactly once and close the manager.
    ///
    /// Teardown failures do not stop the sweep; they are returned together.
    /// Keys still subscribing are torn down when their `subscribe` returns.
    pub fn deactivate_all(&self) -> Vec<CacheError> {
        let pending: Vec<(K, Unsubscribe)> = {
            let mut records = self.records.lock();
            records.closed = true;
            let mut pending = Vec::new();
            for (key, state) in records.states.iter_mut() {
                match std::mem::replace(state, SubscriptionState::Inactive) {
                    SubscriptionState::Active(unsubscribe) => {
                        pending.push((key.clone(), unsubscribe));
                    }
                    SubscriptionState::Subscribing { .. } => {
                        *state = SubscriptionState::Subscribing {
                            teardown_requested: true,
                        };
                    }
                    SubscriptionState::Inactive => {}
                }
            }
            pending
        };

        tracing::debug!(count = pending.len(), "tearing down all subscriptions");
        pending
            .into_iter()
            .filter_map(|(key, unsubscribe)| {
                unsubscribe
                    .run()
                    .err()
                    .map(|source| CacheError::unsubscribe(&key, source))
            })
            .collect()
    }

    /// Forget all records and close the manager. Keys still subscribing are
    /// torn down when their `subscribe` call returns.
    pub fn clear(&self) {
        let mut records = self.records.lock();
        records.closed = true;
        records.states.clear();
    }

    /// Whether the manager refuses new subscriptions.
    pub fn is_closed(&self) -> bool {
        self.records.lock().closed
    }

    /// Whether deliveries for `key` should still be accepted.
    pub fn is_live(&self, key: &K) -> bool {
        self.records
            .lock()
            .states
            .get(key)
            .is_some_and(SubscriptionState::is_live)
    }

    /// Number of live subscriptions.
    pub fn live_count(&self) -> usize {
        self.records
            .lock()
            .states
            .values()
            .filter(|state| state.is_live())
            .count()
    }
}

impl<K> Default for SubscriptionManager<K>
where
    K: Eq + Hash + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Debug for SubscriptionManager<K>
where
    K: Eq + Hash + Clone + Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("live_count", &self.live_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
