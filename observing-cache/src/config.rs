//! Cache configuration.

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// How long a key's source subscription lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservingStrategy {
    /// Tear the subscription down right after the first value arrives.
    #[default]
    DisposeAfterFirst,

    /// Keep the subscription open until the cache is disposed.
    PersistObserving,
}

impl ObservingStrategy {
    /// Map the boolean form used by `use_observing_strategy`.
    pub fn from_persist(persist: bool) -> Self {
        if persist {
            Self::PersistObserving
        } else {
            Self::DisposeAfterFirst
        }
    }

    /// Whether subscriptions outlive their first delivery.
    pub fn persists(self) -> bool {
        self == Self::PersistObserving
    }
}

/// Options for constructing an [`ObservingCache`](crate::ObservingCache).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Initial strategy. Can be changed later with
    /// `use_observing_strategy`.
    pub strategy: ObservingStrategy,

    /// Subscribe as soon as an entry is created instead of on first read.
    pub eager_activation: bool,
}

impl CacheOptions {
    /// Parse options from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, CacheError> {
        Ok(serde_json::from_str(json)?)
    }
}
