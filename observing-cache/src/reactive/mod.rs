//! Reactive Primitives
//!
//! This module implements the observable state that deferred entries are
//! built from.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. Writes notify every registered
//! listener with the new value, which is how consumers follow an entry's
//! `current` value while a subscription stays live.
//!
//! ## Activation
//!
//! An Activation is a one-time hook shared by a group of signals. The first
//! read through the group runs the hook before the read returns. The cache
//! uses it to defer subscribing to a source until somebody actually looks at
//! the entry.

mod activation;
mod signal;

pub use activation::{Activation, ActivationState};
pub use signal::{ListenerId, Signal};
