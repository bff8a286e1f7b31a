//! Signal Implementation
//!
//! A Signal is the observable cell backing every piece of entry state. It
//! holds a value and a list of listeners that are told about every write.
//!
//! # How Signals Work
//!
//! 1. `get` returns a clone of the current value.
//!
//! 2. `set` replaces the value and then calls every listener with the new
//!    value, in registration order.
//!
//! 3. Listeners are removed with the `ListenerId` handed out at registration.
//!
//! # Thread Safety
//!
//! The value and the listener list sit behind separate locks. Listeners are
//! cloned out of their lock before being called, so a listener may read the
//! signal, write other signals, or unregister itself without deadlocking.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Counter for generating unique signal IDs.
static SIGNAL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a new unique signal ID.
fn next_signal_id() -> u64 {
    SIGNAL_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Identifier of a listener registered on a [`Signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// An observable cell holding a value of type T.
///
/// Cloning a signal yields another handle to the same cell.
///
/// # Example
///
/// ```rust
/// use observing_cache::reactive::Signal;
///
/// let count = Signal::new(0);
/// count.subscribe(|v| println!("count is now {v}"));
/// count.set(5);
/// assert_eq!(count.get(), 5);
/// ```
pub struct Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Unique identifier for this signal.
    id: u64,

    /// The current value.
    value: Arc<RwLock<T>>,

    /// Listeners notified after each write.
    listeners: Arc<RwLock<Vec<(ListenerId, Listener<T>)>>>,
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new signal with the given initial value.
    pub fn new(value: T) -> Self {
        Self {
            id: next_signal_id(),
            value: Arc::new(RwLock::new(value)),
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Get the signal's unique ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get a clone of the current value.
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Set a new value and notify listeners.
    pub fn set(&self, value: T) {
        let snapshot = {
            let mut guard = self.value.write();
            *guard = value;
            guard.clone()
        };

        self.notify_listeners(&snapshot);
    }

    /// Register a listener invoked with the new value after every write.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, listener_id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != listener_id);
        listeners.len() != before
    }

    fn notify_listeners(&self, value: &T) {
        let listeners: Vec<Listener<T>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(value);
        }
    }

    /// Get the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl<T> Clone for Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            value: Arc::clone(&self.value),
            listeners: Arc::clone(&self.listeners),
        }
    }
}

impl<T> Debug for Signal<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.id)
            .field("value", &*self.value.read())
            .field("listener_count", &self.listener_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
