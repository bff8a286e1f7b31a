//! Deferred Entries
//!
//! A `DeferredEntry` is the per-key handle the cache hands out. It bundles:
//!
//! - `busy`: `None` until the entry is activated, `Some(true)` while waiting
//!   for the first value, `Some(false)` afterwards.
//! - `current`: the last value the source delivered.
//! - a one-shot result that resolves with the first delivered value.
//!
//! Reading `busy` or `current` through the tracked accessors activates the
//! entry, which is what subscribes the source. Activation happens inside the
//! read, so the first tracked read already sees `Some(true)` (or the value,
//! if the source delivered synchronously).
//!
//! Handles are cheap clones of one shared state; consumers can only read.

use std::fmt::Debug;
use std::sync::Arc;

use futures_util::future::{FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::CacheError;
use crate::reactive::{Activation, ListenerId, Signal};

/// Per-key view of a cached, observed value.
pub struct DeferredEntry<K, V>
where
    V: Clone + Send + Sync + 'static,
{
    inner: Arc<EntryInner<K, V>>,
}

struct EntryInner<K, V>
where
    V: Clone + Send + Sync + 'static,
{
    key: K,
    busy: Signal<Option<bool>>,
    current: Signal<Option<V>>,
    activation: Activation<CacheError>,
    resolution: Mutex<Resolution<V>>,
    result: Shared<oneshot::Receiver<V>>,
}

/// Whether the one-shot result has been settled.
enum Resolution<V> {
    Pending(oneshot::Sender<V>),
    Resolved(V),
    /// Released by dispose before a value arrived.
    Abandoned,
}

impl<K, V> DeferredEntry<K, V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create an entry whose first tracked access runs `activate`.
    pub(crate) fn new<F>(key: K, activate: F) -> Self
    where
        F: Fn() -> Result<(), CacheError> + Send + Sync + 'static,
    {
        let (resolver, result) = oneshot::channel();
        Self {
            inner: Arc::new(EntryInner {
                key,
                busy: Signal::new(None),
                current: Signal::new(None),
                activation: Activation::new(activate),
                resolution: Mutex::new(Resolution::Pending(resolver)),
                result: result.shared(),
            }),
        }
    }

    /// The key this entry caches.
    pub fn key(&self) -> &K {
        &self.inner.key
    }

    /// Subscribe the source if this entry has not been activated yet.
    ///
    /// Tracked reads and [`result`](Self::result) call this implicitly. A
    /// failed subscription is returned here and retried on the next access.
    pub fn activate(&self) -> Result<(), CacheError> {
        self.inner.activation.trigger()
    }

    /// Whether activation has started.
    pub fn is_activated(&self) -> bool {
        self.inner.activation.is_triggered()
    }

    /// Read `busy`, activating the entry first.
    pub fn busy(&self) -> Result<Option<bool>, CacheError> {
        self.activate()?;
        Ok(self.inner.busy.get())
    }

    /// Read `current`, activating the entry first.
    pub fn current(&self) -> Result<Option<V>, CacheError> {
        self.activate()?;
        Ok(self.inner.current.get())
    }

    /// Read `busy` without activating.
    pub fn peek_busy(&self) -> Option<bool> {
        self.inner.busy.get()
    }

    /// Read `current` without activating.
    pub fn peek_current(&self) -> Option<V> {
        self.inner.current.get()
    }

    /// Wait for the first delivered value, activating the entry first.
    ///
    /// Every handle and every call sees the same value. If another thread is
    /// activating the entry, this waits for it, and retries the subscription
    /// if that attempt failed. Fails with [`CacheError::Disposed`] if the
    /// cache was disposed before a value arrived.
    pub async fn result(&self) -> Result<V, CacheError> {
        self.activate()?;
        self.inner
            .result
            .clone()
            .await
            .map_err(|_| CacheError::Disposed)
    }

    /// The first delivered value, if it has arrived.
    pub fn try_result(&self) -> Option<V> {
        match &*self.inner.resolution.lock() {
            Resolution::Resolved(value) => Some(value.clone()),
            Resolution::Pending(_) | Resolution::Abandoned => None,
        }
    }

    /// Whether the first value has arrived.
    pub fn is_resolved(&self) -> bool {
        self.try_result().is_some()
    }

    /// Call `listener` with every value delivered from now on.
    pub fn on_update<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&V) + Send + Sync + 'static,
    {
        self.inner.current.subscribe(move |value| {
            if let Some(value) = value {
                listener(value);
            }
        })
    }

    /// Remove a listener added with [`on_update`](Self::on_update).
    pub fn remove_listener(&self, listener_id: ListenerId) -> bool {
        self.inner.current.unsubscribe(listener_id)
    }

    /// Whether two handles refer to the same entry.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.inner, &other.inner)
    }

    /// Mark the entry as waiting on its source.
    pub(crate) fn mark_waiting(&self) {
        if self.inner.busy.get().is_none() {
            self.inner.busy.set(Some(true));
        }
    }

    /// Record a delivered value. Returns `true` if it was the first one.
    pub(crate) fn deliver(&self, value: V) -> bool {
        self.inner.current.set(Some(value.clone()));

        let resolver = {
            let mut resolution = self.inner.resolution.lock();
            match std::mem::replace(&mut *resolution, Resolution::Abandoned) {
                Resolution::Pending(resolver) => {
                    *resolution = Resolution::Resolved(value.clone());
                    resolver
                }
                settled => {
                    *resolution = settled;
                    return false;
                }
            }
        };

        if resolver.send(value).is_err() {
            // The entry owns the receiver, so this cannot fail.
            tracing::error!("deferred entry lost its result receiver");
        }
        self.inner.busy.set(Some(false));
        true
    }

    /// Drop the resolver so pending waiters fail instead of hanging.
    pub(crate) fn abandon(&self) {
        let mut resolution = self.inner.resolution.lock();
        if matches!(*resolution, Resolution::Pending(_)) {
            *resolution = Resolution::Abandoned;
        }
    }
}

impl<K, V> Clone for DeferredEntry<K, V>
where
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Debug for DeferredEntry<K, V>
where
    K: Debug,
    V: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredEntry")
            .field("key", &self.inner.key)
            .field("busy", &self.peek_busy())
            .field("current", &self.peek_current())
            .field("activation", &self.inner.activation.state())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn counting_entry(key: &'static str) -> (DeferredEntry<&'static str, i32>, Arc<AtomicI32>) {
        let activations = Arc::new(AtomicI32::new(0));
        let activations_clone = activations.clone();
        let entry = DeferredEntry::new(key, move || {
            activations_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (entry, activations)
    }

    #[test]
    fn fresh_entry_is_unset() {
        let (entry, activations) = counting_entry("a");

        assert_eq!(*entry.key(), "a");
        assert_eq!(entry.peek_busy(), None);
        assert_eq!(entry.peek_current(), None);
        assert!(!entry.is_activated());
        assert!(!entry.is_resolved());
        assert_eq!(activations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn first_read_of_either_field_activates_once() {
        let (entry, activations) = counting_entry("a");

        entry.current().unwrap();
        entry.busy().unwrap();
        entry.current().unwrap();

        assert_eq!(activations.load(Ordering::SeqCst), 1);
        assert!(entry.is_activated());
    }

    #[test]
    fn first_delivery_resolves_and_clears_busy() {
        let (entry, _) = counting_entry("a");
        entry.mark_waiting();
        assert_eq!(entry.peek_busy(), Some(true));

        assert!(entry.deliver(1));
        assert!(!entry.deliver(2));
        assert!(!entry.deliver(3));

        assert_eq!(entry.try_result(), Some(1));
        assert_eq!(entry.peek_current(), Some(3));
        assert_eq!(entry.peek_busy(), Some(false));
    }

    #[test]
    fn mark_waiting_does_not_reset_resolved_entry() {
        let (entry, _) = counting_entry("a");
        entry.deliver(5);
        entry.mark_waiting();
        assert_eq!(entry.peek_busy(), Some(false));
    }

    #[test]
    fn on_update_sees_every_delivery() {
        let (entry, _) = counting_entry("a");
        let sum = Arc::new(AtomicI32::new(0));
        let sum_clone = sum.clone();

        let id = entry.on_update(move |v| {
            sum_clone.fetch_add(*v, Ordering::SeqCst);
        });
        entry.deliver(1);
        entry.deliver(10);
        assert!(entry.remove_listener(id));
        entry.deliver(100);

        assert_eq!(sum.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn clones_share_identity() {
        let (entry, _) = counting_entry("a");
        let (other, _) = counting_entry("a");
        let clone = entry.clone();

        assert!(DeferredEntry::ptr_eq(&entry, &clone));
        assert!(!DeferredEntry::ptr_eq(&entry, &other));

        clone.deliver(4);
        assert_eq!(entry.try_result(), Some(4));
    }

    #[test]
    fn failed_activation_propagates_and_retries() {
        let attempts = Arc::new(AtomicI32::new(0));
        let attempts_clone = attempts.clone();
        let entry: DeferredEntry<&str, i32> = DeferredEntry::new("a", move || {
            if attempts_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(CacheError::subscribe(&"a", "offline".into()))
            } else {
                Ok(())
            }
        });

        assert!(matches!(entry.busy(), Err(CacheError::Subscribe { .. })));
        assert!(!entry.is_activated());
        assert_eq!(entry.busy().unwrap(), None);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn result_resolves_with_first_value() {
        let (entry, activations) = counting_entry("a");

        let waiter = {
            let entry = entry.clone();
            tokio::spawn(async move { entry.result().await })
        };
        tokio::task::yield_now().await;

        entry.deliver(7);
        entry.deliver(8);

        assert_eq!(waiter.await.unwrap().unwrap(), 7);
        assert_eq!(entry.result().await.unwrap(), 7);
        assert_eq!(activations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abandoned_entry_fails_waiters() {
        let (entry, _) = counting_entry("a");
        entry.abandon();

        assert!(matches!(entry.result().await, Err(CacheError::Disposed)));
        assert!(!entry.deliver(1));
        assert_eq!(entry.peek_current(), Some(1));
    }
}
