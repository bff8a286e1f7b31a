//! Observing Cache
//!
//! The cache maps keys to [`DeferredEntry`] handles and keeps at most one
//! source subscription per key.
//!
//! # Lifecycle of a key
//!
//! ```text
//! get()            -> entry created, activation armed
//! first read       -> Source::subscribe called, busy = Some(true)
//! first delivery   -> current set, result resolved, busy = Some(false)
//!                     DisposeAfterFirst: subscription torn down right here
//!                     PersistObserving: subscription stays live
//! later deliveries -> current updated (PersistObserving only)
//! dispose()        -> every live subscription torn down once
//! ```
//!
//! The strategy is read when a first delivery arrives, not when the entry is
//! created, so switching strategy affects every key that has not resolved
//! yet and none that already has.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::config::{CacheOptions, ObservingStrategy};
use crate::entry::DeferredEntry;
use crate::error::CacheError;
use crate::source::{OnValue, Source};
use crate::subscription::{Activated, SubscriptionManager};

/// Keyed, deduplicating cache over a push-based [`Source`].
///
/// Clones share the same cache. When the last clone is dropped without
/// [`dispose`](Self::dispose), live subscriptions are torn down anyway.
///
/// # Example
///
/// ```rust
/// use observing_cache::{ObservingCache, OnValue, SourceError, Unsubscribe};
///
/// # tokio_test_runtime(async {
/// let cache = ObservingCache::new(
///     |key: &u32, on_value: OnValue<u32>| -> Result<Unsubscribe, SourceError> {
///         on_value.deliver(key * 10);
///         Ok(Unsubscribe::noop())
///     },
/// );
///
/// let entry = cache.get(4)?;
/// assert_eq!(entry.peek_busy(), None);
/// assert_eq!(entry.result().await?, 40);
/// assert_eq!(entry.busy()?, Some(false));
///
/// cache.dispose()?;
/// # Ok::<(), observing_cache::CacheError>(())
/// # });
/// # fn tokio_test_runtime<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
pub struct ObservingCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: Arc<CacheInner<K, V>>,
}

struct CacheInner<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    source: Box<dyn Source<K, V>>,
    entries: Mutex<HashMap<K, DeferredEntry<K, V>>>,
    subscriptions: SubscriptionManager<K>,
    strategy: RwLock<ObservingStrategy>,
    eager_activation: bool,
    disposed: AtomicBool,
}

impl<K, V> ObservingCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache over `source` with default options.
    pub fn new<S>(source: S) -> Self
    where
        S: Source<K, V> + 'static,
    {
        Self::with_options(source, CacheOptions::default())
    }

    /// Create a cache over `source`.
    pub fn with_options<S>(source: S, options: CacheOptions) -> Self
    where
        S: Source<K, V> + 'static,
    {
        Self {
            inner: Arc::new(CacheInner {
                source: Box::new(source),
                entries: Mutex::new(HashMap::new()),
                subscriptions: SubscriptionManager::new(),
                strategy: RwLock::new(options.strategy),
                eager_activation: options.eager_activation,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Get the entry for `key`, creating it on first use.
    ///
    /// Creating an entry does not subscribe the source; the first tracked
    /// read of the entry does (unless `eager_activation` is set). Repeated
    /// calls return the same entry, whatever state it is in.
    pub fn get(&self, key: K) -> Result<DeferredEntry<K, V>, CacheError> {
        let (entry, created) = {
            let mut entries = self.inner.entries.lock();
            if self.inner.disposed.load(Ordering::Acquire) {
                return Err(CacheError::Disposed);
            }

            match entries.get(&key) {
                Some(entry) => {
                    tracing::trace!(?key, "cache hit");
                    (entry.clone(), false)
                }
                None => {
                    tracing::trace!(?key, "creating deferred entry");
                    let entry = CacheInner::create_entry(&self.inner, key.clone());
                    entries.insert(key, entry.clone());
                    (entry, true)
                }
            }
        };

        if created && self.inner.eager_activation {
            entry.activate()?;
        }
        Ok(entry)
    }

    /// Choose whether subscriptions persist after their first delivery.
    pub fn use_observing_strategy(&self, persist: bool) -> Result<(), CacheError> {
        self.set_strategy(ObservingStrategy::from_persist(persist))
    }

    /// Set the strategy used for every future first delivery.
    pub fn set_strategy(&self, strategy: ObservingStrategy) -> Result<(), CacheError> {
        self.ensure_live()?;
        tracing::debug!(?strategy, "observing strategy changed");
        *self.inner.strategy.write() = strategy;
        Ok(())
    }

    /// The active strategy.
    pub fn strategy(&self) -> ObservingStrategy {
        *self.inner.strategy.read()
    }

    /// Tear down every live subscription and release all entries.
    ///
    /// Pending results fail with [`CacheError::Disposed`]. Teardown failures
    /// are logged and do not stop the sweep. The cache cannot be used
    /// afterwards.
    pub fn dispose(&self) -> Result<(), CacheError> {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return Err(CacheError::Disposed);
        }
        self.inner.teardown();
        Ok(())
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Whether no entries are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys with a live source subscription.
    pub fn live_subscriptions(&self) -> usize {
        self.inner.subscriptions.live_count()
    }

    fn ensure_live(&self) -> Result<(), CacheError> {
        if self.is_disposed() {
            return Err(CacheError::Disposed);
        }
        Ok(())
    }
}

impl<K, V> CacheInner<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn create_entry(this: &Arc<Self>, key: K) -> DeferredEntry<K, V> {
        let cache = Arc::downgrade(this);
        let hook_key = key.clone();
        DeferredEntry::new(key, move || {
            let cache = cache.upgrade().ok_or(CacheError::Disposed)?;
            Self::activate(&cache, &hook_key)
        })
    }

    /// Subscribe the source for `key`. Runs once per entry, from the entry's
    /// activation guard.
    fn activate(this: &Arc<Self>, key: &K) -> Result<(), CacheError> {
        if this.disposed.load(Ordering::Acquire) {
            return Err(CacheError::Disposed);
        }

        let entry = this
            .entries
            .lock()
            .get(key)
            .cloned()
            .ok_or(CacheError::Disposed)?;

        // A source may deliver and then fail its subscribe. The entry keeps
        // that first value as its snapshot and is never subscribed again.
        if entry.is_resolved() {
            tracing::trace!(?key, "entry already resolved, not resubscribing");
            return Ok(());
        }
        entry.mark_waiting();

        let on_value = {
            let cache: Weak<Self> = Arc::downgrade(this);
            let key = key.clone();
            OnValue::new(move |value| match cache.upgrade() {
                Some(cache) => cache.deliver(&key, value),
                None => tracing::trace!(?key, "dropping delivery for dropped cache"),
            })
        };

        let outcome = this
            .subscriptions
            .activate(key, || this.source.subscribe(key, on_value));

        match outcome {
            Ok(Activated::Subscribed) => {
                tracing::debug!(?key, "entry activated");
                Ok(())
            }
            Ok(Activated::TornDown) => {
                tracing::debug!(?key, "entry activated and resolved during subscribe");
                Ok(())
            }
            Ok(Activated::AlreadyActive) => Ok(()),
            Err(err @ CacheError::Unsubscribe { .. }) => {
                tracing::warn!(error = %err, "teardown after synchronous delivery failed");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Delivery handling for values pushed by the source.
    fn deliver(&self, key: &K, value: V) {
        if self.disposed.load(Ordering::Acquire) || !self.subscriptions.is_live(key) {
            tracing::trace!(?key, "dropping delivery for closed subscription");
            return;
        }

        let Some(entry) = self.entries.lock().get(key).cloned() else {
            tracing::trace!(?key, "dropping delivery for released entry");
            return;
        };

        if !entry.deliver(value) {
            tracing::trace!(?key, "current value updated");
            return;
        }

        let strategy = *self.strategy.read();
        tracing::debug!(?key, ?strategy, "first value delivered");
        if strategy.persists() {
            return;
        }

        if let Err(err) = self.subscriptions.deactivate(key) {
            tracing::warn!(error = %err, "teardown after first delivery failed");
        }
    }

    fn teardown(&self) {
        for err in self.subscriptions.deactivate_all() {
            tracing::warn!(error = %err, "teardown during dispose failed");
        }

        let entries: Vec<DeferredEntry<K, V>> = self
            .entries
            .lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in &entries {
            entry.abandon();
        }
        self.subscriptions.clear();

        tracing::debug!(entries = entries.len(), "observing cache disposed");
    }
}

impl<K, V> Drop for CacheInner<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.teardown();
        }
    }
}

impl<K, V> Clone for ObservingCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Debug for ObservingCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservingCache")
            .field("entries", &self.len())
            .field("live_subscriptions", &self.live_subscriptions())
            .field("strategy", &self.strategy())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::source::Unsubscribe;
    use std::sync::atomic::AtomicI32;
    use std::sync::Barrier;

    /// Source whose deliveries are pushed by hand.
    #[derive(Clone, Default)]
    struct ManualSource {
        inner: Arc<ManualInner>,
    }

    #[derive(Default)]
    struct ManualInner {
        callbacks: Mutex<HashMap<&'static str, OnValue<i32>>>,
        subscribes: AtomicI32,
        unsubscribes: AtomicI32,
    }

    impl ManualSource {
        fn push(&self, key: &'static str, value: i32) {
            let callback = self.inner.callbacks.lock().get(key).cloned();
            if let Some(callback) = callback {
                callback.deliver(value);
            }
        }

        fn subscribes(&self) -> i32 {
            self.inner.subscribes.load(Ordering::SeqCst)
        }

        fn unsubscribes(&self) -> i32 {
            self.inner.unsubscribes.load(Ordering::SeqCst)
        }
    }

    impl Source<&'static str, i32> for ManualSource {
        fn subscribe(
            &self,
            key: &&'static str,
            on_value: OnValue<i32>,
        ) -> Result<Unsubscribe, SourceError> {
            self.inner.subscribes.fetch_add(1, Ordering::SeqCst);
            self.inner.callbacks.lock().insert(*key, on_value);

            let inner = self.inner.clone();
            let key = *key;
            Ok(Unsubscribe::new(move || {
                inner.unsubscribes.fetch_add(1, Ordering::SeqCst);
                inner.callbacks.lock().remove(key);
            }))
        }
    }

    fn manual_cache() -> (ObservingCache<&'static str, i32>, ManualSource) {
        let source = ManualSource::default();
        (ObservingCache::new(source.clone()), source)
    }

    #[test]
    fn get_does_not_subscribe() {
        let (cache, source) = manual_cache();

        let entry = cache.get("a").unwrap();
        assert_eq!(entry.peek_busy(), None);
        assert_eq!(source.subscribes(), 0);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.live_subscriptions(), 0);
    }

    #[test]
    fn first_read_subscribes_once() {
        let (cache, source) = manual_cache();

        let entry = cache.get("a").unwrap();
        assert_eq!(entry.busy().unwrap(), Some(true));
        assert_eq!(entry.current().unwrap(), None);
        assert_eq!(cache.get("a").unwrap().busy().unwrap(), Some(true));

        assert_eq!(source.subscribes(), 1);
        assert_eq!(cache.live_subscriptions(), 1);
    }

    #[test]
    fn dispose_after_first_tears_down_on_first_delivery() {
        let (cache, source) = manual_cache();
        let entry = cache.get("a").unwrap();
        entry.activate().unwrap();

        source.push("a", 1);
        source.push("a", 2);

        assert_eq!(entry.try_result(), Some(1));
        assert_eq!(entry.peek_current(), Some(1));
        assert_eq!(entry.peek_busy(), Some(false));
        assert_eq!(source.unsubscribes(), 1);
        assert_eq!(cache.live_subscriptions(), 0);

        let again = cache.get("a").unwrap();
        assert!(DeferredEntry::ptr_eq(&entry, &again));
        assert_eq!(again.current().unwrap(), Some(1));
        assert_eq!(source.subscribes(), 1);
    }

    #[test]
    fn persist_observing_keeps_updating() {
        let (cache, source) = manual_cache();
        cache.use_observing_strategy(true).unwrap();

        let entry = cache.get("a").unwrap();
        entry.activate().unwrap();
        source.push("a", 1);
        source.push("a", 2);
        source.push("a", 3);

        assert_eq!(entry.try_result(), Some(1));
        assert_eq!(entry.current().unwrap(), Some(3));
        assert_eq!(entry.busy().unwrap(), Some(false));
        assert_eq!(source.unsubscribes(), 0);

        cache.dispose().unwrap();
        assert_eq!(source.unsubscribes(), 1);
    }

    #[test]
    fn strategy_is_read_at_delivery_time() {
        let (cache, source) = manual_cache();

        let entry = cache.get("a").unwrap();
        entry.activate().unwrap();
        cache.use_observing_strategy(true).unwrap();
        source.push("a", 1);
        assert_eq!(source.unsubscribes(), 0);

        // Already resolved, so switching back does not tear it down.
        cache.use_observing_strategy(false).unwrap();
        source.push("a", 2);
        assert_eq!(entry.peek_current(), Some(2));
        assert_eq!(source.unsubscribes(), 0);
        assert_eq!(cache.live_subscriptions(), 1);
    }

    #[test]
    fn switching_to_dispose_after_first_before_delivery_tears_down() {
        let (cache, source) = manual_cache();
        cache.use_observing_strategy(true).unwrap();

        let entry = cache.get("a").unwrap();
        entry.activate().unwrap();
        cache.use_observing_strategy(false).unwrap();
        source.push("a", 1);

        assert_eq!(entry.try_result(), Some(1));
        assert_eq!(source.unsubscribes(), 1);
        assert_eq!(cache.live_subscriptions(), 0);

        source.push("a", 2);
        assert_eq!(entry.peek_current(), Some(1));
    }

    #[test]
    fn resolved_entry_is_not_resubscribed_after_failed_subscribe() {
        let subscribes = Arc::new(AtomicI32::new(0));
        let counter = subscribes.clone();
        let cache = ObservingCache::new(
            move |key: &&'static str, on_value: OnValue<i32>| -> Result<Unsubscribe, SourceError> {
                counter.fetch_add(1, Ordering::SeqCst);
                on_value.deliver(1);
                Err(format!("{key} went away").into())
            },
        );

        let entry = cache.get("a").unwrap();
        assert!(matches!(entry.busy(), Err(CacheError::Subscribe { .. })));
        assert_eq!(entry.try_result(), Some(1));

        assert_eq!(entry.busy().unwrap(), Some(false));
        assert_eq!(entry.current().unwrap(), Some(1));
        assert!(entry.is_activated());
        assert_eq!(subscribes.load(Ordering::SeqCst), 1);
        assert_eq!(cache.live_subscriptions(), 0);
    }

    #[test]
    fn dispose_racing_first_read_leaves_nothing_subscribed() {
        for _ in 0..500 {
            let (cache, source) = manual_cache();
            cache.use_observing_strategy(true).unwrap();
            let entry = cache.get("a").unwrap();
            let barrier = Barrier::new(2);

            std::thread::scope(|scope| {
                scope.spawn(|| {
                    barrier.wait();
                    let _ = entry.busy();
                });
                barrier.wait();
                cache.dispose().unwrap();
            });

            assert_eq!(source.subscribes(), source.unsubscribes());
            assert_eq!(cache.live_subscriptions(), 0);
        }
    }

    #[test]
    fn disposed_cache_fails_fast() {
        let (cache, _source) = manual_cache();
        cache.dispose().unwrap();

        assert!(cache.is_disposed());
        assert!(cache.is_empty());
        assert!(matches!(cache.get("a"), Err(CacheError::Disposed)));
        assert!(matches!(cache.use_observing_strategy(true), Err(CacheError::Disposed)));
        assert!(matches!(cache.dispose(), Err(CacheError::Disposed)));
    }

    #[test]
    fn entry_from_disposed_cache_cannot_activate() {
        let (cache, source) = manual_cache();
        let entry = cache.get("a").unwrap();
        cache.dispose().unwrap();

        assert!(matches!(entry.busy(), Err(CacheError::Disposed)));
        assert_eq!(source.subscribes(), 0);
    }

    #[test]
    fn delivery_after_dispose_is_dropped() {
        let (cache, source) = manual_cache();
        cache.use_observing_strategy(true).unwrap();
        let entry = cache.get("a").unwrap();
        entry.activate().unwrap();

        let stale = source.inner.callbacks.lock().get("a").cloned().unwrap();
        cache.dispose().unwrap();
        stale.deliver(9);

        assert_eq!(entry.peek_current(), None);
    }

    #[test]
    fn dropping_last_handle_tears_down() {
        let (cache, source) = manual_cache();
        cache.use_observing_strategy(true).unwrap();
        for key in ["a", "b"] {
            cache.get(key).unwrap().activate().unwrap();
        }
        let clone = cache.clone();

        drop(cache);
        assert_eq!(source.unsubscribes(), 0);
        drop(clone);
        assert_eq!(source.unsubscribes(), 2);
    }

    #[test]
    fn eager_activation_subscribes_on_get() {
        let source = ManualSource::default();
        let options = CacheOptions {
            eager_activation: true,
            ..CacheOptions::default()
        };
        let cache = ObservingCache::with_options(source.clone(), options);

        let entry = cache.get("a").unwrap();
        assert_eq!(entry.peek_busy(), Some(true));
        cache.get("a").unwrap();
        assert_eq!(source.subscribes(), 1);
    }
}
