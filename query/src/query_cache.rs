use std::{
    cell::RefCell,
    collections::{hash_map::Entry, HashMap},
    panic::AssertUnwindSafe,
    rc::{Rc, Weak},
};

use leptos::logging;

use crate::{
    garbage_collector::GarbageCollector,
    query::{AnyQuery, Query},
    CacheEntry, EntryPatch, Instant, QueryKey, QueryValue,
};

/// Keyed store of cached results with subscriber notification and eviction timers.
///
/// The cache is an explicit object, usually owned by a [`QueryClient`](crate::QueryClient)
/// and shared through context. Cloning is cheap and shares the same store.
#[derive(Clone)]
pub struct QueryCache {
    inner: Rc<CacheInner>,
}

struct CacheInner {
    queries: RefCell<HashMap<QueryKey, Rc<dyn AnyQuery>>>,
    garbage_collector: GarbageCollector,
    clock: Rc<dyn Fn() -> Instant>,
}

/// Handle that does not keep the cache alive. Held by in-flight fetches.
#[derive(Clone)]
pub(crate) struct WeakQueryCache(Weak<CacheInner>);

impl WeakQueryCache {
    pub(crate) fn upgrade(&self) -> Option<QueryCache> {
        self.0.upgrade().map(|inner| QueryCache { inner })
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    /// Creates an empty cache using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Instant::now)
    }

    /// Creates an empty cache with a custom clock for staleness checks.
    pub fn with_clock(clock: impl Fn() -> Instant + 'static) -> Self {
        Self {
            inner: Rc::new(CacheInner {
                queries: RefCell::new(HashMap::new()),
                garbage_collector: GarbageCollector::new(),
                clock: Rc::new(clock),
            }),
        }
    }

    pub(crate) fn now(&self) -> Instant {
        (self.inner.clock)()
    }

    pub(crate) fn downgrade(&self) -> WeakQueryCache {
        WeakQueryCache(Rc::downgrade(&self.inner))
    }

    /// Snapshot of the entry for `key`. Pure lookup, no side effects.
    pub fn get<V>(&self, key: &QueryKey) -> Option<CacheEntry<V>>
    where
        V: QueryValue + 'static,
    {
        self.get_query::<V>(key).map(|query| query.get_state())
    }

    /// Merges `patch` into the entry for `key`, creating it if absent.
    ///
    /// Subscribers are not notified; call [`notify`](Self::notify) once the update is complete.
    pub fn set<V>(&self, key: &QueryKey, patch: EntryPatch<V>)
    where
        V: QueryValue + 'static,
    {
        let query = self.get_or_create_query::<V>(key);
        query.apply(patch, self.now());
    }

    /// Registers `listener` for `key`, creating the entry if absent.
    ///
    /// The returned closure unsubscribes. Removing the last subscriber arms the eviction timer
    /// and aborts an in-flight request nobody else is awaiting.
    pub fn subscribe<V>(
        &self,
        key: &QueryKey,
        listener: impl Fn() + 'static,
    ) -> impl FnOnce() + 'static
    where
        V: QueryValue + 'static,
    {
        let query = self.get_or_create_query::<V>(key);
        let subscriber = query.subscribe(Rc::new(listener));
        self.inner.garbage_collector.disable_gc(key);

        let cache = Rc::downgrade(&self.inner);
        move || {
            if !query.unsubscribe(subscriber) {
                logging::debug_warn!("Subscriber for {} was already removed.", query.key);
                return;
            }
            if let Some(inner) = cache.upgrade() {
                let cache = QueryCache { inner };
                cache.on_subscriber_removed(&*query);
            }
        }
    }

    /// Synchronously invokes every subscriber of `key`.
    ///
    /// A panicking subscriber is logged and does not prevent the others from running.
    pub fn notify(&self, key: &QueryKey) {
        let listeners = match self.queries().get(key) {
            Some(query) => query.listeners(),
            None => return,
        };
        for listener in listeners {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| listener()));
            if result.is_err() {
                logging::error!("Subscriber for {} panicked while being notified.", key);
            }
        }
    }

    /// Drops every entry, aborts their requests and disarms all eviction timers.
    pub fn clear(&self) {
        let queries: Vec<Rc<dyn AnyQuery>> = self
            .inner
            .queries
            .try_borrow_mut()
            .expect("clear borrow_mut")
            .drain()
            .map(|(_, query)| query)
            .collect();
        self.inner.garbage_collector.clear();
        for query in queries {
            query.cancel();
        }
    }

    /// Removes the entry for `key`. Returns true if it existed.
    pub fn evict(&self, key: &QueryKey) -> bool {
        let removed = self
            .inner
            .queries
            .try_borrow_mut()
            .expect("evict borrow_mut")
            .remove(key);
        self.inner.garbage_collector.disable_gc(key);
        match removed {
            Some(query) => {
                query.cancel();
                true
            }
            None => false,
        }
    }

    /// Marks the success entry for `key` as stale. Returns true if it was marked.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        self.queries()
            .get(key)
            .map(|query| query.mark_invalid())
            .unwrap_or(false)
    }

    /// Marks every success entry whose key starts with `prefix` as stale.
    /// Returns the invalidated keys.
    pub fn invalidate_prefix(&self, prefix: &QueryKey) -> Vec<QueryKey> {
        self.queries()
            .values()
            .filter(|query| query.key().starts_with(prefix) && query.mark_invalid())
            .map(|query| query.key().clone())
            .collect()
    }

    /// Marks every success entry as stale.
    pub fn invalidate_all(&self) {
        for query in self.queries().values() {
            query.mark_invalid();
        }
    }

    /// Aborts the in-flight request for `key`, restoring the previous state.
    pub fn cancel(&self, key: &QueryKey) -> bool {
        let query = self.queries().get(key).cloned();
        match query {
            Some(query) => {
                let cancelled = query.cancel();
                if cancelled {
                    self.notify(key);
                    self.schedule_gc_if_unused(key);
                }
                cancelled
            }
            None => false,
        }
    }

    /// Gives up interest in the request for `key`.
    ///
    /// The request is aborted only if no subscriber and no awaiting caller is left.
    pub fn release(&self, key: &QueryKey) -> bool {
        let unused = self
            .queries()
            .get(key)
            .map_or(false, |query| query.subscriber_count() == 0 && query.waiter_count() == 0);
        unused && self.cancel(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.queries().len()
    }

    /// Returns true if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.queries().is_empty()
    }

    /// Returns true if an entry exists for `key`.
    pub fn contains(&self, key: &QueryKey) -> bool {
        self.queries().contains_key(key)
    }

    /// Number of subscribers registered for `key`.
    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        self.queries()
            .get(key)
            .map(|query| query.subscriber_count())
            .unwrap_or(0)
    }

    /// Returns true while an eviction timer is armed for `key`.
    pub fn is_gc_scheduled(&self, key: &QueryKey) -> bool {
        self.inner.garbage_collector.is_enabled(key)
    }

    /**
     * Crate internals.
     */

    fn queries(&self) -> std::cell::Ref<'_, HashMap<QueryKey, Rc<dyn AnyQuery>>> {
        self.inner.queries.try_borrow().expect("queries borrow")
    }

    pub(crate) fn get_query<V>(&self, key: &QueryKey) -> Option<Rc<Query<V>>>
    where
        V: QueryValue + 'static,
    {
        let query = self.queries().get(key).cloned()?;
        match query.into_any().downcast::<Query<V>>() {
            Ok(query) => Some(query),
            Err(_) => {
                logging::debug_warn!("Query cache type mismatch for key {}.", key);
                None
            }
        }
    }

    pub(crate) fn get_or_create_query<V>(&self, key: &QueryKey) -> Rc<Query<V>>
    where
        V: QueryValue + 'static,
    {
        if let Some(query) = self.get_query::<V>(key) {
            return query;
        }

        let query = Rc::new(Query::<V>::new(key.clone()));
        let mut queries = self
            .inner
            .queries
            .try_borrow_mut()
            .expect("get_or_create_query borrow_mut");
        // At most one entry per key: an entry of another value type is replaced.
        let replaced = match queries.entry(key.clone()) {
            Entry::Occupied(mut entry) => Some(entry.insert(query.clone())),
            Entry::Vacant(entry) => {
                entry.insert(query.clone());
                None
            }
        };
        drop(queries);

        if let Some(replaced) = replaced {
            logging::debug_warn!("Replacing entry of another value type for key {}.", key);
            replaced.cancel();
        }
        query
    }

    fn on_subscriber_removed(&self, query: &dyn AnyQuery) {
        if query.subscriber_count() > 0 {
            return;
        }
        // Cancellation is reference counted: abort only if no one is left to use the result.
        if query.is_fetching() && query.waiter_count() == 0 && query.cancel() {
            self.notify(query.key());
        }
        self.schedule_gc_if_unused(query.key());
    }

    pub(crate) fn schedule_gc_if_unused(&self, key: &QueryKey) {
        let gc_time = match self.queries().get(key) {
            Some(query) if query.subscriber_count() == 0 => query.gc_time(),
            _ => None,
        };
        let Some(gc_time) = gc_time else {
            return;
        };

        let cache = Rc::downgrade(&self.inner);
        let expired_key = key.clone();
        self.inner
            .garbage_collector
            .enable_gc(key.clone(), gc_time, move || {
                evict_if_unused(&cache, &expired_key)
            });
    }
}

fn evict_if_unused(cache: &Weak<CacheInner>, key: &QueryKey) {
    let Some(inner) = cache.upgrade() else {
        return;
    };
    let cache = QueryCache { inner };
    cache.inner.garbage_collector.disable_gc(key);

    let unused = cache
        .queries()
        .get(key)
        .map(|query| query.subscriber_count() == 0 && !query.is_fetching())
        .unwrap_or(false);
    if unused {
        logging::log!("Evicting unused query {}", key);
        cache.evict(key);
    }
}
