use std::{
    any::Any,
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use futures::future::{LocalBoxFuture, Shared};
use leptos::logging;
use slotmap::SlotMap;

use crate::{
    AbortController, AbortSignal, CacheEntry, EntryPatch, Instant, QueryError, QueryKey,
    QueryStatus,
};

pub(crate) type SharedFetch<V> = Shared<LocalBoxFuture<'static, Result<V, QueryError>>>;

slotmap::new_key_type! {
    pub(crate) struct SubscriberKey;
}

/// Cached state and synchronization for a single key.
pub(crate) struct Query<V> {
    pub(crate) key: QueryKey,

    // State
    state: RefCell<CacheEntry<V>>,
    invalidated: Cell<bool>,

    // Cancellation
    current_request: RefCell<Option<Execution<V>>>,
    waiters: Cell<usize>,

    // Synchronization
    subscribers: RefCell<SlotMap<SubscriberKey, Rc<dyn Fn()>>>,
    gc_time: Cell<Option<Duration>>,
}

struct Execution<V> {
    controller: AbortController,
    future: SharedFetch<V>,
    status_before: QueryStatus,
}

impl<V> Query<V>
where
    V: crate::QueryValue + 'static,
{
    pub(crate) fn new(key: QueryKey) -> Self {
        Query {
            key,
            state: RefCell::new(CacheEntry::default()),
            invalidated: Cell::new(false),
            current_request: RefCell::new(None),
            waiters: Cell::new(0),
            subscribers: RefCell::new(SlotMap::with_key()),
            gc_time: Cell::new(None),
        }
    }

    pub(crate) fn get_state(&self) -> CacheEntry<V> {
        self.state.try_borrow().expect("get_state borrow").clone()
    }

    // Useful to avoid clones.
    pub(crate) fn with_state<T>(&self, func: impl FnOnce(&CacheEntry<V>) -> T) -> T {
        func(&self.state.try_borrow().expect("with_state borrow"))
    }

    pub(crate) fn update_state(&self, update_fn: impl FnOnce(&mut CacheEntry<V>)) {
        update_fn(&mut self.state.try_borrow_mut().expect("update_state borrow_mut"));
    }

    pub(crate) fn apply(&self, patch: EntryPatch<V>, now: Instant) {
        let is_success = patch.status == Some(QueryStatus::Success);
        self.update_state(|state| state.apply(patch, now));
        if is_success {
            self.invalidated.set(false);
        }
    }

    /// Cached data, if it is a success younger than `stale_time`.
    pub(crate) fn fresh_data(&self, stale_time: Option<Duration>, now: Instant) -> Option<V> {
        if self.invalidated.get() {
            return None;
        }
        self.with_state(|state| {
            if state.is_fresh(stale_time, now) {
                state.data.clone()
            } else {
                None
            }
        })
    }

    /// Keep max gc time.
    pub(crate) fn update_gc_time(&self, gc_time: Option<Duration>) {
        match (self.gc_time.get(), gc_time) {
            (Some(current), Some(gc_time)) if gc_time > current => {
                self.gc_time.set(Some(gc_time));
            }
            (None, Some(gc_time)) => {
                self.gc_time.set(Some(gc_time));
            }
            _ => {}
        }
    }

    /**
     * Subscribers.
     */

    pub(crate) fn subscribe(&self, listener: Rc<dyn Fn()>) -> SubscriberKey {
        self.subscribers
            .try_borrow_mut()
            .expect("subscribe borrow_mut")
            .insert(listener)
    }

    pub(crate) fn unsubscribe(&self, key: SubscriberKey) -> bool {
        self.subscribers
            .try_borrow_mut()
            .expect("unsubscribe borrow_mut")
            .remove(key)
            .is_some()
    }

    /**
     * Execution and Cancellation.
     */

    pub(crate) fn in_flight(&self) -> Option<SharedFetch<V>> {
        self.current_request
            .try_borrow()
            .expect("in_flight borrow")
            .as_ref()
            .map(|execution| execution.future.clone())
    }

    // Only one execution may own the entry at a time.
    pub(crate) fn begin_execution(
        &self,
        controller: AbortController,
        future: SharedFetch<V>,
    ) -> QueryStatus {
        let status_before = self.with_state(|state| state.status);
        let previous = self
            .current_request
            .try_borrow_mut()
            .expect("begin_execution borrow_mut")
            .replace(Execution {
                controller,
                future,
                status_before,
            });
        if let Some(previous) = previous {
            logging::debug_warn!("Replacing an unfinished request for {}", self.key);
            previous.controller.abort();
        }
        status_before
    }

    /// Returns true if the execution owning `signal` is still the current one.
    pub(crate) fn is_current(&self, signal: &AbortSignal) -> bool {
        self.current_request
            .try_borrow()
            .expect("is_current borrow")
            .as_ref()
            .map(|execution| execution.controller.signal().same(signal))
            .unwrap_or(false)
    }

    /// Releases the execution owning `signal` and returns the status it started from.
    /// Returns None if the execution was cancelled or superseded and must not write state.
    pub(crate) fn finish_execution(&self, signal: &AbortSignal) -> Option<QueryStatus> {
        let mut current = self
            .current_request
            .try_borrow_mut()
            .expect("finish_execution borrow_mut");
        let owns = current
            .as_ref()
            .map(|execution| execution.controller.signal().same(signal))
            .unwrap_or(false);
        if owns {
            current.take().map(|execution| execution.status_before)
        } else {
            None
        }
    }

    pub(crate) fn add_waiter(self: &Rc<Self>) -> WaiterGuard<V> {
        self.waiters.set(self.waiters.get() + 1);
        WaiterGuard {
            query: self.clone(),
        }
    }

    pub(crate) fn restore_after_cancel(&self, status_before: QueryStatus) {
        self.update_state(|state| {
            state.is_fetching = false;
            state.status = match (status_before, state.data.is_some()) {
                (QueryStatus::Loading, true) => QueryStatus::Success,
                (QueryStatus::Loading, false) => QueryStatus::Idle,
                (status, _) => status,
            };
        });
    }
}

pub(crate) struct WaiterGuard<V>
where
    V: crate::QueryValue + 'static,
{
    query: Rc<Query<V>>,
}

impl<V> Drop for WaiterGuard<V>
where
    V: crate::QueryValue + 'static,
{
    fn drop(&mut self) {
        let waiters = self.query.waiters.get();
        self.query.waiters.set(waiters.saturating_sub(1));
    }
}

/// Type erased view of a [`Query`], enabling cache wide operations across value types.
pub(crate) trait AnyQuery {
    fn into_any(self: Rc<Self>) -> Rc<dyn Any>;
    fn key(&self) -> &QueryKey;
    fn listeners(&self) -> Vec<Rc<dyn Fn()>>;
    fn subscriber_count(&self) -> usize;
    fn waiter_count(&self) -> usize;
    fn is_fetching(&self) -> bool;
    fn gc_time(&self) -> Option<Duration>;
    /// Aborts the in-flight request and restores the pre-fetch state.
    fn cancel(&self) -> bool;
    /// Marks success data as stale so the next read refetches.
    fn mark_invalid(&self) -> bool;
}

impl<V> AnyQuery for Query<V>
where
    V: crate::QueryValue + 'static,
{
    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }

    fn key(&self) -> &QueryKey {
        &self.key
    }

    fn listeners(&self) -> Vec<Rc<dyn Fn()>> {
        self.subscribers
            .try_borrow()
            .expect("listeners borrow")
            .values()
            .cloned()
            .collect()
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers
            .try_borrow()
            .expect("subscriber_count borrow")
            .len()
    }

    fn waiter_count(&self) -> usize {
        self.waiters.get()
    }

    fn is_fetching(&self) -> bool {
        self.current_request
            .try_borrow()
            .expect("is_fetching borrow")
            .is_some()
    }

    fn gc_time(&self) -> Option<Duration> {
        self.gc_time.get()
    }

    fn cancel(&self) -> bool {
        let execution = self
            .current_request
            .try_borrow_mut()
            .expect("cancel borrow_mut")
            .take();
        match execution {
            Some(execution) => {
                logging::debug_warn!("Cancelling request for {}", self.key);
                execution.controller.abort();
                self.restore_after_cancel(execution.status_before);
                true
            }
            None => false,
        }
    }

    fn mark_invalid(&self) -> bool {
        let loaded = self.with_state(|state| state.status == QueryStatus::Success);
        if loaded {
            self.invalidated.set(true);
        }
        loaded
    }
}
