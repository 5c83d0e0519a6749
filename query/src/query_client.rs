use std::{cell::RefCell, future::Future, rc::Rc};

use leptos::*;
use slotmap::SlotMap;

use crate::{
    query_executor::{execute_query, into_fetcher, FetchMode},
    AbortSignal, CacheEntry, DefaultQueryOptions, EntryPatch, Instant, QueryCache, QueryError,
    QueryKey, QueryOptions, QueryValue,
};

/// Provides a Query Client to the current scope.
pub fn provide_query_client() {
    provide_query_client_with_options(DefaultQueryOptions::default());
}

/// Provides a Query Client to the current scope with custom options.
pub fn provide_query_client_with_options(options: DefaultQueryOptions) {
    provide_context(QueryClient::new(options));
}

/// Retrieves a Query Client from the current scope.
pub fn use_query_client() -> QueryClient {
    use_context::<QueryClient>().expect("Query Client Missing.")
}

/// Events that refetch mounted queries which opted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchTrigger {
    /// The window regained focus.
    WindowFocus,
    /// The network came back online.
    Reconnect,
}

slotmap::new_key_type! {
    pub(crate) struct ActiveQueryKey;
}

/// A mounted query that can be refetched by the client.
pub(crate) struct ActiveQuery {
    pub(crate) key: QueryKey,
    pub(crate) on_window_focus: bool,
    pub(crate) on_reconnect: bool,
    pub(crate) refetch: Rc<dyn Fn()>,
}

/// The Cache Client to store query data.
/// Exposes utility functions to manage queries.
///
/// Queries can be:
/// - [Fetched](Self::fetch_query)
///     - Concurrent fetches of one key share a single request.
/// - [Prefetched](Self::prefetch_query)
///     - Query will start loading before you invoke [use_fme_query](crate::use_fme_query()).
/// - [Invalidated](Self::invalidate_query)
///     - Query will refetch on next usage. Active queries are immediately refetched in the background.
/// - [Introspected](Self::get_query_state)
///     - Lets you see what the current value of a query is.
/// - [Manually updated](Self::set_query_data)
///     - Useful when you have updated a value and you want to manually set it in cache instead of waiting for query to refetch.
/// - [Cancelled](Self::cancel_query)
#[derive(Clone)]
pub struct QueryClient {
    pub(crate) cache: QueryCache,
    pub(crate) default_options: DefaultQueryOptions,
    active: Rc<RefCell<SlotMap<ActiveQueryKey, ActiveQuery>>>,
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new(DefaultQueryOptions::default())
    }
}

impl QueryClient {
    /// Creates a new Query Client.
    pub fn new(default_options: DefaultQueryOptions) -> Self {
        Self::with_cache(QueryCache::new(), default_options)
    }

    /// Creates a new Query Client whose staleness checks read `clock`.
    pub fn with_clock(
        default_options: DefaultQueryOptions,
        clock: impl Fn() -> Instant + 'static,
    ) -> Self {
        Self::with_cache(QueryCache::with_clock(clock), default_options)
    }

    /// Creates a new Query Client on top of an existing cache.
    pub fn with_cache(cache: QueryCache, default_options: DefaultQueryOptions) -> Self {
        Self {
            cache,
            default_options,
            active: Rc::new(RefCell::new(SlotMap::with_key())),
        }
    }

    /// The underlying cache.
    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// The client-wide defaults.
    pub fn default_options(&self) -> &DefaultQueryOptions {
        &self.default_options
    }

    /// Query options built from this client's defaults.
    pub fn query_options<V>(&self) -> QueryOptions<V> {
        QueryOptions::from_defaults(&self.default_options)
    }

    /// Fetch a query and store it in cache.
    ///
    /// Fresh cached data is returned without calling `fetcher`. If a request for `key` is already
    /// in flight, its result is shared instead of starting a second one.
    ///
    /// While awaiting, the caller keeps the request alive even if every subscriber of `key` leaves.
    pub async fn fetch_query<V, Fu>(
        &self,
        key: QueryKey,
        fetcher: impl Fn(AbortSignal) -> Fu + 'static,
        options: QueryOptions<V>,
    ) -> Result<V, QueryError>
    where
        V: QueryValue + 'static,
        Fu: Future<Output = Result<V, QueryError>> + 'static,
    {
        self.run_query(key, fetcher, options, FetchMode::Cached).await
    }

    /// Like [`fetch_query`](Self::fetch_query), but ignores the stale time.
    pub async fn refetch_query<V, Fu>(
        &self,
        key: QueryKey,
        fetcher: impl Fn(AbortSignal) -> Fu + 'static,
        options: QueryOptions<V>,
    ) -> Result<V, QueryError>
    where
        V: QueryValue + 'static,
        Fu: Future<Output = Result<V, QueryError>> + 'static,
    {
        self.run_query(key, fetcher, options, FetchMode::Force).await
    }

    /// Prefetch a query and store it in cache.
    ///
    /// If you need the result opt for [`fetch_query()`](Self::fetch_query)
    pub async fn prefetch_query<V, Fu>(
        &self,
        key: QueryKey,
        fetcher: impl Fn(AbortSignal) -> Fu + 'static,
        options: QueryOptions<V>,
    ) where
        V: QueryValue + 'static,
        Fu: Future<Output = Result<V, QueryError>> + 'static,
    {
        let _ = self.run_query(key, fetcher, options, FetchMode::Cached).await;
    }

    async fn run_query<V, Fu>(
        &self,
        key: QueryKey,
        fetcher: impl Fn(AbortSignal) -> Fu + 'static,
        options: QueryOptions<V>,
        mode: FetchMode,
    ) -> Result<V, QueryError>
    where
        V: QueryValue + 'static,
        Fu: Future<Output = Result<V, QueryError>> + 'static,
    {
        let query = self.cache.get_or_create_query::<V>(&key);
        let _waiter = query.add_waiter();
        let fetch = execute_query(&self.cache, &query, into_fetcher(fetcher), &options, mode);
        fetch.resolve().await
    }

    /// Starts a fetch owned by the subscribers of `key` rather than by an awaiting caller.
    pub(crate) fn spawn_fetch<V>(
        &self,
        key: &QueryKey,
        fetcher: crate::query_executor::Fetcher<V>,
        options: &QueryOptions<V>,
        mode: FetchMode,
    ) where
        V: QueryValue + 'static,
    {
        let query = self.cache.get_or_create_query::<V>(key);
        // The spawned driver runs the request; nothing here awaits it.
        let _ = execute_query(&self.cache, &query, fetcher, options, mode);
    }

    /// Retrieve the data for an existing query.
    pub fn get_query_data<V>(&self, key: &QueryKey) -> Option<V>
    where
        V: QueryValue + 'static,
    {
        self.cache.get::<V>(key).and_then(|entry| entry.data)
    }

    /// Retrieve the current state for an existing query.
    /// If the query does not exist, [`None`](Option::None) will be returned.
    pub fn get_query_state<V>(&self, key: &QueryKey) -> Option<CacheEntry<V>>
    where
        V: QueryValue + 'static,
    {
        self.cache.get::<V>(key)
    }

    /// A synchronous function that can be used to immediately set a query's data.
    ///
    /// If the query does not exist, it will be created.
    ///
    /// If the updater function returns [`None`](Option::None), the query data will not be updated.
    pub fn update_query_data<V>(&self, key: &QueryKey, updater: impl FnOnce(Option<&V>) -> Option<V>)
    where
        V: QueryValue + 'static,
    {
        let current = self.cache.get::<V>(key).and_then(|entry| entry.data);
        let Some(data) = updater(current.as_ref()) else {
            return;
        };

        let query = self.cache.get_or_create_query::<V>(key);
        query.update_gc_time(self.default_options.gc_time);
        let is_fetching = query.with_state(|state| state.is_fetching);
        self.cache
            .set::<V>(key, EntryPatch::success(data).set_fetching(is_fetching));
        self.cache.notify(key);
        self.cache.schedule_gc_if_unused(key);
    }

    /// Update the query's data.
    /// If the query does not exist, it will be created.
    pub fn set_query_data<V>(&self, key: &QueryKey, data: V)
    where
        V: QueryValue + 'static,
    {
        self.update_query_data(key, |_| Some(data));
    }

    /// Attempts to invalidate an entry in the Query Cache.
    /// Matching query is marked as invalid, and will be refetched in background once it's active.
    ///
    /// Returns true if the entry was successfully invalidated.
    pub fn invalidate_query(&self, key: &QueryKey) -> bool {
        let invalidated = self.cache.invalidate(key);
        if invalidated {
            self.refetch_active(|active| &active.key == key);
        }
        invalidated
    }

    /// Invalidates every entry whose key starts with `prefix`.
    ///
    /// Returns the keys that were successfully invalidated.
    pub fn invalidate_queries(&self, prefix: &QueryKey) -> Vec<QueryKey> {
        let invalidated = self.cache.invalidate_prefix(prefix);
        self.refetch_active(|active| invalidated.contains(&active.key));
        invalidated
    }

    /// Invalidates all queries in the cache.
    pub fn invalidate_all_queries(&self) {
        self.cache.invalidate_all();
        self.refetch_active(|_| true);
    }

    /// Cancel any currently executing query.
    /// Returns whether the query was cancelled or not.
    pub fn cancel_query(&self, key: &QueryKey) -> bool {
        self.cache.cancel(key)
    }

    /// Cancels the query unless a subscriber or another caller still awaits it.
    /// Returns whether the query was cancelled or not.
    pub fn release_query(&self, key: &QueryKey) -> bool {
        self.cache.release(key)
    }

    /// Refetches mounted queries that opted in to `trigger`.
    /// Returns how many were refetched.
    pub fn trigger_refetch(&self, trigger: RefetchTrigger) -> usize {
        self.refetch_active(|active| match trigger {
            RefetchTrigger::WindowFocus => active.on_window_focus,
            RefetchTrigger::Reconnect => active.on_reconnect,
        })
    }

    /// Returns the current size of the cache.
    pub fn size(&self) -> usize {
        self.cache.len()
    }

    /// Clears the cache. All queries will be removed.
    pub fn clear(&self) {
        self.cache.clear()
    }

    pub(crate) fn register_active(&self, active: ActiveQuery) -> ActiveQueryKey {
        self.active
            .try_borrow_mut()
            .expect("register_active borrow_mut")
            .insert(active)
    }

    pub(crate) fn unregister_active(&self, key: ActiveQueryKey) {
        self.active
            .try_borrow_mut()
            .expect("unregister_active borrow_mut")
            .remove(key);
    }

    fn refetch_active(&self, filter: impl Fn(&ActiveQuery) -> bool) -> usize {
        // Collect first: a refetch may register or unregister active queries.
        let refetches = self
            .active
            .try_borrow()
            .expect("refetch_active borrow")
            .values()
            .filter(|active| filter(active))
            .map(|active| active.refetch.clone())
            .collect::<Vec<_>>();
        for refetch in &refetches {
            refetch();
        }
        refetches.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{query_key, QueryStatus, Retry, RetryDelay};
    use std::{cell::Cell, time::Duration};
    use tokio::task::LocalSet;

    fn options(client: &QueryClient) -> QueryOptions<u32> {
        client
            .query_options::<u32>()
            .set_retry_delay(RetryDelay::Fixed(Duration::from_millis(100)))
    }

    fn counting_fetcher(
        calls: &Rc<Cell<u32>>,
        result: Result<u32, QueryError>,
    ) -> impl Fn(AbortSignal) -> futures::future::LocalBoxFuture<'static, Result<u32, QueryError>>
    {
        use futures::FutureExt;
        let calls = calls.clone();
        move |_| {
            calls.set(calls.get() + 1);
            let result = result.clone();
            async move {
                crate::sleep(Duration::from_millis(50)).await;
                result
            }
            .boxed_local()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_fetches_share_one_request() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::default();
                let calls = Rc::new(Cell::new(0));
                let key = query_key!["workspaces", "repo"];

                let (first, second) = futures::join!(
                    client.fetch_query(key.clone(), counting_fetcher(&calls, Ok(1)), options(&client)),
                    client.fetch_query(key.clone(), counting_fetcher(&calls, Ok(2)), options(&client)),
                );

                assert_eq!(first, Ok(1));
                assert_eq!(second, Ok(1));
                assert_eq!(calls.get(), 1);
                assert_eq!(client.size(), 1);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn reads_within_stale_time_use_cache() {
        LocalSet::new()
            .run_until(async {
                let now = Rc::new(Cell::new(Instant(Duration::from_secs(1_000))));
                let client = QueryClient::with_clock(DefaultQueryOptions::default(), {
                    let now = now.clone();
                    move || now.get()
                });
                let calls = Rc::new(Cell::new(0));
                let key = query_key!["health"];
                let options = options(&client).set_stale_time(Some(Duration::from_secs(60)));

                let fetch = || client.fetch_query(key.clone(), counting_fetcher(&calls, Ok(5)), options.clone());

                assert_eq!(fetch().await, Ok(5));
                assert_eq!(calls.get(), 1);

                now.set(Instant(Duration::from_secs(1_059)));
                assert_eq!(fetch().await, Ok(5));
                assert_eq!(calls.get(), 1, "fresh read must not refetch");

                now.set(Instant(Duration::from_secs(1_061)));
                assert_eq!(fetch().await, Ok(5));
                assert_eq!(calls.get(), 2, "stale read must refetch");

                // Refetch ignores the stale time.
                client
                    .refetch_query(key.clone(), counting_fetcher(&calls, Ok(6)), options.clone())
                    .await
                    .expect("refetch");
                assert_eq!(calls.get(), 3);
                assert_eq!(client.get_query_data::<u32>(&key), Some(6));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::default();
                let error = QueryError::Http {
                    status: 503,
                    message: "unavailable".into(),
                };

                let calls = Rc::new(Cell::new(0));
                let result = client
                    .fetch_query(
                        query_key!["retry", 2],
                        counting_fetcher(&calls, Err(error.clone())),
                        options(&client).set_retry(2),
                    )
                    .await;
                assert_eq!(result, Err(error.clone()));
                assert_eq!(calls.get(), 3);

                let calls = Rc::new(Cell::new(0));
                let result = client
                    .fetch_query(
                        query_key!["retry", false],
                        counting_fetcher(&calls, Err(error.clone())),
                        options(&client).set_retry(Retry::Never),
                    )
                    .await;
                assert_eq!(result, Err(error));
                assert_eq!(calls.get(), 1);

                let entry = client
                    .get_query_state::<u32>(&query_key!["retry", false])
                    .expect("entry");
                assert_eq!(entry.status, QueryStatus::Error);
                assert_eq!(entry.retry_count, 0);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_retried() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::default();
                for status in [400, 401, 403, 404] {
                    let calls = Rc::new(Cell::new(0));
                    let error = QueryError::Http {
                        status,
                        message: "rejected".into(),
                    };
                    let result = client
                        .fetch_query(
                            query_key!["status", status],
                            counting_fetcher(&calls, Err(error.clone())),
                            options(&client),
                        )
                        .await;
                    assert_eq!(result, Err(error));
                    assert_eq!(calls.get(), 1, "status {status} must not be retried");
                }
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_silent() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::default();
                let key = query_key!["cancel"];
                let errors = Rc::new(Cell::new(0));
                let calls = Rc::new(Cell::new(0));
                let options = options(&client).on_error({
                    let errors = errors.clone();
                    move |_| errors.set(errors.get() + 1)
                });

                let fetch = client.fetch_query(key.clone(), counting_fetcher(&calls, Ok(1)), options);
                let cancel = async {
                    crate::sleep(Duration::from_millis(10)).await;
                    assert!(client.cancel_query(&key));
                };
                let (result, _) = futures::join!(fetch, cancel);

                assert_eq!(result, Err(QueryError::Cancelled));
                assert_eq!(errors.get(), 0);
                let entry = client.get_query_state::<u32>(&key).expect("entry");
                assert_eq!(entry.status, QueryStatus::Idle);
                assert_eq!(entry.error, None);
                assert!(!entry.is_fetching);
                assert!(!client.cancel_query(&key));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn last_subscriber_leaving_aborts_unawaited_fetch() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::default();
                let key = query_key!["refcount"];
                let calls = Rc::new(Cell::new(0));
                let options = options(&client);

                let unsubscribe = client.cache().subscribe::<u32>(&key, || {});
                client.spawn_fetch(&key, into_fetcher(counting_fetcher(&calls, Ok(1))), &options, FetchMode::Cached);
                assert!(client.get_query_state::<u32>(&key).expect("entry").is_fetching);

                unsubscribe();
                let entry = client.get_query_state::<u32>(&key).expect("entry");
                assert!(!entry.is_fetching);
                assert_eq!(entry.status, QueryStatus::Idle);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn awaiting_caller_keeps_fetch_alive() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::default();
                let key = query_key!["refcount", "awaited"];
                let calls = Rc::new(Cell::new(0));

                let unsubscribe = client.cache().subscribe::<u32>(&key, || {});
                let fetch = client.fetch_query(key.clone(), counting_fetcher(&calls, Ok(3)), options(&client));
                let leave = async {
                    crate::sleep(Duration::from_millis(10)).await;
                    unsubscribe();
                };
                let (result, _) = futures::join!(fetch, leave);

                assert_eq!(result, Ok(3));
                assert_eq!(client.get_query_data::<u32>(&key), Some(3));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn release_respects_other_callers() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::default();
                let key = query_key!["release"];
                let calls = Rc::new(Cell::new(0));

                let fetch = client.fetch_query(key.clone(), counting_fetcher(&calls, Ok(5)), options(&client));
                let release = async {
                    crate::sleep(Duration::from_millis(10)).await;
                    client.release_query(&key)
                };
                let (result, released) = futures::join!(fetch, release);
                assert!(!released);
                assert_eq!(result, Ok(5));

                // Once nobody awaits the request, releasing it aborts.
                client.spawn_fetch(
                    &key,
                    into_fetcher(counting_fetcher(&calls, Ok(6))),
                    &options(&client),
                    FetchMode::Force,
                );
                assert!(client.get_query_state::<u32>(&key).expect("entry").is_fetching);
                assert!(client.release_query(&key));
                let entry = client.get_query_state::<u32>(&key).expect("entry");
                assert!(!entry.is_fetching);
                assert_eq!(entry.data, Some(5));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn unused_entries_are_evicted_after_gc_time() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::default();
                let key = query_key!["gc"];
                let calls = Rc::new(Cell::new(0));
                let options = options(&client).set_gc_time(Some(Duration::from_secs(30)));

                client
                    .prefetch_query(key.clone(), counting_fetcher(&calls, Ok(1)), options)
                    .await;
                assert!(client.cache().contains(&key));

                crate::sleep(Duration::from_secs(29)).await;
                assert!(client.cache().contains(&key));
                crate::sleep(Duration::from_secs(2)).await;
                assert!(!client.cache().contains(&key));
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn success_callback_and_notification() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::default();
                let key = query_key!["notify"];
                let notified = Rc::new(Cell::new(0));
                let succeeded = Rc::new(Cell::new(None));
                let calls = Rc::new(Cell::new(0));

                let _unsubscribe = client.cache().subscribe::<u32>(&key, {
                    let notified = notified.clone();
                    move || notified.set(notified.get() + 1)
                });
                let options = options(&client).on_success({
                    let succeeded = succeeded.clone();
                    move |data| succeeded.set(Some(*data))
                });

                assert_eq!(client.fetch_query(key, counting_fetcher(&calls, Ok(9)), options).await, Ok(9));
                assert_eq!(succeeded.get(), Some(9));
                // Loading, then success.
                assert_eq!(notified.get(), 2);
            })
            .await;
    }

    #[tokio::test]
    async fn invalidation_refetches_active_queries() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::default();
                let key = query_key!["fme", "repositories"];
                let refetched = Rc::new(Cell::new(0));
                client.set_query_data::<u32>(&key, 1);

                let active = client.register_active(ActiveQuery {
                    key: key.clone(),
                    on_window_focus: true,
                    on_reconnect: false,
                    refetch: Rc::new({
                        let refetched = refetched.clone();
                        move || refetched.set(refetched.get() + 1)
                    }),
                });

                assert_eq!(client.invalidate_queries(&query_key!["fme"]), vec![key.clone()]);
                assert_eq!(refetched.get(), 1);

                assert_eq!(client.trigger_refetch(RefetchTrigger::WindowFocus), 1);
                assert_eq!(client.trigger_refetch(RefetchTrigger::Reconnect), 0);
                assert_eq!(refetched.get(), 2);

                client.unregister_active(active);
                assert_eq!(client.trigger_refetch(RefetchTrigger::WindowFocus), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn update_query_data() {
        LocalSet::new()
            .run_until(async {
                let client = QueryClient::default();
                let key = query_key![0];

                client.update_query_data::<String>(&key, |_| None);
                assert_eq!(client.get_query_state::<String>(&key), None);
                assert_eq!(client.size(), 0);

                client.update_query_data::<String>(&key, |_| Some("0".to_string()));
                assert_eq!(client.get_query_data::<String>(&key), Some("0".to_string()));
                assert_eq!(client.size(), 1);

                client.update_query_data::<String>(&key, |current| {
                    current.map(|value| format!("{value}1"))
                });
                assert_eq!(client.get_query_data::<String>(&key), Some("01".to_string()));

                client.clear();
                assert_eq!(client.size(), 0);
            })
            .await;
    }

    #[test]
    fn client_from_context() {
        let runtime = create_runtime();
        provide_query_client();
        let client = use_query_client();
        assert_eq!(client.size(), 0);
        assert_eq!(
            QueryOptions::<u32>::default().stale_time,
            client.default_options().stale_time
        );
        runtime.dispose();
    }
}
