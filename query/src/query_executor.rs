use std::{future::Future, rc::Rc};

use futures::future::{FutureExt, LocalBoxFuture};
use leptos::logging;

use crate::{
    query::{Query, SharedFetch},
    query_cache::WeakQueryCache,
    run_abortable, AbortController, AbortSignal, EntryPatch, QueryCache, QueryError, QueryKey,
    QueryOptions, QueryStatus,
};

/// Type erased fetch function. Receives the abort signal of the execution.
pub(crate) type Fetcher<V> = Rc<dyn Fn(AbortSignal) -> LocalBoxFuture<'static, Result<V, QueryError>>>;

pub(crate) fn into_fetcher<V, Fu>(fetcher: impl Fn(AbortSignal) -> Fu + 'static) -> Fetcher<V>
where
    Fu: Future<Output = Result<V, QueryError>> + 'static,
{
    Rc::new(move |signal| fetcher(signal).boxed_local())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchMode {
    /// Serve fresh cached data without a network call.
    Cached,
    /// Bypass the stale time.
    Force,
}

pub(crate) enum Fetch<V> {
    Cached(V),
    InFlight(SharedFetch<V>),
}

impl<V> Fetch<V>
where
    V: crate::QueryValue + 'static,
{
    pub(crate) async fn resolve(self) -> Result<V, QueryError> {
        match self {
            Fetch::Cached(data) => Ok(data),
            Fetch::InFlight(fetch) => fetch.await,
        }
    }
}

/// Serves `query` from cache, joins its in-flight request, or starts a new one.
pub(crate) fn execute_query<V>(
    cache: &QueryCache,
    query: &Rc<Query<V>>,
    fetcher: Fetcher<V>,
    options: &QueryOptions<V>,
    mode: FetchMode,
) -> Fetch<V>
where
    V: crate::QueryValue + 'static,
{
    query.update_gc_time(options.gc_time);

    if mode == FetchMode::Cached {
        if let Some(data) = query.fresh_data(options.stale_time, cache.now()) {
            return Fetch::Cached(data);
        }
    }

    // At most one request per key: later callers share the first one's future.
    if let Some(in_flight) = query.in_flight() {
        return Fetch::InFlight(in_flight);
    }

    Fetch::InFlight(start_execution(cache, query, fetcher, options))
}

fn start_execution<V>(
    cache: &QueryCache,
    query: &Rc<Query<V>>,
    fetcher: Fetcher<V>,
    options: &QueryOptions<V>,
) -> SharedFetch<V>
where
    V: crate::QueryValue + 'static,
{
    let controller = AbortController::new();
    let signal = controller.signal();

    let future = run_execution(
        cache.downgrade(),
        Rc::downgrade(query),
        query.key.clone(),
        fetcher,
        options.clone(),
        signal,
    )
    .boxed_local()
    .shared();

    query.begin_execution(controller, future.clone());

    let has_data = query.with_state(|state| state.data.is_some());
    let patch = EntryPatch::default().set_fetching(true).set_retry_count(0);
    let patch = if has_data {
        patch
    } else {
        patch.set_status(QueryStatus::Loading)
    };
    query.apply(patch, cache.now());
    cache.notify(&query.key);

    // Drive the request even if every awaiting caller goes away.
    let driver = future.clone();
    crate::spawn_local(async move {
        let _ = driver.await;
    });

    future
}

async fn run_execution<V>(
    cache: WeakQueryCache,
    query: std::rc::Weak<Query<V>>,
    key: QueryKey,
    fetcher: Fetcher<V>,
    options: QueryOptions<V>,
    signal: AbortSignal,
) -> Result<V, QueryError>
where
    V: crate::QueryValue + 'static,
{
    let mut retries = 0;
    let result = loop {
        let error = match run_abortable(&signal, fetcher(signal.clone())).await {
            Ok(Ok(data)) => break Ok(data),
            Ok(Err(error)) => error,
            Err(_) => break Err(QueryError::Cancelled),
        };
        if signal.is_aborted() || error.is_cancelled() {
            break Err(QueryError::Cancelled);
        }
        if !error.is_retryable() || !options.retry.allows(retries) {
            break Err(error);
        }

        let delay = options.retry_delay.delay_for(retries);
        retries += 1;
        logging::debug_warn!(
            "Query {} failed: {}. Retry {} in {}ms",
            key,
            error,
            retries,
            delay.as_millis()
        );
        if let (Some(cache), Some(query)) = (cache.upgrade(), query.upgrade()) {
            if query.is_current(&signal) {
                query.apply(EntryPatch::default().set_retry_count(retries), cache.now());
                cache.notify(&key);
            }
        }

        if run_abortable(&signal, crate::sleep(delay)).await.is_err() {
            break Err(QueryError::Cancelled);
        }
    };

    let (Some(cache), Some(query)) = (cache.upgrade(), query.upgrade()) else {
        return result;
    };
    // A cancelled or superseded execution must not write state.
    let Some(status_before) = query.finish_execution(&signal) else {
        return result;
    };

    match &result {
        Ok(data) => {
            query.apply(EntryPatch::success(data.clone()), cache.now());
            cache.notify(&key);
            if let Some(on_success) = &options.on_success {
                on_success(data);
            }
        }
        Err(error) if error.is_cancelled() => {
            query.restore_after_cancel(status_before);
            cache.notify(&key);
        }
        Err(error) => {
            query.apply(EntryPatch::failure(error.clone()), cache.now());
            cache.notify(&key);
            if let Some(on_error) = &options.on_error {
                on_error(error);
            }
        }
    }

    cache.schedule_gc_if_unused(&key);
    result
}
