use crate::query_client::{ActiveQuery, ActiveQueryKey};
use crate::query_executor::{into_fetcher, FetchMode};
use crate::query_result::QueryResult;
use crate::{
    use_query_client, AbortSignal, CacheEntry, QueryError, QueryKey, QueryOptions, QueryStatus,
    RefetchFn,
};
use leptos::*;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

/// Creates a query. Useful for data fetching, caching, and synchronization with server state.
///
/// A Query provides:
/// - Caching
/// - De-duplication
/// - Invalidation
/// - Background refetching
/// - Memory management with cache lifetimes
///
/// Mounting subscribes to the entry for the current key and fetches only if the query is enabled
/// and nothing fresh is cached. A key change moves the subscription to the new entry.
/// Unmounting unsubscribes, which aborts the request only if nobody else needs it.
///
/// Example
/// ```
/// use fme_query::*;
///
/// fn use_repository_names(repository: impl Fn() -> String + 'static) -> QueryResult<Vec<String>, impl RefetchFn> {
///     use_fme_query(
///         move || query_key!["fme", "items", repository()],
///         |_signal: AbortSignal| async move { Ok::<_, QueryError>(vec!["export.fmw".to_string()]) },
///         QueryOptions::default(),
///     )
/// }
/// ```
pub fn use_fme_query<V, Fu>(
    key: impl Fn() -> QueryKey + 'static,
    fetcher: impl Fn(AbortSignal) -> Fu + 'static,
    options: QueryOptions<V>,
) -> QueryResult<V, impl RefetchFn>
where
    V: crate::QueryValue + 'static,
    Fu: Future<Output = Result<V, QueryError>> + 'static,
{
    let client = use_query_client();
    let options = options.validate();
    let fetcher = into_fetcher(fetcher);
    let key = create_memo(move |_| key());

    let state = create_rw_signal(CacheEntry::<V>::default());
    let subscription: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));

    let refetch = {
        let client = client.clone();
        let fetcher = fetcher.clone();
        let options = options.clone();
        move || {
            let key = key.get_untracked();
            client.spawn_fetch(&key, fetcher.clone(), &options, FetchMode::Force);
        }
    };

    create_isomorphic_effect({
        let client = client.clone();
        let subscription = subscription.clone();
        move |_| {
            let key = key.get();

            // Leave the previous entry before joining the new one.
            if let Some(previous) = subscription.take() {
                previous.release(&client);
            }

            let unsubscribe = client.cache.subscribe::<V>(&key, {
                let cache = client.cache.clone();
                let key = key.clone();
                move || {
                    if let Some(entry) = cache.get::<V>(&key) {
                        state.set(entry);
                    }
                }
            });

            let active = client.register_active(ActiveQuery {
                key: key.clone(),
                on_window_focus: options.refetch_on_window_focus,
                on_reconnect: options.refetch_on_reconnect,
                refetch: Rc::new({
                    let client = client.clone();
                    let fetcher = fetcher.clone();
                    let options = options.clone();
                    let key = key.clone();
                    move || {
                        if options.enabled {
                            client.spawn_fetch(&key, fetcher.clone(), &options, FetchMode::Cached);
                        }
                    }
                }),
            });

            subscription.replace(Some(Subscription {
                unsubscribe: Box::new(unsubscribe),
                active,
            }));

            if let Some(entry) = client.cache.get::<V>(&key) {
                state.set(entry);
            }

            if options.enabled {
                client.spawn_fetch(&key, fetcher.clone(), &options, FetchMode::Cached);
            }
        }
    });

    on_cleanup({
        let client = client.clone();
        move || {
            if let Some(subscription) = subscription.take() {
                subscription.release(&client);
            }
        }
    });

    QueryResult {
        data: Signal::derive(move || state.with(|state| state.data.clone())),
        error: Signal::derive(move || state.with(|state| state.error.clone())),
        status: Signal::derive(move || state.with(|state| state.status)),
        is_loading: Signal::derive(move || {
            state.with(|state| state.status == QueryStatus::Loading && state.data.is_none())
        }),
        is_fetching: Signal::derive(move || state.with(|state| state.is_fetching)),
        is_success: Signal::derive(move || state.with(|state| state.status == QueryStatus::Success)),
        is_error: Signal::derive(move || state.with(|state| state.status == QueryStatus::Error)),
        refetch,
    }
}

struct Subscription {
    unsubscribe: Box<dyn FnOnce()>,
    active: ActiveQueryKey,
}

impl Subscription {
    fn release(self, client: &crate::QueryClient) {
        client.unregister_active(self.active);
        (self.unsubscribe)();
    }
}
