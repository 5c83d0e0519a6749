use crate::{QueryError, QueryStatus};
use leptos::*;

/// Reactive query result.
#[derive(Clone)]
pub struct QueryResult<V, R>
where
    V: 'static,
    R: RefetchFn,
{
    /// The last successfully fetched value. None if it has not been fetched yet.
    pub data: Signal<Option<V>>,
    /// The error of the last failed fetch.
    pub error: Signal<Option<QueryError>>,
    /// The current status of the entry.
    pub status: Signal<QueryStatus>,

    /// The first fetch is in flight and nothing is cached yet.
    pub is_loading: Signal<bool>,
    /// A request is in flight, even if stale data is present.
    pub is_fetching: Signal<bool>,
    /// The last fetch succeeded.
    pub is_success: Signal<bool>,
    /// The last fetch failed.
    pub is_error: Signal<bool>,

    /// Refetch the query, ignoring the stale time.
    pub refetch: R,
}

/// Convenience Trait alias for a Query Result's refetch function.
pub trait RefetchFn: Fn() + Clone {}
impl<R: Fn() + Clone> RefetchFn for R {}
