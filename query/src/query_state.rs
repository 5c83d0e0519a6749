use crate::{Instant, QueryError};

/// Status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum QueryStatus {
    /// No fetch has produced a result yet.
    #[default]
    Idle,
    /// The first fetch is in flight and no data is cached.
    Loading,
    /// The last fetch succeeded.
    Success,
    /// The last fetch failed after exhausting its retries.
    Error,
}

impl QueryStatus {
    /// Lowercase name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Idle => "idle",
            QueryStatus::Loading => "loading",
            QueryStatus::Success => "success",
            QueryStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the cached state for one key.
#[derive(Clone, PartialEq)]
pub struct CacheEntry<V> {
    /// Last successfully fetched data. Kept while refetching and after a failed refetch.
    pub data: Option<V>,
    /// Error of the last failed fetch.
    pub error: Option<QueryError>,
    /// Current status.
    pub status: QueryStatus,
    /// When `data` was last stored with a success status.
    pub updated_at: Option<Instant>,
    /// Number of retries performed by the current or last fetch.
    pub retry_count: u32,
    /// A request for this key is in flight.
    pub is_fetching: bool,
}

impl<V> Default for CacheEntry<V> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            status: QueryStatus::Idle,
            updated_at: None,
            retry_count: 0,
            is_fetching: false,
        }
    }
}

impl<V> CacheEntry<V> {
    /// Returns true if the entry holds data younger than `stale_time` at `now`.
    pub fn is_fresh(&self, stale_time: Option<std::time::Duration>, now: Instant) -> bool {
        match (self.status, self.updated_at, stale_time) {
            (QueryStatus::Success, Some(updated_at), Some(stale_time)) => {
                !crate::util::time_until_stale(updated_at, stale_time, now).is_zero()
            }
            // No stale time means success data never goes stale.
            (QueryStatus::Success, Some(_), None) => true,
            _ => false,
        }
    }

    pub(crate) fn apply(&mut self, patch: EntryPatch<V>, now: Instant) {
        if let Some(data) = patch.data {
            self.data = data;
        }
        if let Some(error) = patch.error {
            self.error = error;
        }
        if let Some(retry_count) = patch.retry_count {
            self.retry_count = retry_count;
        }
        if let Some(is_fetching) = patch.is_fetching {
            self.is_fetching = is_fetching;
        }
        if let Some(status) = patch.status {
            self.status = status;
            if status == QueryStatus::Success {
                self.updated_at = Some(now);
            }
        }
    }
}

impl<V> std::fmt::Debug for CacheEntry<V>
where
    V: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("data", &self.data)
            .field("error", &self.error)
            .field("status", &self.status)
            .field("updated_at", &self.updated_at)
            .field("retry_count", &self.retry_count)
            .field("is_fetching", &self.is_fetching)
            .finish()
    }
}

/// Partial update merged into a [`CacheEntry`] by [`QueryCache::set`](crate::QueryCache::set).
///
/// `None` leaves the field untouched.
pub struct EntryPatch<V> {
    /// Replacement data.
    pub data: Option<Option<V>>,
    /// Replacement error.
    pub error: Option<Option<QueryError>>,
    /// New status. `Success` also stamps the update time.
    pub status: Option<QueryStatus>,
    /// New retry count.
    pub retry_count: Option<u32>,
    /// New in-flight flag.
    pub is_fetching: Option<bool>,
}

impl<V> Default for EntryPatch<V> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            status: None,
            retry_count: None,
            is_fetching: None,
        }
    }
}

impl<V> EntryPatch<V> {
    /// Patch storing `data` as a fresh success.
    pub fn success(data: V) -> Self {
        Self {
            data: Some(Some(data)),
            error: Some(None),
            status: Some(QueryStatus::Success),
            retry_count: Some(0),
            is_fetching: Some(false),
        }
    }

    /// Patch storing a terminal failure. Previously fetched data is kept.
    pub fn failure(error: QueryError) -> Self {
        Self {
            error: Some(Some(error)),
            status: Some(QueryStatus::Error),
            is_fetching: Some(false),
            ..Self::default()
        }
    }

    /// Set the status.
    pub fn set_status(self, status: QueryStatus) -> Self {
        Self {
            status: Some(status),
            ..self
        }
    }

    /// Set the retry count.
    pub fn set_retry_count(self, retry_count: u32) -> Self {
        Self {
            retry_count: Some(retry_count),
            ..self
        }
    }

    /// Set the in-flight flag.
    pub fn set_fetching(self, is_fetching: bool) -> Self {
        Self {
            is_fetching: Some(is_fetching),
            ..self
        }
    }
}
