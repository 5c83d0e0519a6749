use std::{rc::Rc, time::Duration};

use crate::QueryError;

/// Default options for all queries under this client.
#[derive(Debug, Clone)]
pub struct DefaultQueryOptions {
    /// Time before a query is considered stale.
    pub stale_time: Option<Duration>,
    /// Time before an entry without subscribers is removed from cache.
    pub gc_time: Option<Duration>,
    /// Retry policy for failed fetches.
    pub retry: Retry,
    /// Delay between retries.
    pub retry_delay: RetryDelay,
}

impl Default for DefaultQueryOptions {
    fn default() -> Self {
        Self {
            stale_time: Some(DEFAULT_STALE_TIME),
            gc_time: Some(DEFAULT_GC_TIME),
            retry: Retry::default(),
            retry_delay: RetryDelay::default(),
        }
    }
}

const DEFAULT_STALE_TIME: Duration = Duration::from_secs(60 * 5);
const DEFAULT_GC_TIME: Duration = Duration::from_secs(60 * 10);
const DEFAULT_RETRY: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// How many times a failed fetch is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// A single attempt is made.
    Never,
    /// Up to this many retries after the first attempt.
    Count(u32),
}

impl Retry {
    /// Returns true if another attempt is allowed after `retries_done` retries.
    pub fn allows(&self, retries_done: u32) -> bool {
        match self {
            Retry::Never => false,
            Retry::Count(max) => retries_done < *max,
        }
    }
}

impl Default for Retry {
    fn default() -> Self {
        Retry::Count(DEFAULT_RETRY)
    }
}

impl From<u32> for Retry {
    fn from(count: u32) -> Self {
        Retry::Count(count)
    }
}

impl From<bool> for Retry {
    fn from(retry: bool) -> Self {
        if retry {
            Retry::default()
        } else {
            Retry::Never
        }
    }
}

/// Delay before a retry, given the number of retries already performed.
#[derive(Clone)]
pub enum RetryDelay {
    /// Same delay before every retry.
    Fixed(Duration),
    /// Delay computed from the retry index.
    Backoff(Rc<dyn Fn(u32) -> Duration>),
}

impl RetryDelay {
    /// Exponential backoff: 1s, 2s, 4s, ... capped at 30s.
    pub fn exponential() -> Self {
        RetryDelay::Backoff(Rc::new(|attempt| {
            let factor = 2u32.saturating_pow(attempt.min(16));
            BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_MAX)
        }))
    }

    /// Delay before retry number `attempt` (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            RetryDelay::Fixed(delay) => *delay,
            RetryDelay::Backoff(backoff) => backoff(attempt),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        RetryDelay::exponential()
    }
}

impl std::fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryDelay::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            RetryDelay::Backoff(_) => f.debug_tuple("Backoff").field(&"..").finish(),
        }
    }
}

/**
 * Options for a query [`fetch_query()`](crate::QueryClient::fetch_query) or [`use_fme_query()`](crate::use_fme_query())
 */
#[derive(Clone)]
pub struct QueryOptions<V> {
    /// If false, mounting a query never triggers a fetch.
    pub enabled: bool,
    /// The duration that should pass before a query is considered stale.
    /// Reads within this window are served from cache without a network call.
    /// If no stale_time, successful data never goes stale.
    /// Stale_time can never be greater than gc_time.
    /// Default is 5 minutes.
    pub stale_time: Option<Duration>,
    /// The amount of time an entry without subscribers stays cached.
    /// If no gc time, the entry is never evicted.
    /// NOTE: If different gc times are used for the same key, the MAXIMUM time will be used.
    /// Default is 10 minutes.
    pub gc_time: Option<Duration>,
    /// Retry policy. Default is 3 retries.
    pub retry: Retry,
    /// Delay between retries. Default is exponential backoff.
    pub retry_delay: RetryDelay,
    /// Refetch mounted queries when the window regains focus.
    pub refetch_on_window_focus: bool,
    /// Refetch mounted queries when the network reconnects.
    pub refetch_on_reconnect: bool,
    /// Invoked with the data of every successful fetch.
    pub on_success: Option<Rc<dyn Fn(&V)>>,
    /// Invoked with the terminal error of a failed fetch. Never invoked for cancellation.
    pub on_error: Option<Rc<dyn Fn(&QueryError)>>,
}

impl<V> QueryOptions<V> {
    /// Options built from the given client-wide defaults.
    pub fn from_defaults(defaults: &DefaultQueryOptions) -> Self {
        Self {
            enabled: true,
            stale_time: defaults.stale_time,
            gc_time: defaults.gc_time,
            retry: defaults.retry,
            retry_delay: defaults.retry_delay.clone(),
            refetch_on_window_focus: false,
            refetch_on_reconnect: false,
            on_success: None,
            on_error: None,
        }
        .validate()
    }

    /// Set whether the query may fetch.
    pub fn set_enabled(self, enabled: bool) -> Self {
        QueryOptions { enabled, ..self }
    }

    /// Set the stale_time.
    pub fn set_stale_time(self, stale_time: Option<Duration>) -> Self {
        QueryOptions { stale_time, ..self }
    }

    /// Set the gc time.
    pub fn set_gc_time(self, gc_time: Option<Duration>) -> Self {
        QueryOptions { gc_time, ..self }
    }

    /// Set the retry policy.
    pub fn set_retry(self, retry: impl Into<Retry>) -> Self {
        QueryOptions {
            retry: retry.into(),
            ..self
        }
    }

    /// Set the retry delay.
    pub fn set_retry_delay(self, retry_delay: RetryDelay) -> Self {
        QueryOptions {
            retry_delay,
            ..self
        }
    }

    /// Set refetching on window focus.
    pub fn set_refetch_on_window_focus(self, refetch_on_window_focus: bool) -> Self {
        QueryOptions {
            refetch_on_window_focus,
            ..self
        }
    }

    /// Set refetching on network reconnect.
    pub fn set_refetch_on_reconnect(self, refetch_on_reconnect: bool) -> Self {
        QueryOptions {
            refetch_on_reconnect,
            ..self
        }
    }

    /// Set the success callback.
    pub fn on_success(self, callback: impl Fn(&V) + 'static) -> Self {
        QueryOptions {
            on_success: Some(Rc::new(callback)),
            ..self
        }
    }

    /// Set the error callback.
    pub fn on_error(self, callback: impl Fn(&QueryError) + 'static) -> Self {
        QueryOptions {
            on_error: Some(Rc::new(callback)),
            ..self
        }
    }

    /// Ensures that gc_time is >= than stale_time.
    pub fn validate(self) -> Self {
        let stale_time = ensure_valid_stale_time(&self.stale_time, &self.gc_time);
        QueryOptions { stale_time, ..self }
    }
}

impl<V> Default for QueryOptions<V> {
    fn default() -> Self {
        // Use client wide defaults if they exist.
        let default_options = leptos::use_context::<crate::QueryClient>()
            .map(|c| c.default_options.clone())
            .unwrap_or_default();
        Self::from_defaults(&default_options)
    }
}

impl<V> std::fmt::Debug for QueryOptions<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("enabled", &self.enabled)
            .field("stale_time", &self.stale_time)
            .field("gc_time", &self.gc_time)
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("refetch_on_window_focus", &self.refetch_on_window_focus)
            .field("refetch_on_reconnect", &self.refetch_on_reconnect)
            .finish()
    }
}

fn ensure_valid_stale_time(
    stale_time: &Option<Duration>,
    gc_time: &Option<Duration>,
) -> Option<Duration> {
    match (stale_time, gc_time) {
        (Some(ref stale_time), Some(ref gc_time)) => {
            if stale_time > gc_time {
                leptos::logging::debug_warn!(
                    "stale_time is greater than gc_time. Using gc time instead. stale_time: {}, gc_time: {}",
                    stale_time.as_millis(),
                    gc_time.as_millis()
                );
                Some(*gc_time)
            } else {
                Some(*stale_time)
            }
        }
        (None, Some(ref gc_duration)) => {
            leptos::logging::debug_warn!(
                "stale_time (infinity) is greater than gc_time. Using gc_time instead. gc_time: {}",
                gc_duration.as_millis()
            );
            Some(*gc_duration)
        }
        (stale_time, _) => *stale_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(stale_time: Option<Duration>, gc_time: Option<Duration>) -> QueryOptions<i32> {
        QueryOptions::from_defaults(&DefaultQueryOptions::default())
            .set_stale_time(stale_time)
            .set_gc_time(gc_time)
    }

    #[test]
    fn defaults() {
        let options = QueryOptions::<i32>::from_defaults(&DefaultQueryOptions::default());
        assert!(options.enabled);
        assert_eq!(options.stale_time, Some(Duration::from_secs(300)));
        assert_eq!(options.gc_time, Some(Duration::from_secs(600)));
        assert_eq!(options.retry, Retry::Count(3));
        assert!(!options.refetch_on_window_focus);
        assert!(!options.refetch_on_reconnect);
    }

    #[test]
    fn validate_stale_time_less_than_gc_time() {
        let options =
            options(Some(Duration::from_secs(5)), Some(Duration::from_secs(10))).validate();

        assert_eq!(
            options.stale_time,
            Some(Duration::from_secs(5)),
            "Stale_time should remain unchanged"
        );
        assert_eq!(
            options.gc_time,
            Some(Duration::from_secs(10)),
            "GC time should remain unchanged"
        );
    }

    #[test]
    fn validate_stale_time_greater_than_gc_time() {
        let options =
            options(Some(Duration::from_secs(15)), Some(Duration::from_secs(10))).validate();

        assert_eq!(
            options.stale_time,
            Some(Duration::from_secs(10)),
            "Stale_time should be adjusted to GC time"
        );
    }

    #[test]
    fn validate_gc_time_without_stale_time() {
        let options = options(None, Some(Duration::from_secs(10))).validate();
        assert_eq!(
            options.stale_time,
            Some(Duration::from_secs(10)),
            "Stale_time should become gc_time"
        );
    }

    #[test]
    fn validate_none_stale_and_gc_time() {
        let options = options(None, None).validate();
        assert_eq!(options.stale_time, None, "Stale_time should remain None");
        assert_eq!(options.gc_time, None, "GC time should remain None");
    }

    #[test]
    fn retry_policy() {
        assert!(!Retry::Never.allows(0));
        assert!(Retry::Count(2).allows(0));
        assert!(Retry::Count(2).allows(1));
        assert!(!Retry::Count(2).allows(2));
        assert_eq!(Retry::from(false), Retry::Never);
        assert_eq!(Retry::from(5), Retry::Count(5));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let delay = RetryDelay::exponential();
        assert_eq!(delay.delay_for(0), Duration::from_secs(1));
        assert_eq!(delay.delay_for(1), Duration::from_secs(2));
        assert_eq!(delay.delay_for(3), Duration::from_secs(8));
        assert_eq!(delay.delay_for(10), Duration::from_secs(30));
        assert_eq!(delay.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn fixed_delay() {
        let delay = RetryDelay::Fixed(Duration::from_millis(250));
        assert_eq!(delay.delay_for(0), Duration::from_millis(250));
        assert_eq!(delay.delay_for(7), Duration::from_millis(250));
    }
}
