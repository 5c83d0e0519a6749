use std::{future::Future, pin::pin, time::Duration};

use futures::future::Either;

use crate::{Instant, QueryError};

pub(crate) fn time_until_stale(updated_at: Instant, stale_time: Duration, now: Instant) -> Duration {
    let updated_at = updated_at.0.as_millis() as i64;
    let now = now.0.as_millis() as i64;
    let stale_time = stale_time.as_millis() as i64;
    let result = (updated_at + stale_time) - now;
    let ensure_non_negative = result.max(0);
    Duration::from_millis(ensure_non_negative as u64)
}

/// Suspends for `duration`.
///
/// Uses browser timers on wasm and tokio timers elsewhere.
pub async fn sleep(duration: Duration) {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "wasm32")] {
            gloo_timers::future::sleep(duration).await;
        } else {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Spawns a task on the current thread.
///
/// On native targets this must be called from within a `tokio::task::LocalSet`.
pub fn spawn_local(fut: impl Future<Output = ()> + 'static) {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "wasm32")] {
            leptos::spawn_local(fut);
        } else {
            tokio::task::spawn_local(fut);
        }
    }
}

/// Watchdog for requests that may never settle.
///
/// Resolves to [`QueryError::Timeout`] when `fut` is still pending after `timeout`.
pub async fn with_timeout<F>(timeout: Duration, fut: F) -> Result<F::Output, QueryError>
where
    F: Future,
{
    let fut = pin!(fut);
    let expiry = pin!(sleep(timeout));
    match futures::future::select(fut, expiry).await {
        Either::Left((output, _)) => Ok(output),
        Either::Right(_) => Err(QueryError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_countdown_never_negative() {
        let updated_at = Instant(Duration::from_secs(100));
        let now = Instant(Duration::from_secs(130));
        assert_eq!(
            time_until_stale(updated_at, Duration::from_secs(60), now),
            Duration::from_secs(30)
        );
        assert_eq!(
            time_until_stale(updated_at, Duration::from_secs(10), now),
            Duration::ZERO
        );
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_expires() {
        let never = futures::future::pending::<u8>();
        let result = with_timeout(Duration::from_secs(5), never).await;
        assert_eq!(result, Err(QueryError::Timeout(Duration::from_secs(5))));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_passes_result_through() {
        let result = with_timeout(Duration::from_secs(5), async { 3 }).await;
        assert_eq!(result, Ok(3));
    }
}
