//! Bounded retry helpers for transient backend failures.

use std::future::Future;
use std::time::Duration;

use crate::errors::{CoordError, Result};

/// Default attempt ceiling for transient read failures.
pub const DEFAULT_READ_ATTEMPTS: u32 = 3;

/// Retry ceiling for conditional appends before reporting contention.
pub const DEFAULT_APPEND_RETRIES: u32 = 5;

/// Run `op` up to `attempts` times, sleeping with exponential backoff between
/// failures, as long as the error is transient. Non-transient errors surface
/// immediately.
pub async fn with_backoff<T, F, Fut>(attempts: u32, base_delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < attempts => {
                attempt += 1;
                let delay = base_delay * 2u32.saturating_pow(attempt - 1);
                tracing::debug!(
                    target: "sessionweave::retry",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    code = err.code(),
                    "transient backend error; backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Run a conditional write `op` until it reports success (`Some`) or the
/// bounded retry count is exhausted, at which point `CONTENTION` surfaces.
///
/// `op` returns `Ok(None)` when the conditional check lost the race and the
/// write should be retried.
pub async fn conditional_append<T, F, Fut>(
    session_id: &str,
    retries: u32,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    for _ in 0..retries.max(1) {
        match op().await? {
            Some(value) => return Ok(value),
            None => tokio::task::yield_now().await,
        }
    }
    Err(CoordError::Contention {
        session_id: session_id.to_string(),
        retries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn backoff_recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let result = with_backoff(3, Duration::from_millis(1), move || {
            let calls = Arc::clone(&calls2);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CoordError::backend("flaky"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_gives_up_after_attempts() {
        let result: Result<()> = with_backoff(3, Duration::from_millis(1), || async {
            Err(CoordError::backend("always down"))
        })
        .await;
        assert_eq!(result.unwrap_err().code(), "BACKEND_UNAVAILABLE");
    }

    #[tokio::test]
    async fn non_transient_errors_surface_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let result: Result<()> = with_backoff(3, Duration::from_millis(1), move || {
            let calls = Arc::clone(&calls2);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CoordError::ShuttingDown)
            }
        })
        .await;
        assert_eq!(result.unwrap_err().code(), "SHUTTING_DOWN");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn conditional_append_reports_contention() {
        let result: Result<u64> =
            conditional_append("s1", 5, || async { Ok(None) }).await;
        let err = result.unwrap_err();
        assert_eq!(err.code(), "CONTENTION");
    }

    #[tokio::test]
    async fn conditional_append_returns_winning_write() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let result = conditional_append("s1", 5, move || {
            let calls = Arc::clone(&calls2);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(None)
                } else {
                    Ok(Some(7u64))
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }
}
