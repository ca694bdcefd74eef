//! Retry-with-backoff shared by the length probe, range opening and chunk
//! reconnects.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{DownloadError, Result};

pub const DEFAULT_RETRY_COUNT: u32 = 5;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounds for one retryable operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub count: u32,
    /// Fixed pause between attempts.
    pub interval: Duration,
    /// Limit for each individual network wait (headers, one body read).
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            count: DEFAULT_RETRY_COUNT,
            interval: DEFAULT_RETRY_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    pub fn new(count: u32, interval: Duration, timeout: Duration) -> Self {
        Self {
            count,
            interval,
            timeout,
        }
    }

    pub fn no_retry(timeout: Duration) -> Self {
        Self {
            count: 0,
            interval: Duration::ZERO,
            timeout,
        }
    }
}

/// Run `fut` with the policy's per-operation timeout.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(DownloadError::Timeout(limit)),
    }
}

/// Run `fut` unless `cancel` fires first.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DownloadError::Cancelled),
        res = fut => res,
    }
}

/// Repeats `op` on transient failures, pausing `policy.interval` between
/// attempts.
///
/// `state` is handed to every attempt so that progress made by a failed
/// attempt (e.g. an advanced range start) is visible to the next one.
/// Permanent errors and cancellation are returned immediately; running out of
/// retries wraps the last transient error in [`DownloadError::RetriesExhausted`].
pub async fn retry_with_backoff<S, T, F>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    state: &mut S,
    mut op: F,
) -> Result<T>
where
    F: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let err = match cancellable(cancel, op(state)).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_transient() {
            return Err(err);
        }
        if attempt > policy.count {
            return Err(DownloadError::RetriesExhausted {
                operation: operation.to_string(),
                attempts: attempt,
                last: Box::new(err),
            });
        }

        warn!(
            operation,
            attempt,
            max = policy.count + 1,
            error = %err,
            "transient failure, retrying in {:?}",
            policy.interval
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn fast_policy(count: u32) -> RetryPolicy {
        RetryPolicy::new(count, Duration::from_millis(1), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let cancel = CancellationToken::new();
        let mut calls = 0u32;
        let res = retry_with_backoff(&fast_policy(3), &cancel, "test", &mut calls, |calls| {
            async move {
                *calls += 1;
                if *calls < 3 {
                    Err(DownloadError::Timeout(Duration::from_millis(5)))
                } else {
                    Ok(*calls)
                }
            }
            .boxed()
        })
        .await;
        assert_eq!(res.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let cancel = CancellationToken::new();
        let mut calls = 0u32;
        let res: Result<()> = retry_with_backoff(&fast_policy(5), &cancel, "test", &mut calls, |calls| {
            async move {
                *calls += 1;
                Err(DownloadError::RemoteRequest {
                    status: 403,
                    url: "http://example.com".into(),
                })
            }
            .boxed()
        })
        .await;
        assert_eq!(res.unwrap_err().status(), Some(403));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_exhausts_budget() {
        let cancel = CancellationToken::new();
        let mut calls = 0u32;
        let res: Result<()> = retry_with_backoff(&fast_policy(2), &cancel, "probe", &mut calls, |calls| {
            async move {
                *calls += 1;
                Err(DownloadError::PrematureEof { expected: 2, received: 1 })
            }
            .boxed()
        })
        .await;
        match res {
            Err(DownloadError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_cancellation_short_circuits_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(10, Duration::from_secs(60), Duration::from_secs(1));
        let trigger = cancel.clone();
        let mut calls = 0u32;
        let res: Result<()> = retry_with_backoff(&policy, &cancel, "test", &mut calls, |calls| {
            let trigger = trigger.clone();
            async move {
                *calls += 1;
                trigger.cancel();
                Err(DownloadError::Timeout(Duration::from_millis(1)))
            }
            .boxed()
        })
        .await;
        assert!(res.unwrap_err().is_cancelled());
        assert_eq!(calls, 1);
    }
}
