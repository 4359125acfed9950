//! Bounded exponential backoff for transient fetch failures.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;

/// Retry policy for upstream requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = fail fast).
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Execute an async operation with exponential backoff retry on transient errors.
///
/// Retries on `FetchError::RateLimited` (respects `retry_after_secs`), timeouts,
/// connection failures and 5xx statuses. Permanent errors return immediately,
/// and cancellation interrupts any pending backoff sleep.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T, FetchError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !e.is_transient() || attempt >= config.max_retries {
                    return Err(e);
                }

                let backoff_ms = compute_backoff(config, attempt, &e);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    backoff_ms = backoff_ms,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                }
                attempt += 1;
            }
        }
    }
}

/// Compute backoff delay, respecting rate limit retry-after hints.
fn compute_backoff(config: &RetryConfig, attempt: u32, err: &FetchError) -> u64 {
    if let FetchError::RateLimited {
        retry_after_secs, ..
    } = err
    {
        let server_ms = retry_after_secs.saturating_mul(1000);
        let computed = compute_exponential_backoff(config, attempt);
        return server_ms.max(computed);
    }
    compute_exponential_backoff(config, attempt)
}

/// Pure exponential backoff with optional jitter.
fn compute_exponential_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(config.max_backoff_ms as f64) as u64;
    if config.jitter && capped > 0 {
        let jitter = rand::thread_rng().gen_range(0..=capped / 4);
        capped + jitter
    } else {
        capped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn timeout() -> FetchError {
        FetchError::Timeout {
            url: "https://x".into(),
            timeout_secs: 1,
        }
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let config = fast();
        assert_eq!(compute_exponential_backoff(&config, 0), 10);
        assert_eq!(compute_exponential_backoff(&config, 1), 20);
        assert_eq!(compute_exponential_backoff(&config, 2), 40);
        assert_eq!(compute_exponential_backoff(&config, 5), 50);
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let config = RetryConfig {
            jitter: true,
            ..fast()
        };
        for _ in 0..50 {
            let d = compute_exponential_backoff(&config, 1);
            assert!((20..=25).contains(&d), "got {d}");
        }
    }

    #[test]
    fn test_rate_limit_respects_server_hint() {
        let err = FetchError::RateLimited {
            url: "u".into(),
            retry_after_secs: 2,
        };
        assert_eq!(compute_backoff(&fast(), 0, &err), 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let cancel = CancellationToken::new();
        let result = with_retry(&fast(), &cancel, || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(timeout())
            } else {
                Ok("done")
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let cancel = CancellationToken::new();
        let result: Result<(), _> = with_retry(&fast(), &cancel, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(timeout())
        })
        .await;
        assert!(matches!(result, Err(FetchError::Timeout { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let cancel = CancellationToken::new();
        let result: Result<(), _> = with_retry(&fast(), &cancel, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::Status {
                url: "u".into(),
                status: 404,
                body: String::new(),
            })
        })
        .await;
        assert!(matches!(result, Err(FetchError::Status { status: 404, .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = with_retry(&fast(), &cancel, || async { Ok(()) }).await;
        assert!(matches!(result, Err(FetchError::Cancelled)));
    }
}
