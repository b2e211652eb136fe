//! Exponential backoff for transient provider failures.
//!
//! Whether an error is worth retrying is read off the error value itself;
//! this module only supplies the schedule. Throttling
//! (`too_many_requests`) is deliberately not retried in-line: waiting out
//! a provider's extended throttle window inside a live request would burn
//! the caller's deadline, so the error surfaces immediately and failover
//! or the next health-check cycle deals with it.

use crate::error::{ErrorKind, QLensError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Schedule for OpenAI-shaped HTTP providers.
    pub fn http(max_attempts: u32) -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Schedule for Bedrock. Slower base: the service throttles harder.
    pub fn bedrock(max_attempts: u32) -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_attempts: max_attempts.max(1),
        }
    }
}

fn should_retry(error: &QLensError) -> bool {
    error.retryable && error.kind != ErrorKind::TooManyRequests
}

/// Run `operation` under the retry schedule. The closure receives the
/// 1-based attempt number.
pub async fn with_backoff<T, F, Fut>(policy: RetryPolicy, mut operation: F) -> Result<T, QLensError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, QLensError>>,
{
    let mut delay = policy.base_delay;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < policy.max_attempts && should_retry(&error) => {
                let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 10);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    kind = %error.kind,
                    "transient provider failure, backing off"
                );
                tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                delay *= 2;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(RetryPolicy::http(3), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(QLensError::provider_error("azure-openai", "upstream 503"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(RetryPolicy::http(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(QLensError::validation("model", "bad request")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn throttling_short_circuits() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(RetryPolicy::bedrock(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(QLensError::too_many_requests("throttled")) }
        })
        .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::TooManyRequests);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_attempts_surfaces_the_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(RetryPolicy::http(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(QLensError::service_unavailable("still down")) }
        })
        .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::ServiceUnavailable);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
