//! Caller-side bounded retry.
//
// Device links never retry internally; the unit aggregate wraps scalar reads
// (transducers, depth gauges) in a sequential retry so that a single dropped
// reply does not surface as a failure.

use crate::error::AppResult;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Policy that performs exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: Duration::ZERO,
        }
    }
}

/// Runs `op` until it succeeds, a non-retryable error occurs, or the policy is
/// exhausted.
///
/// Attempts are strictly sequential: the next attempt is only created after
/// the previous future has completed, so a physical link never sees two
/// concurrent queries from the same retry loop.
pub async fn retry_sequential<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && err.is_retryable() => {
                warn!(
                    target: "ieb::retry",
                    label,
                    attempt,
                    max_attempts = attempts,
                    error = %err,
                    "attempt failed, retrying"
                );
                attempt += 1;
                if !policy.backoff_delay.is_zero() {
                    sleep(policy.backoff_delay).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
}
