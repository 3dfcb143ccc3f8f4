use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Exponential backoff settings for one labelled operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Name used in progress notices and in the final error.
    pub label: String,
}

impl RetryPolicy {
    /// Delay before retry `attempt` (0-indexed): `min(initial * 2^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.initial_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// The last failure of an operation that ran out of retries.
#[derive(Debug, Error)]
#[error("{label} failed after {attempts} attempt(s): {source}")]
pub struct RetryError<E>
where
    E: std::error::Error + 'static,
{
    pub label: String,
    pub attempts: u32,
    #[source]
    pub source: E,
}

/// Run `operation` until it succeeds or the policy's retries are used up.
///
/// Every failure is retried; callers reject non-transient inputs before
/// handing the operation over.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: RetryPolicy,
    mut operation: F,
) -> std::result::Result<T, RetryError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation = %policy.label,
                    attempt = attempt + 1,
                    remaining = policy.max_retries - attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    operation = %policy.label,
                    attempts = attempt + 1,
                    error = %e,
                    "Operation failed, no retries left"
                );
                return Err(RetryError {
                    label: policy.label,
                    attempts: attempt + 1,
                    source: e,
                });
            }
        }
    }
}
