//! Bounded exponential backoff for retryable adapter errors.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::exchanges::AdapterResult;
use crate::types::RetryPolicy;

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
/// capped at `max_delay`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    policy
        .base_delay
        .saturating_mul(factor)
        .min(policy.max_delay)
}

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` calls have been made.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, op_name: &str, mut op: F) -> AdapterResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AdapterResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.kind.is_retryable() && attempt < max_attempts => {
                let delay = backoff_delay(policy, attempt);
                warn!(
                    op = op_name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying adapter call"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
