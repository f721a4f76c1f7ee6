//! Item-level retry with exponential backoff.
//!
//! HTTP-level retries are handled by `reqwest-retry` inside the clients; this
//! layer retries whole capability calls (a classification batch, a citation
//! lookup) so that an item is only marked unresolved after a bounded number of
//! transient failures.

use std::future::Future;
use std::time::Duration;

use crate::error::ServiceResult;

/// Exponential backoff policy for [`crate::error::ServiceError::Transient`] failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub base_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Create a retry policy.
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self { max_attempts, base_delay, max_delay }
    }

    /// Retries without sleeping (tests, mock servers).
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Single attempt, no retry.
    #[must_use]
    pub const fn none() -> Self {
        Self::immediate(1)
    }

    /// Delay after the given failed attempt (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(4, Duration::from_secs(2), Duration::from_secs(60))
    }
}

/// Run `op` until it succeeds, fails non-transiently, or attempts run out.
///
/// A server-provided `retry_after` replaces the computed delay (still capped
/// by `max_delay`).
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> ServiceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServiceResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                let delay = err
                    .retry_after()
                    .map_or_else(|| policy.delay_for(attempt), |d| d.min(policy.max_delay));
                tracing::debug!(
                    operation = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_transient() {
                    tracing::warn!(operation = what, attempts, error = %err, "Retries exhausted");
                }
                return Err(err);
            }
        }
    }
}
