//! Per-service concurrency and rate ceilings.
//!
//! Search sources, the classifier and the full-text resolver each have an
//! independent ceiling, so each gets its own [`Throttle`].

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ServiceLimits;
use crate::error::{ServiceError, ServiceResult};

/// Bounded concurrency plus an optional requests-per-second quota.
#[derive(Clone)]
pub struct Throttle {
    name: &'static str,
    max_concurrent: usize,
    permits: Arc<Semaphore>,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
}

impl Throttle {
    /// Create a throttle for the named service.
    #[must_use]
    pub fn new(name: &'static str, limits: ServiceLimits) -> Self {
        let max_concurrent = limits.max_concurrent.max(1);
        let limiter = limits
            .per_second
            .and_then(NonZeroU32::new)
            .map(|rate| Arc::new(RateLimiter::direct(Quota::per_second(rate))));
        Self { name, max_concurrent, permits: Arc::new(Semaphore::new(max_concurrent)), limiter }
    }

    /// Throttle with no rate quota and a generous concurrency ceiling.
    #[must_use]
    pub fn unlimited(name: &'static str) -> Self {
        Self::new(name, ServiceLimits::new(64, None))
    }

    /// Service name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Maximum in-flight calls.
    #[must_use]
    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Wait for a concurrency slot and a rate token.
    ///
    /// The returned permit releases the slot when dropped.
    pub async fn acquire(&self) -> ServiceResult<OwnedSemaphorePermit> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ServiceError::permanent(self.name, "throttle closed"))?;
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
        Ok(permit)
    }
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("name", &self.name)
            .field("max_concurrent", &self.max_concurrent)
            .field("rate_limited", &self.limiter.is_some())
            .finish()
    }
}
