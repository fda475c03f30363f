// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry, timeouts and load shedding for store calls.
//!
//! - [`RetryConfig`] / [`retry`]: Exponential backoff for transient failures
//! - [`RateLimiter`]: Token bucket to cap requests sent to a remote
//! - [`Bulkhead`]: Semaphore to limit concurrent revision fetches
//! - [`with_timeout`]: Deadline for a single store call
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> revsync::Result<()> {
//! use revsync::resilience::{retry, Bulkhead, RetryConfig};
//!
//! let fetches = Bulkhead::new(8);
//! let _slot = fetches.acquire().await?;
//! let _seq = retry(&RetryConfig::for_remote(3), "changes", || async { Ok(42u64) }).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Configuration for request retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (1 = no retry).
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Retry policy for requests to a remote store.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay before next
    /// -------  -----------------
    /// 1        200ms
    /// 2        400ms
    /// 3        800ms
    /// ...      capped at 5s
    /// ```
    pub fn for_remote(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
        }
    }

    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Fast-fail retry for tests.
    ///
    /// Fails quickly to avoid slow tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let delay = Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()));

        std::cmp::min(delay, self.max_delay)
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or runs out
/// of attempts. Returns the last error.
pub async fn retry<F, Fut, T>(config: &RetryConfig, operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run `fut` with a deadline. Expiry becomes [`ReplicationError::Timeout`].
pub async fn with_timeout<T, Fut>(operation: &str, after: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation, after_ms = after.as_millis() as u64, "Operation timed out");
            Err(ReplicationError::Timeout {
                operation: operation.to_string(),
                after,
            })
        }
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Request budget for one remote.
///
/// `refill_rate` requests per second are sustained; up to `burst_size` may go
/// out back to back after a quiet period.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub burst_size: u32,
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Paces HTTP requests to a remote store. Shared by every call an
/// [`HttpStore`](crate::transport::HttpStore) makes.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Zero rates are raised to 1.
    pub fn new(config: RateLimitConfig) -> Self {
        let per_second = NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN);
        let limiter = GovLimiter::direct(Quota::per_second(per_second).allow_burst(burst));
        Self { limiter, config }
    }

    /// Wait for the next request slot. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

// =============================================================================
// Bulkhead
// =============================================================================

/// Caps how many revision fetches a batch has in flight against its source.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// At least one slot, whatever `max_concurrent` says.
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Wait for a slot. The slot frees when the permit drops.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ReplicationError::Internal("fetch bulkhead closed".to_string()))
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }
}
