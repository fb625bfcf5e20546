//! Retry with backoff, remote rate limiting and single-flight bulkheads.
//!
//! - [`RetryConfig`] / [`retry_with_backoff`]: exponential backoff for
//!   retryable failures (transport errors, store commit failures)
//! - [`RateLimiter`]: token bucket shared by an account's controllers so a
//!   reconnect storm doesn't hammer the remote
//! - [`Bulkhead`]: semaphore limiting concurrent operations; with one permit
//!   it enforces a single in-flight pull and push per controller
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), inbox_replication::resilience::BulkheadClosed> {
//! use inbox_replication::resilience::{Bulkhead, RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await;
//!
//! let in_flight = Bulkhead::single_flight();
//! let _permit = in_flight.acquire().await?;
//! // next pull starts once the permit drops
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
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Exponential backoff policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    /// `usize::MAX` retries forever.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual remote request.
    pub request_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            request_timeout: Duration::from_millis(500),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }
}

/// Sleep for `delay`, returning early with `true` if shutdown is signaled.
pub async fn sleep_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    if *shutdown_rx.borrow() {
        return true;
    }
    tokio::select! {
        changed = shutdown_rx.changed() => match changed {
            Ok(()) => *shutdown_rx.borrow(),
            Err(_) => {
                // Sender gone: nobody can signal shutdown anymore, finish the wait.
                tokio::time::sleep(delay).await;
                false
            }
        },
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, exhausts
/// `config.max_attempts`, or shutdown is signaled.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation: &str,
    shutdown_rx: &watch::Receiver<bool>,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut shutdown_rx = shutdown_rx.clone();
    let mut attempts = 0usize;

    loop {
        attempts += 1;
        match f().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(operation, attempts, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempts < config.max_attempts => {
                let delay = config.delay_for_attempt(attempts);
                warn!(
                    operation,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retryable failure, backing off"
                );
                crate::metrics::record_retry(operation, e.kind());
                if sleep_or_shutdown(delay, &mut shutdown_rx).await {
                    return Err(ReplicationError::Shutdown);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Token bucket shared by an account's controllers: `refill_rate` requests
/// per second, bursting to `burst_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub burst_size: u32,
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_size: 10,
            refill_rate: 20,
        }
    }
}

/// Remote request limiter (`governor` direct limiter).
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Wait for one request's worth of quota. Cancel-safe.
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

#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead closed")]
pub struct BulkheadClosed;

/// Caps concurrent requests of one engine; overlapping callers queue.
#[derive(Debug)]
pub struct Bulkhead {
    slots: Arc<Semaphore>,
}

impl Bulkhead {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn single_flight() -> Self {
        Self::new(1)
    }

    /// Wait for a slot; it frees when the permit drops.
    pub async fn acquire(&self) -> std::result::Result<OwnedSemaphorePermit, BulkheadClosed> {
        self.slots.clone().acquire_owned().await.map_err(|_| BulkheadClosed)
    }

    /// Requests currently holding a slot.
    pub fn in_flight(&self, max_concurrent: usize) -> usize {
        max_concurrent.saturating_sub(self.slots.available_permits())
    }
}
