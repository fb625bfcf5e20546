//! Circuit breakers around remote calls.
//!
//! Pulls and pushes each get their own breaker so a remote that rejects
//! writes keeps serving reads. A tripped breaker answers with a retryable
//! [`ReplicationError::Transport`] without touching the network, and the
//! controller's cycle backoff takes it from there.
//!
//! # Trip rule
//!
//! The breaker watches a window of the last `failure_threshold` calls and
//! opens once every call in it failed. After `recovery_timeout` it lets
//! `success_threshold` probe calls through; all of them must succeed to
//! close again.
//!
//! Only retryable failures count. A validation or credentials answer
//! proves the remote is reachable.
//!
//! ```rust,no_run
//! # use inbox_replication::circuit_breaker::RemoteCircuit;
//! # use inbox_replication::ReplicationError;
//! # async fn example() {
//! let circuit = RemoteCircuit::new();
//! let answer: Result<(), ReplicationError> = circuit
//!     .pulls
//!     .guard(|| async { Err(ReplicationError::transport_msg("pull", "503")) })
//!     .await;
//! assert!(answer.unwrap_err().is_retryable());
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use crate::metrics;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Failure rate a full window must exceed to trip: every call failed.
const TRIP_RATE: f32 = 0.99;

/// Outcome of a raw [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error("circuit open, call not attempted")]
    Rejected,

    #[error("remote call failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failed calls that trip the breaker.
    pub failure_threshold: u32,
    /// Successful probes needed to close it again.
    pub success_threshold: u32,
    /// Time spent open before probing.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Trips sooner and probes longer. Used for pushes.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    #[must_use]
    pub fn testing() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// Point-in-time counters of one breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

impl CircuitStats {
    /// More rejected than successful calls: the breaker is (or recently was) open.
    pub fn looks_open(&self) -> bool {
        self.rejections > 0 && self.rejections > self.successes
    }
}

/// A named breaker plus call counters.
pub struct CircuitBreaker {
    name: &'static str,
    inner: AsyncRecloser,
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitConfig) -> Self {
        let window = config.failure_threshold.max(1) as usize;
        let inner = Recloser::custom()
            .error_rate(TRIP_RATE)
            .closed_len(window)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name,
            inner: inner.into(),
            calls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run `f` through the breaker; any `Err` counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> std::result::Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.calls.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(value) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = self.name, "Remote call short-circuited");
                metrics::record_circuit_rejection(self.name);
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = self.name, "Remote call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Run a remote call, counting only retryable errors against the
    /// breaker. A rejection becomes `Transport { operation: name, .. }`.
    pub async fn guard<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let outcome = self
            .call(|| async move {
                match f().await {
                    Err(e) if e.is_retryable() => Err(e),
                    answered => Ok(answered),
                }
            })
            .await;

        match outcome {
            Ok(answered) => answered,
            Err(CircuitError::Rejected) => Err(ReplicationError::transport_msg(self.name, "circuit open")),
            Err(CircuitError::Inner(e)) => Err(e),
        }
    }

    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            calls: self.calls.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

/// The pull and push breakers of one controller.
pub struct RemoteCircuit {
    pub pulls: CircuitBreaker,
    pub pushes: CircuitBreaker,
}

impl Default for RemoteCircuit {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteCircuit {
    /// Default pull breaker, aggressive push breaker.
    pub fn new() -> Self {
        Self::with_configs(CircuitConfig::default(), CircuitConfig::aggressive())
    }

    pub fn with_configs(pulls: CircuitConfig, pushes: CircuitConfig) -> Self {
        Self {
            pulls: CircuitBreaker::new("remote_pulls", pulls),
            pushes: CircuitBreaker::new("remote_pushes", pushes),
        }
    }

    pub fn any_open(&self) -> bool {
        self.pulls.stats().looks_open() || self.pushes.stats().looks_open()
    }
}
