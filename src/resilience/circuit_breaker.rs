// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker guarding every call to the remote backend.
//!
//! Stops the client from hammering an unhealthy server and gives it time to
//! recover. One [`CircuitBreaker::execute`] runs the whole retry loop inside a
//! single admission, so a call that exhausts its retries counts as one failure.
//!
//! States:
//! - Closed: calls pass; consecutive failures are counted
//! - Open: calls fail fast until the open timeout elapses
//! - HalfOpen: exactly one trial call is admitted, everyone else is rejected
//!
//! Errors whose [`Retryable::is_transient`] is false (auth expired, rejected
//! request) are neither retried nor counted: the server answered, so it is up.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::retry::{retry_transient, RetryConfig, RetryError, Retryable};

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The breaker rejected the call without running it
    #[error("circuit breaker open, request rejected")]
    Open,

    /// Every attempt failed with a transient error
    #[error("gave up after {attempts} attempts: {last}")]
    MaxRetriesExceeded { attempts: usize, last: E },

    /// Non-transient failure, passed through untouched
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failed executions that open the circuit
    pub failure_threshold: u32,
    /// Time spent open before a trial call is allowed
    pub open_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitConfig {
    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            open_timeout: Duration::from_millis(50),
        }
    }
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Holds a half-open trial slot; releases it even if the caller is cancelled.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    retry: RetryConfig,
    inner: Mutex<Inner>,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig, retry: RetryConfig) -> Self {
        Self {
            name: name.into(),
            config,
            retry,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Create with default config
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default(), RetryConfig::query())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. An expired Open reads as Open until a caller tries it.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.inner.lock();
        CircuitBreakerState {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
        }
    }

    fn admit(&self) -> Option<Admission<'_>> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Some(Admission { breaker: self, trial: false }),
            CircuitState::Open => {
                let expired = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.config.open_timeout);
                if !expired {
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                info!(circuit = %self.name, "Circuit half-open, admitting trial call");
                crate::metrics::set_circuit_state(&self.name, CircuitState::HalfOpen as u8);
                Some(Admission { breaker: self, trial: true })
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return None;
                }
                inner.trial_in_flight = true;
                Some(Admission { breaker: self, trial: true })
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!(circuit = %self.name, from = %inner.state, "Circuit closed");
            crate::metrics::set_circuit_state(&self.name, CircuitState::Closed as u8);
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let trip = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.config.failure_threshold;
        if trip {
            if inner.state != CircuitState::Open {
                warn!(
                    circuit = %self.name,
                    from = %inner.state,
                    failures = inner.consecutive_failures,
                    "Circuit opened"
                );
                crate::metrics::set_circuit_state(&self.name, CircuitState::Open as u8);
            }
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Run `op` with retries under one admission.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display + Retryable,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        let Some(_admission) = self.admit() else {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            debug!(circuit = %self.name, "Circuit breaker rejected call");
            crate::metrics::record_circuit_call(&self.name, "rejected");
            return Err(CircuitError::Open);
        };

        match retry_transient(&self.name, &self.retry, op).await {
            Ok(value) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.on_success();
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(value)
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.on_failure();
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::MaxRetriesExceeded { attempts, last })
            }
            Err(RetryError::Permanent(e)) => {
                debug!(circuit = %self.name, error = %e, "Non-transient failure, not counted");
                crate::metrics::record_circuit_call(&self.name, "permanent");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Executions that exhausted their retries
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Calls rejected without running
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.calls_total();
        if total == 0 {
            return 0.0;
        }
        self.failures() as f64 / total as f64
    }
}
