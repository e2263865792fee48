// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with jittered exponential backoff.
//!
//! Two entry points:
//! - [`retry`] retries every error (used for opening the local store).
//! - [`retry_transient`] stops at the first error whose [`Retryable::is_transient`]
//!   is false (used inside the circuit breaker for network calls).
//!
//! [`Backoff`] is the same delay schedule as a stateful iterator, used by
//! realtime reconnection where attempts are not a simple loop.
//!
//! # Example
//!
//! ```
//! use offline_sync::RetryConfig;
//!
//! // Startup: fail fast on a bad store path
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Query: quick retry, then fail
//! let query = RetryConfig::query();
//! assert_eq!(query.max_retries, Some(3));
//! ```

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Configuration for operation retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts including the first; `None` retries forever
    pub max_retries: Option<usize>,
    /// Spread applied to each delay, as a fraction (0.2 = ±20%)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Fast-fail retry for opening the local store.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Network calls behind the circuit breaker.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            factor: 2.0,
            jitter: 0.2,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            jitter: 0.0,
        }
    }
}

/// Scale `delay` by a random factor in `[1 - jitter, 1 + jitter]`.
#[must_use]
pub fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let spread = jitter.min(1.0);
    let factor = rand::rng().random_range((1.0 - spread)..=(1.0 + spread));
    delay.mul_f64(factor)
}

/// Stateful exponential backoff with a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    factor: f64,
    jitter: f64,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, factor: f64, ceiling: Duration, jitter: f64) -> Self {
        Self {
            base,
            ceiling,
            factor: factor.max(1.0),
            jitter,
            current: base.min(ceiling),
            attempts: 0,
        }
    }

    /// Delay before the next attempt. Never exceeds the ceiling, jitter included.
    pub fn next_delay(&mut self) -> Duration {
        let delay = jittered(self.current, self.jitter).min(self.ceiling);
        self.current = self.current.mul_f64(self.factor).min(self.ceiling);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base.min(self.ceiling);
        self.attempts = 0;
    }

    /// Delays handed out since the last reset
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, attempts, "Operation succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        return Err(err);
                    }
                }
                let wait = jittered(delay, config.jitter);
                warn!(operation = operation_name, attempts, error = %err, ?wait, "Operation failed, retrying");
                sleep(wait).await;
                delay = delay.mul_f64(config.factor).min(config.max_delay);
            }
        }
    }
}

/// Why [`retry_transient`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a transient error
    Exhausted { attempts: usize, last: E },
    /// A non-transient error; retrying would not help
    Permanent(E),
}

/// Retry while errors are transient.
pub async fn retry_transient<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + Retryable,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, attempts, "Operation succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) if !err.is_transient() => return Err(RetryError::Permanent(err)),
            Err(err) => {
                attempts += 1;
                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        return Err(RetryError::Exhausted { attempts, last: err });
                    }
                }
                let wait = jittered(delay, config.jitter);
                warn!(operation = operation_name, attempts, error = %err, ?wait, "Transient failure, retrying");
                sleep(wait).await;
                delay = delay.mul_f64(config.factor).min(config.max_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError {
        msg: String,
        transient: bool,
    }

    impl TestError {
        fn transient(msg: &str) -> Self {
            Self { msg: msg.to_string(), transient: true }
        }
        fn permanent(msg: &str) -> Self {
            Self { msg: msg.to_string(), transient: false }
        }
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.msg)
        }
    }

    impl Retryable for TestError {
        fn is_transient(&self) -> bool {
            self.transient
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result: Result<i32, TestError> =
            retry("test_op", &RetryConfig::test(), || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry("test_op", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                if count < 3 {
                    Err(TestError::transient("fail"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_transient_exhausts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, RetryError<TestError>> =
            retry_transient("test_op", &RetryConfig::test(), || {
                let a = attempts_clone.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::transient("always fail"))
                }
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts: n, last }) => {
                assert_eq!(n, 3);
                assert_eq!(last.msg, "always fail");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_transient_stops_on_permanent() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, RetryError<TestError>> =
            retry_transient("test_op", &RetryConfig::test(), || {
                let a = attempts_clone.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::permanent("denied"))
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_config_presets() {
        assert_eq!(RetryConfig::startup().max_retries, Some(5));
        assert_eq!(RetryConfig::query().max_retries, Some(3));
        assert!(RetryConfig::query().jitter > 0.0);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let base = Duration::from_millis(1000);
        for _ in 0..200 {
            let d = jittered(base, 0.2);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
        }
        assert_eq!(jittered(base, 0.0), base);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut b = Backoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(5), 0.0);
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(2));
        assert_eq!(b.next_delay(), Duration::from_secs(4));
        assert_eq!(b.next_delay(), Duration::from_secs(5));
        assert_eq!(b.next_delay(), Duration::from_secs(5));
        assert_eq!(b.attempts(), 5);

        b.reset();
        assert_eq!(b.attempts(), 0);
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_never_exceeds_ceiling() {
        let mut b = Backoff::new(Duration::from_secs(10), 2.0, Duration::from_secs(30), 0.5);
        for _ in 0..50 {
            assert!(b.next_delay() <= Duration::from_secs(30));
        }
    }
}
