//! Retry with exponential backoff and jitter.
//!
//! Wraps every network-facing call: claims and status updates against the job
//! store, embedding and extraction requests, and content-fetch pagination.
//!
//! The delay before retry `k` (0-indexed) is
//! `min(initial_delay * backoff_factor^k, max_delay)` plus a random jitter in
//! `[0, max_jitter)`, so parallel workers that fail together do not retry together.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::{env_millis, env_or, env_secs};
use crate::error::AppError;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Cap on the exponential part of the delay.
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Upper bound of the random jitter added to every delay.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Policy for embedding and extraction calls: 5 attempts, 1s initial, 60s cap.
    pub fn embedding() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            ..Default::default()
        }
    }

    /// Policy for job store operations.
    pub fn database() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            ..Default::default()
        }
    }

    /// Embedding policy with `MURMUR_RETRY_*` overrides.
    pub fn from_env() -> Self {
        let defaults = Self::embedding();
        Self {
            max_attempts: env_or("MURMUR_RETRY_MAX_ATTEMPTS", defaults.max_attempts),
            initial_delay: env_millis("MURMUR_RETRY_INITIAL_DELAY_MS", defaults.initial_delay),
            max_delay: env_secs("MURMUR_RETRY_MAX_DELAY_SECS", defaults.max_delay),
            backoff_factor: env_or("MURMUR_RETRY_BACKOFF_FACTOR", defaults.backoff_factor),
            max_jitter: env_millis("MURMUR_RETRY_MAX_JITTER_MS", defaults.max_jitter),
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Disables jitter; delays become deterministic.
    pub fn without_jitter(mut self) -> Self {
        self.max_jitter = Duration::ZERO;
        self
    }

    /// Exponential part of the delay before retry `attempt` (0-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Full delay before retry `attempt`, jitter included.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..jitter_ms))
    }
}

/// Runs `operation` under `policy`, retrying errors for which
/// [`AppError::is_retryable`] holds.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    with_retry_notify(policy, AppError::is_retryable, |_, _, _| {}, operation).await
}

/// Runs `operation` under `policy` with a caller-supplied retry predicate.
pub async fn with_retry_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    is_retryable: P,
    operation: F,
) -> Result<T, E>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    with_retry_notify(policy, is_retryable, |_, _, _| {}, operation).await
}

/// Like [`with_retry_if`], calling `on_retry(attempt, &error, delay)` before
/// every backoff sleep.
///
/// Non-retryable errors propagate immediately. Once `max_attempts` is
/// exhausted the last error is returned.
pub async fn with_retry_notify<T, E, F, Fut, P, N>(
    policy: &RetryPolicy,
    is_retryable: P,
    mut on_retry: N,
    mut operation: F,
) -> Result<T, E>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    N: FnMut(u32, &E, Duration),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts || !is_retryable(&err) {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient error"
                );
                on_retry(attempt, &err, delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
