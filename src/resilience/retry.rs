// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff, jitter, and a circuit breaker.
//!
//! The [`Executor`] wraps any remote call:
//! 1. Consult the breaker; if open, fail fast with [`CircuitError::Rejected`]
//! 2. Run the operation
//! 3. On a retryable failure with attempts left, sleep
//!    `min(base·2^attempt, max) + jitter(0..30%)` and go again
//! 4. Report the final outcome to the breaker (one success or one failure per call)
//!
//! # Example
//!
//! ```
//! use order_sync::RetryConfig;
//! use std::time::Duration;
//!
//! let upstream = RetryConfig::upstream();
//! assert_eq!(upstream.max_retries, 3);
//!
//! // Attempt 2 waits 4s plus up to 30% jitter
//! let d = upstream.delay_for_attempt(2, 0.0);
//! assert_eq!(d, Duration::from_secs(4));
//! ```

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::error::Retryable;

/// Upper bound of the random jitter, as a fraction of the backoff delay.
pub const JITTER_FRACTION: f64 = 0.3;

/// Configuration for operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::upstream()`] - Upstream API calls
/// - [`RetryConfig::batch_write()`] - Upsert batches against the store
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry (attempt 0)
    pub base_delay: Duration,
    /// Cap applied to the exponential delay before jitter
    pub max_delay: Duration,
    /// Retries after the first attempt (total attempts = max_retries + 1)
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::upstream()
    }
}

impl RetryConfig {
    /// Upstream API calls: 3 retries, 1s base, capped at 30s.
    #[must_use]
    pub fn upstream() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: 3,
        }
    }

    /// Store batch writes: quicker retries, the data is local.
    #[must_use]
    pub fn batch_write() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[must_use]
    pub fn test() -> Self {
        Self {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            max_retries: 3,
        }
    }

    /// Backoff before jitter: `min(base·2^attempt, max_delay)`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay for a 0-indexed attempt given a jitter sample in `[0, 1]`.
    ///
    /// The result lies in `[backoff, backoff·1.3]`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let backoff = self.backoff(attempt);
        let jitter = backoff.mul_f64(JITTER_FRACTION * jitter_sample.clamp(0.0, 1.0));
        backoff + jitter
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let sample: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_for_attempt(attempt, sample)
    }
}

/// Fault-tolerant call executor bound to one dependency's breaker.
#[derive(Debug, Clone)]
pub struct Executor {
    config: RetryConfig,
    breaker: Arc<CircuitBreaker>,
}

impl Executor {
    pub fn new(config: RetryConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self { config, breaker }
    }

    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run `operation` with retries, classifying errors via [`Retryable`].
    pub async fn call<F, Fut, T, E>(
        &self,
        operation_name: &str,
        operation: F,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        self.call_tracked(operation_name, |e: &E| e.is_retryable(), operation)
            .await
            .0
    }

    /// Like [`Executor::call`] with a custom retry predicate, also returning the
    /// number of retries that were performed.
    pub async fn call_tracked<F, Fut, T, E, P>(
        &self,
        operation_name: &str,
        should_retry: P,
        mut operation: F,
    ) -> (Result<T, CircuitError<E>>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        if let Err(rejected) = self.breaker.try_acquire() {
            return (Err(rejected), 0);
        }

        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(val) => {
                    if attempt > 0 {
                        info!(operation = operation_name, retries = attempt, "Operation succeeded after retries");
                    }
                    self.breaker.record_success();
                    return (Ok(val), attempt);
                }
                Err(err) => {
                    let retryable = should_retry(&err);
                    if !retryable || attempt >= self.config.max_retries {
                        if retryable {
                            warn!(operation = operation_name, attempts = attempt + 1, error = %err, "Retries exhausted");
                        } else {
                            warn!(operation = operation_name, error = %err, "Non-retryable failure");
                        }
                        self.breaker.record_failure();
                        return (Err(CircuitError::Inner(err)), attempt);
                    }

                    let delay = self.config.jittered_delay(attempt);
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        max_attempts = self.config.max_retries + 1,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Operation failed, retrying"
                    );
                    crate::metrics::record_retry(operation_name);
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
