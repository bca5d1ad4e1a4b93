// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-dependency circuit breaker.
//!
//! Protects the upstream order API and the local store from being hammered
//! while they are unhealthy. The executor consults the breaker before each
//! call and reports the call outcome afterwards.
//!
//! States:
//! - Closed: Normal operation, requests pass through
//! - Open: Dependency unhealthy, requests fail-fast without attempting
//! - HalfOpen: Reset timeout elapsed, the next call is a recovery trial
//!
//! ```text
//! Closed ──(threshold consecutive failures)──► Open
//!   ▲                                           │
//!   │                                (reset timeout elapsed,
//!   │                                 next call attempted)
//!   │                                           ▼
//!   └────────────(trial succeeds)────────── HalfOpen
//!                                               │
//!                 Open ◄────(trial fails)───────┘
//! ```
//!
//! Breakers are plain objects: build one per dependency at startup and share it
//! via `Arc`. State is guarded by a `parking_lot::Mutex` so the same breaker can
//! be used from a multi-threaded runtime.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

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
    /// The circuit breaker rejected the call (circuit is open). No call was issued.
    #[error("circuit breaker '{name}' open, request rejected")]
    Rejected { name: String },

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    /// True for the synthetic fail-fast error.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// The underlying error, if the call was actually attempted.
    #[must_use]
    pub fn inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Rejected { .. } => None,
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed
    pub reset_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitConfig {
    /// Upstream API: tolerate a handful of failures, wait a minute before probing.
    #[must_use]
    pub fn upstream() -> Self {
        Self::default()
    }

    /// Local store: trips faster, recovers sooner.
    #[must_use]
    pub fn store() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(15),
        }
    }

    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            reset_timeout: Duration::from_millis(50),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<BreakerState>,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                opened_at: None,
            }),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Get the circuit breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. An open circuit whose reset timeout has elapsed still
    /// reports `Open` until the next call attempt moves it to `HalfOpen`.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Consecutive failures recorded since the last success
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// When the most recent failure was recorded
    #[must_use]
    pub fn last_failure(&self) -> Option<Instant> {
        self.inner.lock().last_failure
    }

    /// Ask permission to issue a call.
    ///
    /// Returns `Err(Rejected)` while open. Once the reset timeout has elapsed the
    /// circuit moves to `HalfOpen` and the call is let through as a trial.
    pub fn try_acquire<E>(&self) -> Result<(), CircuitError<E>> {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| at.elapsed())
                .unwrap_or(Duration::MAX);
            if elapsed < self.config.reset_timeout {
                drop(inner);
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                crate::metrics::record_circuit_call(&self.name, "rejected");
                return Err(CircuitError::Rejected { name: self.name.clone() });
            }
            inner.state = CircuitState::HalfOpen;
            info!(circuit = %self.name, "Circuit half-open, allowing trial call");
            crate::metrics::set_circuit_state(&self.name, CircuitState::HalfOpen as u8);
        }

        Ok(())
    }

    /// Record a successful call. Closes the circuit and clears the failure count.
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        let previous = inner.state;
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        drop(inner);

        if previous != CircuitState::Closed {
            info!(circuit = %self.name, from = %previous, "Circuit closed after successful call");
            crate::metrics::set_circuit_state(&self.name, CircuitState::Closed as u8);
        }
        debug!(circuit = %self.name, "Circuit call succeeded");
        crate::metrics::record_circuit_call(&self.name, "success");
    }

    /// Record a failed call. Trips the circuit at the threshold, and re-opens
    /// it immediately when a half-open trial fails.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(now);

        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
        }
        let failures = inner.consecutive_failures;
        drop(inner);

        if trip {
            warn!(circuit = %self.name, failures, "Circuit breaker opened");
            crate::metrics::set_circuit_state(&self.name, CircuitState::Open as u8);
        }
        crate::metrics::record_circuit_call(&self.name, "failure");
    }

    /// Get total number of calls
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (operation errors)
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open)
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

/// Breakers for the engine's two remote dependencies.
#[derive(Debug, Clone)]
pub struct DependencyCircuits {
    /// Upstream order API
    pub upstream: Arc<CircuitBreaker>,
    /// Local order store
    pub store: Arc<CircuitBreaker>,
}

impl Default for DependencyCircuits {
    fn default() -> Self {
        Self::new(CircuitConfig::upstream(), CircuitConfig::store())
    }
}

impl DependencyCircuits {
    pub fn new(upstream: CircuitConfig, store: CircuitConfig) -> Self {
        Self {
            upstream: Arc::new(CircuitBreaker::new("upstream_api", upstream)),
            store: Arc::new(CircuitBreaker::new("order_store", store)),
        }
    }

    /// Snapshot of both breakers for health reporting
    pub fn metrics(&self) -> DependencyCircuitMetrics {
        DependencyCircuitMetrics {
            upstream_state: self.upstream.state(),
            upstream_failures: self.upstream.failures(),
            upstream_rejections: self.upstream.rejections(),
            store_state: self.store.state(),
            store_failures: self.store.failures(),
            store_rejections: self.store.rejections(),
        }
    }
}

/// Aggregated metrics from both dependency circuits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyCircuitMetrics {
    pub upstream_state: CircuitState,
    pub upstream_failures: u64,
    pub upstream_rejections: u64,
    pub store_state: CircuitState,
    pub store_failures: u64,
    pub store_rejections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trip(cb: &CircuitBreaker) {
        for _ in 0..cb.config.failure_threshold {
            cb.try_acquire::<()>().unwrap();
            cb.record_failure();
        }
    }

    #[test]
    fn test_new_circuit_is_closed() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.try_acquire::<()>().is_ok());
    }

    #[test]
    fn test_opens_after_threshold_consecutive_failures() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 2);
        assert!(cb.last_failure().is_some());
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());

        cb.record_failure();
        cb.record_success();
        cb.record_failure();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 1);
    }

    #[test]
    fn test_open_circuit_rejects_without_calling() {
        let config = CircuitConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(60),
        };
        let cb = CircuitBreaker::new("test", config);
        cb.record_failure();

        let result = cb.try_acquire::<&str>();
        assert!(matches!(result, Err(CircuitError::Rejected { ref name }) if name == "test"));
        assert_eq!(cb.rejections(), 1);
    }

    #[tokio::test]
    async fn test_half_open_trial_success_closes() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());
        trip(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(cb.try_acquire::<()>().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_trial_failure_reopens() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());
        trip(&cb);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cb.try_acquire::<()>().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Fresh reset window: rejected again straight away
        assert!(cb.try_acquire::<()>().unwrap_err().is_rejected());
    }

    #[test]
    fn test_dependency_circuits_names_and_metrics() {
        let circuits = DependencyCircuits::default();
        assert_eq!(circuits.upstream.name(), "upstream_api");
        assert_eq!(circuits.store.name(), "order_store");

        circuits.store.record_failure();
        let metrics = circuits.metrics();
        assert_eq!(metrics.store_failures, 1);
        assert_eq!(metrics.upstream_failures, 0);
        assert_eq!(metrics.upstream_state, CircuitState::Closed);
    }

    #[test]
    fn test_circuit_config_presets() {
        let upstream = CircuitConfig::upstream();
        let store = CircuitConfig::store();
        assert!(store.failure_threshold < upstream.failure_threshold);
        assert!(store.reset_timeout < upstream.reset_timeout);
    }
}
