// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for order-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `order_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `mode`: full, incremental, validation, webhook
//! - `stage`: fetched, skipped, synced, failed, malformed
//! - `circuit`: upstream_api, order_store

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// SYNC RUNS
// ═══════════════════════════════════════════════════════════════════════════

/// Record a finished sync or validation run
pub fn record_run(mode: &str, status: &str, duration: Duration) {
    counter!(
        "order_sync_runs_total",
        "mode" => mode.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        "order_sync_run_seconds",
        "mode" => mode.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record records passing through a run stage
pub fn record_records(mode: &str, stage: &str, count: usize) {
    counter!(
        "order_sync_records_total",
        "mode" => mode.to_string(),
        "stage" => stage.to_string()
    )
    .increment(count as u64);
}

/// Record one page requested from the upstream API
pub fn record_page(duplicate: bool) {
    let kind = if duplicate { "duplicate" } else { "fresh" };
    counter!("order_sync_pages_total", "kind" => kind).increment(1);
}

/// Record why a paginated fetch stopped
pub fn record_fetch_stop(reason: &str) {
    counter!(
        "order_sync_fetch_stops_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record an upsert batch that exhausted its retries
pub fn record_failed_batch(rows: usize) {
    counter!("order_sync_failed_batches_total").increment(1);
    counter!("order_sync_failed_batch_rows_total").increment(rows as u64);
}

/// Record rows written to the store
pub fn record_rows_written(count: usize) {
    counter!("order_sync_rows_written_total").increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// RESILIENCE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a retry of a named operation
pub fn record_retry(operation: &str) {
    counter!(
        "order_sync_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record circuit breaker state change (0 = Closed, 1 = HalfOpen, 2 = Open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "order_sync_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record circuit breaker call
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "order_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an upstream API response by status class (2xx, 4xx, 5xx, timeout, connection)
pub fn record_upstream_response(class: &str) {
    counter!(
        "order_sync_upstream_responses_total",
        "class" => class.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// RECONCILIATION
// ═══════════════════════════════════════════════════════════════════════════

/// Set the accuracy percentage of the latest validation
pub fn set_validation_accuracy(accuracy: f64) {
    gauge!("order_sync_validation_accuracy").set(accuracy);
}

/// Set drift found by the latest validation (kind = missing | outdated)
pub fn set_drift(kind: &str, count: usize) {
    gauge!(
        "order_sync_drift_records",
        "kind" => kind.to_string()
    )
    .set(count as f64);
}

/// Record records repaired by auto-fix
pub fn record_repaired(count: usize) {
    counter!("order_sync_repaired_records_total").increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// CACHE / WEBHOOKS / ALERTS
// ═══════════════════════════════════════════════════════════════════════════

/// Record cache hit/miss
pub fn record_cache(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!("order_sync_cache_total", "outcome" => outcome).increment(1);
}

/// Set cache entry count
pub fn set_cache_entries(count: usize) {
    gauge!("order_sync_cache_entries").set(count as f64);
}

/// Record an inbound webhook outcome (accepted, rejected, failed)
pub fn record_webhook(outcome: &str) {
    counter!(
        "order_sync_webhooks_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an alert emission
pub fn record_alert(level: &str, delivered: bool) {
    counter!(
        "order_sync_alerts_total",
        "level" => level.to_string(),
        "delivered" => if delivered { "true" } else { "false" }
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// LATENCY
// ═══════════════════════════════════════════════════════════════════════════

/// Record operation latency
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "order_sync_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($component:expr, $op:expr) => {
        $crate::metrics::LatencyTimer::new($component, $op)
    };
}
