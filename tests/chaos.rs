//! Chaos Testing for Order Sync
//!
//! This module tests failure scenarios using:
//! 1. **FailingOrderStore** - precise error injection on upsert calls
//! 2. **Flaky and lying sources** - transient upstream errors, bogus pagination metadata
//! 3. **Circuit breakers** - fail-fast once a dependency keeps failing
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;

use order_sync::{
    Alert, AlertLevel, AlertSink, CircuitBreaker, CircuitConfig, CircuitError, CircuitState,
    InMemoryOrderStore, InMemorySource, OrderRow, OrderStore, PaginatedFetcher, RetryConfig,
    RunStatus, StopReason, StorageError, SyncConfig, SyncEngine, SyncError, SyncOrchestrator,
    UpstreamError, UpstreamOrder,
};
use order_sync::orchestrator::OrchestratorSettings;
use order_sync::resilience::retry::Executor;
use order_sync::upstream::{OrderPage, OrderSource, PageMeta, PageRequest};

// =============================================================================
// Failing Store Wrapper - Precise Error Injection
// =============================================================================

/// Wraps a store and fails upserts on chosen call numbers or for chosen ids,
/// or fails every `updated_at` lookup.
pub struct FailingOrderStore {
    inner: InMemoryOrderStore,
    upsert_calls: AtomicU64,
    /// Fail on these upsert call numbers (1-indexed)
    fail_on_calls: Vec<u64>,
    /// Fail any batch containing one of these ids
    poisoned_ids: HashSet<i64>,
    /// Fail every upsert
    fail_permanently: AtomicBool,
    /// Fail every `updated_at_for` lookup
    fail_lookups: bool,
}

impl FailingOrderStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryOrderStore::new(),
            upsert_calls: AtomicU64::new(0),
            fail_on_calls: Vec::new(),
            poisoned_ids: HashSet::new(),
            fail_permanently: AtomicBool::new(false),
            fail_lookups: false,
        }
    }

    pub fn failing_calls(calls: Vec<u64>) -> Self {
        Self { fail_on_calls: calls, ..Self::new() }
    }

    pub fn poisoned(ids: impl IntoIterator<Item = i64>) -> Self {
        Self { poisoned_ids: ids.into_iter().collect(), ..Self::new() }
    }

    pub fn failing_lookups() -> Self {
        Self { fail_lookups: true, ..Self::new() }
    }

    pub fn always_failing() -> Self {
        let store = Self::new();
        store.fail_permanently.store(true, Ordering::SeqCst);
        store
    }

    pub fn heal(&self) {
        self.fail_permanently.store(false, Ordering::SeqCst);
    }

    pub fn upsert_calls(&self) -> u64 {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

#[async_trait]
impl OrderStore for FailingOrderStore {
    async fn upsert_batch(&self, rows: &[OrderRow]) -> Result<usize, StorageError> {
        let call = self.upsert_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_permanently.load(Ordering::SeqCst)
            || self.fail_on_calls.contains(&call)
            || rows.iter().any(|r| self.poisoned_ids.contains(&r.id))
        {
            return Err(StorageError::Backend(format!("injected failure on upsert #{call}")));
        }
        self.inner.upsert_batch(rows).await
    }

    async fn get(&self, id: i64) -> Result<Option<OrderRow>, StorageError> {
        self.inner.get(id).await
    }

    async fn existing_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StorageError> {
        self.inner.existing_ids(ids).await
    }

    async fn updated_at_for(&self, ids: &[i64]) -> Result<HashMap<i64, Option<DateTime<Utc>>>, StorageError> {
        if self.fail_lookups {
            return Err(StorageError::Backend("injected lookup failure".into()));
        }
        self.inner.updated_at_for(ids).await
    }

    async fn count_all(&self) -> Result<u64, StorageError> {
        self.inner.count_all().await
    }

    async fn scan_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OrderRow>, StorageError> {
        self.inner.scan_created_between(from, to, limit).await
    }
}

// =============================================================================
// Lying Source - metadata that changes after page 1
// =============================================================================

/// Serves `pages` of 10 orders each; page 1 claims 2 pages, later pages claim 50.
struct LyingMetaSource {
    pages: u32,
    requests: AtomicU64,
}

#[async_trait]
impl OrderSource for LyingMetaSource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<OrderPage, UpstreamError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if request.page > self.pages {
            return Ok(OrderPage::default());
        }
        let first = i64::from(request.page - 1) * 10;
        let records = (first..first + 10).map(|id| json!({ "id": id })).collect();
        let total_pages = if request.page == 1 { 2 } else { 50 };
        Ok(OrderPage::from_records(
            records,
            Some(PageMeta {
                current_page: Some(request.page),
                total_pages: Some(total_pages),
                total_count: None,
            }),
        ))
    }
}

// =============================================================================
// Helpers
// =============================================================================

#[derive(Default)]
struct RecordingSink {
    alerts: Mutex<Vec<Alert>>,
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn send(&self, alert: &Alert) -> bool {
        self.alerts.lock().push(alert.clone());
        true
    }
}

fn breaker(name: &str, threshold: u32) -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(
        name,
        CircuitConfig { failure_threshold: threshold, reset_timeout: Duration::from_secs(60) },
    ))
}

fn orchestrator(
    source: Arc<dyn OrderSource>,
    store: Arc<dyn OrderStore>,
    upstream_breaker: Arc<CircuitBreaker>,
    store_breaker: Arc<CircuitBreaker>,
    batch_size: usize,
) -> SyncOrchestrator {
    let fetcher = Arc::new(PaginatedFetcher::new(
        source,
        Executor::new(RetryConfig::test(), upstream_breaker),
        100,
    ));
    SyncOrchestrator::new(
        fetcher,
        store,
        Executor::new(RetryConfig::test(), store_breaker),
        OrchestratorSettings {
            batch_size,
            batch_delay: Duration::ZERO,
            ..Default::default()
        },
    )
}

fn catalog(count: i64) -> Arc<InMemorySource> {
    let now = Utc::now();
    Arc::new(InMemorySource::catalog(
        (1..=count).map(|id| UpstreamOrder::new(id, Some(now))).collect(),
    ))
}

// =============================================================================
// Store failures
// =============================================================================

#[tokio::test]
async fn chaos_failed_batch_does_not_stop_the_run() {
    let store = Arc::new(FailingOrderStore::poisoned([150]));
    let store_breaker = breaker("order_store", 5);
    let sync = orchestrator(catalog(300), store.clone(), breaker("upstream_api", 5), store_breaker.clone(), 100);

    let report = sync.run_full().await.unwrap();

    assert_eq!(report.fetched, 300);
    assert_eq!(report.synced, 200);
    assert_eq!(report.failed_batches, 1);
    assert_eq!(report.failed_records, 100);
    assert_eq!(report.status, RunStatus::Partial);
    // The poisoned batch used its full retry budget
    assert_eq!(report.retries, 3);
    assert_eq!(store.upsert_calls(), 1 + 4 + 1);
    assert!((report.success_rate - 200.0 / 3.0).abs() < 1e-9);
    assert_eq!(store_breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn chaos_transient_store_errors_are_retried() {
    // First two attempts of the first batch fail, then it lands
    let store = Arc::new(FailingOrderStore::failing_calls(vec![1, 2]));
    let sync = orchestrator(catalog(50), store.clone(), breaker("upstream_api", 5), breaker("order_store", 5), 25);

    let report = sync.run_full().await.unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.synced, 50);
    assert_eq!(report.retries, 2);
    assert_eq!(store.len(), 50);
}

#[tokio::test]
async fn chaos_store_breaker_rejects_remaining_batches() {
    let store = Arc::new(FailingOrderStore::always_failing());
    let store_breaker = breaker("order_store", 2);
    let sync = orchestrator(catalog(60), store.clone(), breaker("upstream_api", 5), store_breaker.clone(), 10);

    let report = sync.run_full().await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.synced, 0);
    assert_eq!(report.failed_batches, 6);
    assert_eq!(report.failed_records, 60);
    // Two batches exhaust their retries, the other four never reach the store
    assert_eq!(store.upsert_calls(), 2 * 4);
    assert_eq!(store_breaker.state(), CircuitState::Open);
    assert_eq!(store_breaker.rejections(), 4);
}

#[tokio::test]
async fn chaos_store_recovers_after_heal() {
    let store = Arc::new(FailingOrderStore::always_failing());
    let sync = orchestrator(catalog(20), store.clone(), breaker("upstream_api", 5), breaker("order_store", 5), 10);

    let failed = sync.run_full().await.unwrap();
    assert_eq!(failed.status, RunStatus::Failed);

    store.heal();
    let recovered = sync.run_full().await.unwrap();
    assert_eq!(recovered.status, RunStatus::Success);
    assert_eq!(store.len(), 20);
}

#[tokio::test]
async fn chaos_failed_lookup_syncs_every_fetched_order() {
    let store = Arc::new(FailingOrderStore::failing_lookups());
    let sync = orchestrator(catalog(5), store.clone(), breaker("upstream_api", 5), breaker("order_store", 5), 100);

    let full = sync.run_full().await.unwrap();
    assert_eq!(full.synced, 5);

    // Nothing changed upstream, but without the lookup nothing can be skipped
    let report = sync.run_incremental(24).await.unwrap();
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.fetched, 5);
    assert_eq!(report.skipped_unchanged, 0);
    assert_eq!(report.synced, 5);
    assert_eq!(store.len(), 5);
    assert_eq!(store.upsert_calls(), 2);
}

// =============================================================================
// Upstream failures
// =============================================================================

#[tokio::test]
async fn chaos_flaky_upstream_is_retried() {
    let source = catalog(30);
    source.fail_next(2, UpstreamError::Status { status: 503, body: "maintenance".into() });
    let store = Arc::new(InMemoryOrderStore::new());
    let sync = orchestrator(source.clone(), store.clone(), breaker("upstream_api", 5), breaker("order_store", 5), 100);

    let report = sync.run_full().await.unwrap();

    assert_eq!(report.synced, 30);
    assert_eq!(report.retries, 2);
    // Two failed attempts plus the successful page 1 (total_pages = 1)
    assert_eq!(source.request_count(), 3);
}

#[tokio::test]
async fn chaos_open_upstream_breaker_fails_fast() {
    let source = catalog(10);
    source.fail_next(4, UpstreamError::Timeout(Duration::from_secs(300)));
    let upstream_breaker = breaker("upstream_api", 1);
    let store = Arc::new(InMemoryOrderStore::new());
    let sync = orchestrator(source.clone(), store, upstream_breaker.clone(), breaker("order_store", 5), 100);

    let err = sync.run_full().await.unwrap_err();
    assert!(matches!(err, SyncError::Upstream(CircuitError::Inner(UpstreamError::Timeout(_)))));
    assert_eq!(upstream_breaker.state(), CircuitState::Open);
    let requests = source.request_count();
    assert_eq!(requests, 4);

    let err = sync.run_full().await.unwrap_err();
    assert!(matches!(err, SyncError::Upstream(CircuitError::Rejected { .. })));
    // Rejected before any network call
    assert_eq!(source.request_count(), requests);
}

#[tokio::test]
async fn chaos_client_error_is_not_retried() {
    let source = catalog(10);
    source.push_failure(UpstreamError::Status { status: 401, body: "bad token".into() });
    let store = Arc::new(InMemoryOrderStore::new());
    let sync = orchestrator(source.clone(), store, breaker("upstream_api", 5), breaker("order_store", 5), 100);

    let err = sync.run_full().await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Upstream(CircuitError::Inner(UpstreamError::Status { status: 401, .. }))
    ));
    assert_eq!(source.request_count(), 1);
}

#[tokio::test]
async fn chaos_total_pages_only_trusted_from_first_page() {
    let source = Arc::new(LyingMetaSource { pages: 5, requests: AtomicU64::new(0) });
    let store = Arc::new(InMemoryOrderStore::new());
    let sync = orchestrator(source.clone(), store, breaker("upstream_api", 5), breaker("order_store", 5), 100);

    let report = sync.run_full().await.unwrap();

    assert_eq!(report.stop_reason, StopReason::TotalPagesReached);
    assert_eq!(report.pages_requested, 2);
    assert_eq!(report.fetched, 20);
    assert_eq!(source.requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn chaos_malformed_records_are_skipped() {
    let pages = vec![vec![
        json!({"id": 1, "total": "10.00"}),
        json!({"id": "not-a-number"}),
        json!({"total": "5.00"}),
        json!({"id": 2, "updated_at": "yesterday-ish"}),
        json!({"id": "3"}),
    ]];
    let source = Arc::new(InMemorySource::scripted_raw(pages));
    let store = Arc::new(InMemoryOrderStore::new());
    let sync = orchestrator(source, store.clone(), breaker("upstream_api", 5), breaker("order_store", 5), 100);

    let report = sync.run_full().await.unwrap();

    assert_eq!(report.malformed, 3);
    assert_eq!(report.synced, 2);
    assert!(store.get(1).await.unwrap().is_some());
    assert!(store.get(3).await.unwrap().is_some());
}

// =============================================================================
// Engine-level alerting under failure
// =============================================================================

#[tokio::test(start_paused = true)]
async fn chaos_partial_sync_raises_warning_alert() {
    let store = Arc::new(FailingOrderStore::poisoned([7]));
    let config = SyncConfig {
        batch_size: 10,
        batch_delay_ms: 0,
        ..Default::default()
    };
    let sink = Arc::new(RecordingSink::default());
    let engine = SyncEngine::new(config, catalog(40), store.clone())
        .unwrap()
        .with_alert_sink(sink.clone());

    let report = engine.run_full_sync().await.unwrap();

    assert_eq!(report.status, RunStatus::Partial);
    assert_eq!(report.failed_batches, 1);
    let alerts = sink.alerts.lock();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].level, AlertLevel::Warning);
    assert_eq!(alerts[0].context["failed_batches"], 1);
}

#[tokio::test(start_paused = true)]
async fn chaos_circuit_metrics_reflect_failures() {
    let store = Arc::new(FailingOrderStore::always_failing());
    let config = SyncConfig {
        batch_size: 10,
        batch_delay_ms: 0,
        breaker_failure_threshold: 2,
        ..Default::default()
    };
    let sink = Arc::new(RecordingSink::default());
    let engine = SyncEngine::new(config, catalog(50), store)
        .unwrap()
        .with_alert_sink(sink.clone());

    let report = engine.run_full_sync().await.unwrap();
    assert_eq!(report.status, RunStatus::Failed);

    let metrics = engine.circuit_metrics();
    assert_eq!(metrics.store_state, CircuitState::Open);
    assert_eq!(metrics.store_failures, 2);
    assert_eq!(metrics.store_rejections, 3);
    assert_eq!(metrics.upstream_state, CircuitState::Closed);
    assert_eq!(sink.alerts.lock()[0].level, AlertLevel::Critical);
}
