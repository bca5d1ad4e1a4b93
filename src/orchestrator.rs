// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Full and incremental sync runs.
//!
//! Both modes share one path: fetch → transform → chunked idempotent upsert.
//!
//! ```text
//! run_full ────────┐
//!                  ├─► PaginatedFetcher ─► [skip unchanged] ─► persist ─► SyncReport
//! run_incremental ─┘     (window: none | trailing N hours)       │
//!                                                                ▼
//!                                          chunks of batch_size, each upserted
//!                                          through the store Executor; a batch
//!                                          that exhausts retries is counted as
//!                                          failed and the run moves on
//! ```
//!
//! Upsert is last-writer-wins by call order: the row is replaced wholesale and
//! there is no row-level `updated_at` guard. Concurrent runs (or a webhook racing
//! a run) can therefore write an older copy over a newer one; the next
//! incremental run or reconciliation repairs it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Retryable, SyncError};
use crate::fetcher::{FetchOptions, FetchOutcome, PaginatedFetcher, StopReason};
use crate::order::{is_newer, transform, UpstreamOrder};
use crate::resilience::retry::Executor;
use crate::storage::{OrderStore, StorageError};
use crate::upstream::DateWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Incremental,
}

impl SyncMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every record that needed persisting was written
    Success,
    /// Some batches failed, some were written
    Partial,
    /// Nothing that needed persisting was written
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one sync run. `fetched` and `synced` are always reported
/// separately so partial success is visible without an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub mode: SyncMode,
    pub window: Option<DateWindow>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub pages_requested: u32,
    pub stop_reason: StopReason,
    /// Unique records returned by the fetcher
    pub fetched: usize,
    /// Incremental only: records whose local copy is already current
    pub skipped_unchanged: usize,
    pub synced: usize,
    pub failed_batches: usize,
    pub failed_records: usize,
    /// Fetch and batch retries combined
    pub retries: u32,
    pub malformed: usize,
    /// `synced / (fetched - skipped_unchanged) × 100`, 100 when nothing needed writing
    pub success_rate: f64,
    pub status: RunStatus,
}

impl SyncReport {
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Counts from one call to [`SyncOrchestrator::persist`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    pub synced: usize,
    pub failed_batches: usize,
    pub failed_records: usize,
    pub retries: u32,
}

impl PersistOutcome {
    /// Status for `attempted` records given this outcome.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        if self.failed_batches == 0 {
            RunStatus::Success
        } else if self.synced > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Failed
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub batch_size: usize,
    /// Pause between upsert batches
    pub batch_delay: Duration,
    pub full_max_pages: u32,
    pub incremental_max_pages: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_delay: Duration::from_millis(100),
            full_max_pages: 1000,
            incremental_max_pages: 100,
        }
    }
}

pub struct SyncOrchestrator {
    fetcher: Arc<PaginatedFetcher>,
    store: Arc<dyn OrderStore>,
    store_executor: Executor,
    settings: OrchestratorSettings,
}

impl SyncOrchestrator {
    pub fn new(
        fetcher: Arc<PaginatedFetcher>,
        store: Arc<dyn OrderStore>,
        store_executor: Executor,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            fetcher,
            store,
            store_executor,
            settings,
        }
    }

    #[must_use]
    pub fn fetcher(&self) -> &Arc<PaginatedFetcher> {
        &self.fetcher
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn OrderStore> {
        &self.store
    }

    #[must_use]
    pub fn store_executor(&self) -> &Executor {
        &self.store_executor
    }

    /// Backfill everything the upstream returns, bounded by the full-sync page ceiling.
    #[instrument(skip(self))]
    pub async fn run_full(&self) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();
        let outcome = self
            .fetcher
            .fetch(FetchOptions {
                window: None,
                max_pages: self.settings.full_max_pages,
            })
            .await?;

        let persist = self.persist(&outcome.orders).await;
        Ok(self.finish(SyncMode::Full, None, started_at, &outcome, 0, persist))
    }

    /// Sync orders updated in the trailing `window_hours`, skipping unchanged ones.
    #[instrument(skip(self))]
    pub async fn run_incremental(&self, window_hours: u32) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();
        let window = DateWindow::trailing_hours(window_hours, started_at);
        let outcome = self
            .fetcher
            .fetch(FetchOptions {
                window: Some(window),
                max_pages: self.settings.incremental_max_pages,
            })
            .await?;

        let changed = self.changed_only(&outcome.orders).await;
        let skipped = outcome.orders.len() - changed.len();
        if skipped > 0 {
            info!(skipped, "Skipping orders whose local copy is current");
        }

        let persist = self.persist(&changed).await;
        Ok(self.finish(SyncMode::Incremental, Some(window), started_at, &outcome, skipped, persist))
    }

    /// Orders that are absent locally, newer upstream, or lack an upstream
    /// `updated_at` (which cannot be proven unchanged).
    ///
    /// If the local lookup fails every order is kept; upserts are idempotent.
    async fn changed_only(&self, orders: &[UpstreamOrder]) -> Vec<UpstreamOrder> {
        if orders.is_empty() {
            return Vec::new();
        }
        let ids: Vec<i64> = orders.iter().map(|o| o.id).collect();
        let local = match self
            .store_executor
            .call("lookup_updated_at", || self.store.updated_at_for(&ids))
            .await
        {
            Ok(local) => local,
            Err(e) => {
                warn!(error = %e, orders = orders.len(), "Local updated_at lookup failed, syncing all fetched orders");
                return orders.to_vec();
            }
        };

        orders
            .iter()
            .filter(|order| match local.get(&order.id) {
                None => true,
                Some(_) if order.updated_at.is_none() => true,
                Some(local_updated) => is_newer(order.updated_at, *local_updated),
            })
            .cloned()
            .collect()
    }

    /// Transform and upsert `orders` in sequential batches.
    ///
    /// Never fails as a whole: a batch that exhausts its retries (or is rejected
    /// by an open store breaker) is counted in the outcome and the next batch
    /// proceeds.
    pub async fn persist(&self, orders: &[UpstreamOrder]) -> PersistOutcome {
        let mut outcome = PersistOutcome::default();
        if orders.is_empty() {
            return outcome;
        }

        let synced_at = Utc::now();
        let rows: Vec<_> = orders.iter().map(|o| transform(o, synced_at)).collect();
        let batch_size = self.settings.batch_size.max(1);
        let batch_count = rows.len().div_ceil(batch_size);

        for (index, batch) in rows.chunks(batch_size).enumerate() {
            if index > 0 && !self.settings.batch_delay.is_zero() {
                tokio::time::sleep(self.settings.batch_delay).await;
            }

            let (result, retries) = self
                .store_executor
                .call_tracked(
                    "upsert_batch",
                    |e: &StorageError| e.is_retryable(),
                    || self.store.upsert_batch(batch),
                )
                .await;
            outcome.retries += retries;

            match result {
                Ok(written) => outcome.synced += written,
                Err(e) => {
                    error!(
                        batch = index + 1,
                        batches = batch_count,
                        rows = batch.len(),
                        first_id = batch.first().map(|r| r.id),
                        error = %e,
                        "Upsert batch failed, continuing with next batch"
                    );
                    crate::metrics::record_failed_batch(batch.len());
                    outcome.failed_batches += 1;
                    outcome.failed_records += batch.len();
                }
            }
        }

        if outcome.failed_batches > 0 {
            warn!(
                synced = outcome.synced,
                failed_batches = outcome.failed_batches,
                failed_records = outcome.failed_records,
                "Persist finished with failed batches"
            );
        }
        outcome
    }

    fn finish(
        &self,
        mode: SyncMode,
        window: Option<DateWindow>,
        started_at: DateTime<Utc>,
        fetch: &FetchOutcome,
        skipped_unchanged: usize,
        persist: PersistOutcome,
    ) -> SyncReport {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        let attempted = fetch.orders.len() - skipped_unchanged;
        let success_rate = if attempted == 0 {
            100.0
        } else {
            persist.synced as f64 / attempted as f64 * 100.0
        };
        let status = persist.status();

        let m = mode.as_str();
        crate::metrics::record_records(m, "fetched", fetch.orders.len());
        crate::metrics::record_records(m, "skipped", skipped_unchanged);
        crate::metrics::record_records(m, "synced", persist.synced);
        crate::metrics::record_records(m, "failed", persist.failed_records);
        crate::metrics::record_records(m, "malformed", fetch.malformed);
        crate::metrics::record_run(m, status.as_str(), Duration::from_millis(duration_ms));

        info!(
            mode = %mode,
            status = %status,
            pages = fetch.pages_requested,
            fetched = fetch.orders.len(),
            skipped = skipped_unchanged,
            synced = persist.synced,
            failed_batches = persist.failed_batches,
            retries = fetch.retries + persist.retries,
            duration_ms,
            "Sync run finished"
        );

        SyncReport {
            run_id: Uuid::new_v4(),
            mode,
            window,
            started_at,
            finished_at,
            duration_ms,
            pages_requested: fetch.pages_requested,
            stop_reason: fetch.stop_reason,
            fetched: fetch.orders.len(),
            skipped_unchanged,
            synced: persist.synced,
            failed_batches: persist.failed_batches,
            failed_records: persist.failed_records,
            retries: fetch.retries + persist.retries,
            malformed: fetch.malformed,
            success_rate,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::parse_timestamp;
    use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig};
    use crate::resilience::retry::RetryConfig;
    use crate::storage::InMemoryOrderStore;
    use crate::upstream::InMemorySource;
    use chrono::Duration as ChronoDuration;

    fn executor(name: &str) -> Executor {
        Executor::new(
            RetryConfig::test(),
            Arc::new(CircuitBreaker::new(name, CircuitConfig::default())),
        )
    }

    fn orchestrator(source: Arc<InMemorySource>, store: Arc<InMemoryOrderStore>, batch_size: usize) -> SyncOrchestrator {
        let fetcher = Arc::new(PaginatedFetcher::new(source, executor("upstream_api"), 100));
        SyncOrchestrator::new(
            fetcher,
            store,
            executor("order_store"),
            OrchestratorSettings {
                batch_size,
                batch_delay: Duration::ZERO,
                ..Default::default()
            },
        )
    }

    fn order(id: i64, updated_at: DateTime<Utc>) -> UpstreamOrder {
        UpstreamOrder::new(id, Some(updated_at))
    }

    #[tokio::test]
    async fn test_full_sync_persists_everything() {
        let now = Utc::now();
        let source = Arc::new(InMemorySource::catalog((1..=250).map(|id| order(id, now)).collect()));
        let store = Arc::new(InMemoryOrderStore::new());

        let report = orchestrator(source, store.clone(), 100).run_full().await.unwrap();

        assert_eq!(report.mode, SyncMode::Full);
        assert_eq!(report.fetched, 250);
        assert_eq!(report.synced, 250);
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.success_rate, 100.0);
        assert!(report.window.is_none());
        assert_eq!(store.len(), 250);
    }

    #[tokio::test]
    async fn test_incremental_skips_unchanged() {
        let now = Utc::now();
        let stored_at = now - ChronoDuration::hours(2);
        let source = Arc::new(InMemorySource::catalog(vec![
            order(1, stored_at),                          // unchanged
            order(2, now - ChronoDuration::minutes(30)),  // newer upstream
            order(3, now - ChronoDuration::minutes(10)),  // new
        ]));
        let store = Arc::new(InMemoryOrderStore::new());
        let orch = orchestrator(source, store.clone(), 100);
        orch.persist(&[order(1, stored_at), order(2, stored_at)]).await;

        let report = orch.run_incremental(24).await.unwrap();

        assert_eq!(report.fetched, 3);
        assert_eq!(report.skipped_unchanged, 1);
        assert_eq!(report.synced, 2);
        assert_eq!(
            store.get(2).await.unwrap().unwrap().updated_at,
            Some(now - ChronoDuration::minutes(30))
        );
    }

    #[tokio::test]
    async fn test_incremental_persists_when_upstream_timestamp_missing() {
        let stored_at = parse_timestamp("2026-01-01T00:00:00Z").unwrap();
        let source = Arc::new(InMemorySource::scripted(vec![vec![UpstreamOrder::new(1, None)]]));
        let store = Arc::new(InMemoryOrderStore::new());
        let orch = orchestrator(source, store.clone(), 100);
        orch.persist(&[order(1, stored_at)]).await;

        let report = orch.run_incremental(24).await.unwrap();
        assert_eq!(report.skipped_unchanged, 0);
        assert_eq!(report.synced, 1);
        assert_eq!(store.get(1).await.unwrap().unwrap().updated_at, None);
    }

    #[tokio::test]
    async fn test_persist_chunks_by_batch_size() {
        let source = Arc::new(InMemorySource::catalog(vec![]));
        let store = Arc::new(InMemoryOrderStore::new());
        let orch = orchestrator(source, store.clone(), 7);

        let orders: Vec<_> = (1..=20).map(|id| order(id, Utc::now())).collect();
        let outcome = orch.persist(&orders).await;

        assert_eq!(outcome.synced, 20);
        assert_eq!(outcome.failed_batches, 0);
        assert_eq!(outcome.status(), RunStatus::Success);
        assert_eq!(store.len(), 20);
    }

    #[tokio::test]
    async fn test_empty_run_is_success() {
        let source = Arc::new(InMemorySource::catalog(vec![]));
        let store = Arc::new(InMemoryOrderStore::new());
        let report = orchestrator(source, store, 100).run_incremental(24).await.unwrap();

        assert_eq!(report.fetched, 0);
        assert_eq!(report.stop_reason, StopReason::EmptyPage);
        assert_eq!(report.success_rate, 100.0);
        assert_eq!(report.status, RunStatus::Success);
    }

    #[test]
    fn test_persist_outcome_status() {
        let partial = PersistOutcome { synced: 5, failed_batches: 1, failed_records: 5, retries: 3 };
        assert_eq!(partial.status(), RunStatus::Partial);
        let failed = PersistOutcome { synced: 0, failed_batches: 2, failed_records: 10, retries: 6 };
        assert_eq!(failed.status(), RunStatus::Failed);
    }
}
