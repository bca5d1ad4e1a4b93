// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Order sync engine facade.
//!
//! The [`SyncEngine`] wires the components together and is what downstream
//! callers hold:
//! - one [`CircuitBreaker`](crate::resilience::circuit_breaker::CircuitBreaker)
//!   per dependency (upstream API, order store), created once per engine
//! - a [`PaginatedFetcher`] and [`SyncOrchestrator`] sharing those breakers
//! - a [`Reconciler`] with a TTL cache of upstream samples
//! - a report cache, alert sink and optional run-log sidecar
//!
//! # Lifecycle
//!
//! ```text
//! new() → start() (spawns cache sweepers) → run_* / handle_webhook … → drop (sweepers stop)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use order_sync::{SyncConfig, SyncEngine};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), order_sync::SyncError> {
//! let config = SyncConfig::from_env()?;
//! let mut engine = SyncEngine::connect(config).await?;
//! engine.start();
//!
//! let report = engine.run_incremental_sync(24).await?;
//! println!("synced {} of {} fetched", report.synced, report.fetched);
//!
//! let validation = engine.run_validation(false).await?;
//! println!("accuracy {:.1}% ({})", validation.accuracy, validation.status);
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::alert::{Alert, AlertLevel, AlertSink, CompositeAlertSink, WebhookAlertSink};
use crate::cache::{CachedValue, TtlCache};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::fetcher::PaginatedFetcher;
use crate::order::OrderRow;
use crate::orchestrator::{OrchestratorSettings, RunStatus, SyncMode, SyncOrchestrator, SyncReport};
use crate::reconcile::{ReconcileSettings, Reconciler, UpstreamSample, ValidationReport, ValidationStatus};
use crate::resilience::circuit_breaker::{DependencyCircuitMetrics, DependencyCircuits};
use crate::resilience::retry::Executor;
use crate::run_log::RunLog;
use crate::storage::{OrderStore, SqlOrderStore};
use crate::upstream::{HttpOrderSource, OrderSource};
use crate::webhook::{HmacSha256Verifier, SignatureVerifier, WebhookHandler, WebhookOutcome};

const LATEST_VALIDATION_KEY: &str = "latest_validation";

pub struct SyncEngine {
    config: SyncConfig,
    circuits: DependencyCircuits,
    orchestrator: Arc<SyncOrchestrator>,
    reconciler: Reconciler,
    webhooks: WebhookHandler,
    reports: Arc<TtlCache<Arc<ValidationReport>>>,
    samples: Arc<TtlCache<Arc<UpstreamSample>>>,
    alerts: Arc<dyn AlertSink>,
    run_log: Option<RunLog>,
    sweepers: Vec<JoinHandle<()>>,
}

impl SyncEngine {
    /// Build an engine over the given upstream source and store.
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn OrderSource>,
        store: Arc<dyn OrderStore>,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let circuits = DependencyCircuits::new(config.circuit_config(), config.circuit_config());
        let upstream_executor = Executor::new(config.retry_config(), circuits.upstream.clone());
        let store_executor = Executor::new(config.batch_retry_config(), circuits.store.clone());

        let fetcher = Arc::new(
            PaginatedFetcher::new(source, upstream_executor, config.page_size)
                .with_duplicate_page_limit(config.duplicate_page_limit),
        );
        let orchestrator = Arc::new(SyncOrchestrator::new(
            fetcher,
            store,
            store_executor,
            OrchestratorSettings {
                batch_size: config.batch_size,
                batch_delay: config.batch_delay(),
                full_max_pages: config.full_sync_max_pages,
                incremental_max_pages: config.incremental_max_pages,
            },
        ));

        let samples = Arc::new(TtlCache::new(config.cache_ttl()));
        let reports = Arc::new(TtlCache::new(config.cache_ttl()));
        let reconciler = Reconciler::new(
            orchestrator.clone(),
            samples.clone(),
            ReconcileSettings {
                sample_size: config.validation_sample_size,
                outdated_sample_size: config.outdated_sample_size,
                sample_ttl: config.cache_ttl(),
            },
        );

        let verifier = match &config.webhook_secret {
            Some(secret) => {
                let verifier = HmacSha256Verifier::new(secret)
                    .map_err(|e| SyncError::Config(format!("webhook_secret: {e}")))?;
                Some(Arc::new(verifier) as Arc<dyn SignatureVerifier>)
            }
            None => None,
        };
        let webhooks = WebhookHandler::new(verifier, orchestrator.clone());

        let remote: Option<Box<dyn AlertSink>> = match &config.alert_webhook_url {
            Some(url) => Some(Box::new(
                WebhookAlertSink::new(url.clone())
                    .map_err(|e| SyncError::Config(format!("alert_webhook_url: {e}")))?,
            )),
            None => None,
        };
        let alerts: Arc<dyn AlertSink> = Arc::new(CompositeAlertSink::new(remote));
        let run_log = config.run_log_path.as_ref().map(RunLog::new);

        Ok(Self {
            config,
            circuits,
            orchestrator,
            reconciler,
            webhooks,
            reports,
            samples,
            alerts,
            run_log,
            sweepers: Vec::new(),
        })
    }

    /// Build an engine over the HTTP upstream and the SQL store named in `config`.
    pub async fn connect(config: SyncConfig) -> Result<Self, SyncError> {
        let source = HttpOrderSource::from_config(&config)
            .map_err(|e| SyncError::Config(format!("upstream: {e}")))?;
        let sql_url = config
            .sql_url
            .clone()
            .ok_or_else(|| SyncError::Config("sql_url is required".to_string()))?;
        let store = SqlOrderStore::new(&sql_url)
            .await
            .map_err(|e| SyncError::Config(format!("store: {e}")))?;
        Self::new(config, Arc::new(source), Arc::new(store))
    }

    /// Replace the alert sink (tracing + optional webhook by default).
    #[must_use]
    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = sink;
        self
    }

    /// Spawn the cache sweepers. Idempotent; must be called inside a tokio runtime.
    pub fn start(&mut self) {
        if !self.sweepers.is_empty() {
            return;
        }
        let interval = self.config.cache_sweep_interval();
        if interval.is_zero() {
            return;
        }
        self.sweepers.push(self.samples.spawn_sweeper(interval));
        self.sweepers.push(self.reports.spawn_sweeper(interval));
        info!(interval_secs = interval.as_secs(), "Cache sweepers started");
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    /// Backfill the full upstream history (bounded by `full_sync_max_pages`).
    pub async fn run_full_sync(&self) -> Result<SyncReport, SyncError> {
        let result = self.orchestrator.run_full().await;
        self.after_sync(SyncMode::Full, result).await
    }

    /// Sync the trailing `window_hours`, skipping orders whose local copy is current.
    pub async fn run_incremental_sync(&self, window_hours: u32) -> Result<SyncReport, SyncError> {
        let result = self.orchestrator.run_incremental(window_hours).await;
        self.after_sync(SyncMode::Incremental, result).await
    }

    /// [`SyncEngine::run_incremental_sync`] over the configured
    /// `incremental_window_hours`.
    pub async fn run_incremental_sync_default(&self) -> Result<SyncReport, SyncError> {
        self.run_incremental_sync(self.config.incremental_window_hours).await
    }

    /// Detect drift over a recent upstream sample; with `auto_fix`, repair it.
    pub async fn run_validation(&self, auto_fix: bool) -> Result<ValidationReport, SyncError> {
        let report = match self.reconciler.run_validation(auto_fix).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Validation failed");
                crate::metrics::record_run("validation", "failed", Duration::ZERO);
                self.alert(
                    AlertLevel::Critical,
                    "Order validation failed",
                    json!({ "error": e.to_string() }),
                )
                .await;
                return Err(e);
            }
        };

        let report = Arc::new(report);
        self.reports.set(LATEST_VALIDATION_KEY, report.clone(), None);
        if let Some(log) = &self.run_log {
            log.append("validation", report.as_ref()).await;
        }

        let level = match report.status {
            ValidationStatus::Ok => None,
            ValidationStatus::Warning => Some(AlertLevel::Warning),
            ValidationStatus::Critical => Some(AlertLevel::Critical),
        };
        if let Some(level) = level {
            self.alert(
                level,
                format!("Order drift detected: {} ({:.1}% accurate)", report.status, report.accuracy),
                json!({
                    "accuracy": report.accuracy,
                    "sample_size": report.sample_size,
                    "missing": report.missing(),
                    "outdated": report.outdated(),
                    "repaired": report.repaired,
                }),
            )
            .await;
        }

        Ok(Arc::unwrap_or_clone(report))
    }

    /// The most recent validation report while it is fresh, with age metadata.
    pub fn latest_validation(&self) -> Option<CachedValue<Arc<ValidationReport>>> {
        self.reports.get_with_metadata(LATEST_VALIDATION_KEY)
    }

    /// Verify and upsert one pushed order.
    pub async fn handle_webhook(&self, body: &[u8], signature: Option<&str>) -> WebhookOutcome {
        self.webhooks.handle(body, signature).await
    }

    /// Stored orders with `from <= created_at < to`, oldest first.
    pub async fn orders_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OrderRow>, SyncError> {
        let store = self.orchestrator.store();
        Ok(self
            .orchestrator
            .store_executor()
            .call("scan_created_between", || store.scan_created_between(from, to, limit))
            .await?)
    }

    /// Breaker state and counters for both dependencies.
    #[must_use]
    pub fn circuit_metrics(&self) -> DependencyCircuitMetrics {
        self.circuits.metrics()
    }

    #[must_use]
    pub fn circuits(&self) -> &DependencyCircuits {
        &self.circuits
    }

    async fn after_sync(
        &self,
        mode: SyncMode,
        result: Result<SyncReport, SyncError>,
    ) -> Result<SyncReport, SyncError> {
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                error!(mode = %mode, error = %e, "Sync run failed");
                crate::metrics::record_run(mode.as_str(), "failed", Duration::ZERO);
                self.alert(
                    AlertLevel::Critical,
                    format!("{mode} sync failed"),
                    json!({ "mode": mode, "error": e.to_string() }),
                )
                .await;
                return Err(e);
            }
        };

        if let Some(log) = &self.run_log {
            log.append("sync", &report).await;
        }

        let below_threshold = report.success_rate < self.config.alert_success_rate_threshold;
        if below_threshold || report.failed_batches > 0 {
            let level = if report.status == RunStatus::Failed {
                AlertLevel::Critical
            } else {
                AlertLevel::Warning
            };
            self.alert(
                level,
                format!("{mode} sync finished with failures ({:.1}% synced)", report.success_rate),
                json!({
                    "run_id": report.run_id,
                    "mode": mode,
                    "fetched": report.fetched,
                    "synced": report.synced,
                    "failed_batches": report.failed_batches,
                    "failed_records": report.failed_records,
                    "success_rate": report.success_rate,
                }),
            )
            .await;
        }
        Ok(report)
    }

    async fn alert(&self, level: AlertLevel, message: impl Into<String>, context: serde_json::Value) {
        let alert = Alert::new(level, message, context);
        if !self.alerts.send(&alert).await {
            warn!(level = %level, "Alert was not delivered");
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        for handle in self.sweepers.drain(..) {
            handle.abort();
        }
    }
}
