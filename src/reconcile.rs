// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Drift detection and repair.
//!
//! Compares the upstream against the local store over a bounded sample of the
//! most recent upstream orders:
//!
//! 1. **Count**: upstream-reported total (or sample size) vs local row count.
//!    Informational only.
//! 2. **Missing**: sampled ids with no local row.
//! 3. **Outdated**: within a smaller sample, ids present locally whose upstream
//!    `updated_at` is strictly newer. Missing ids are never also outdated.
//!
//! `accuracy = present / sample × 100`, triaged as:
//!
//! | Status | Rule |
//! |---|---|
//! | OK | accuracy ≥ 99 and nothing missing |
//! | WARNING | accuracy ≥ 95, or fewer than 50 missing |
//! | CRITICAL | otherwise |
//!
//! The score is a heuristic over the sample, not an exhaustive diff. An empty
//! sample scores 100 / OK. With `auto_fix`, missing and outdated orders go
//! through the orchestrator's transform + upsert path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::error::SyncError;
use crate::fetcher::FetchOptions;
use crate::order::{is_newer, UpstreamOrder};
use crate::orchestrator::SyncOrchestrator;

/// Accuracy at or above which (with nothing missing) drift is OK.
pub const OK_ACCURACY: f64 = 99.0;
/// Accuracy at or above which drift is at most a WARNING.
pub const WARNING_ACCURACY: f64 = 95.0;
/// Missing counts below this are at most a WARNING.
pub const WARNING_MISSING_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Ok,
    Warning,
    Critical,
}

impl ValidationStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accuracy percentage and triage status for a sample.
#[must_use]
pub fn score(sample_size: usize, missing: usize) -> (f64, ValidationStatus) {
    if sample_size == 0 {
        return (100.0, ValidationStatus::Ok);
    }
    let present = sample_size.saturating_sub(missing);
    let accuracy = present as f64 / sample_size as f64 * 100.0;
    let status = if accuracy >= OK_ACCURACY && missing == 0 {
        ValidationStatus::Ok
    } else if accuracy >= WARNING_ACCURACY || missing < WARNING_MISSING_LIMIT {
        ValidationStatus::Warning
    } else {
        ValidationStatus::Critical
    };
    (accuracy, status)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Upstream orders examined for missing detection
    pub sample_size: usize,
    /// Upstream orders examined for outdated detection
    pub outdated_sample_size: usize,
    /// `total_count` reported by the upstream, when it reports one
    pub upstream_reported_total: Option<u64>,
    pub local_count: u64,
    pub present: usize,
    pub missing_ids: Vec<i64>,
    pub outdated_ids: Vec<i64>,
    pub accuracy: f64,
    pub status: ValidationStatus,
    pub auto_fix: bool,
    pub repaired: usize,
    pub repair_failed: usize,
}

impl ValidationReport {
    #[must_use]
    pub fn missing(&self) -> usize {
        self.missing_ids.len()
    }

    #[must_use]
    pub fn outdated(&self) -> usize {
        self.outdated_ids.len()
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub sample_size: usize,
    pub outdated_sample_size: usize,
    /// How long fetched upstream samples are reused
    pub sample_ttl: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            sample_size: 500,
            outdated_sample_size: 100,
            sample_ttl: Duration::from_secs(300),
        }
    }
}

/// Upstream sample shared through the cache.
#[derive(Debug, Clone)]
pub struct UpstreamSample {
    pub orders: Vec<UpstreamOrder>,
    pub reported_total: Option<u64>,
}

pub struct Reconciler {
    orchestrator: Arc<SyncOrchestrator>,
    samples: Arc<TtlCache<Arc<UpstreamSample>>>,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        samples: Arc<TtlCache<Arc<UpstreamSample>>>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            orchestrator,
            samples,
            settings,
        }
    }

    /// Drop cached upstream samples so the next validation refetches.
    pub fn invalidate_samples(&self) {
        self.samples.clear();
    }

    /// The `size` most recent upstream orders, from cache when fresh.
    async fn sample(&self, size: usize) -> Result<Arc<UpstreamSample>, SyncError> {
        let key = format!("upstream_sample:{size}");
        if let Some(cached) = self.samples.get(&key) {
            return Ok(cached);
        }

        let fetcher = self.orchestrator.fetcher();
        let page_size = fetcher.page_size() as usize;
        let max_pages = u32::try_from(size.div_ceil(page_size)).unwrap_or(u32::MAX);
        let mut outcome = fetcher
            .fetch(FetchOptions {
                window: None,
                max_pages,
            })
            .await?;
        outcome.orders.truncate(size);

        let sample = Arc::new(UpstreamSample {
            orders: outcome.orders,
            reported_total: outcome.reported_total,
        });
        self.samples.set(key, sample.clone(), Some(self.settings.sample_ttl));
        Ok(sample)
    }

    /// Compare upstream and local state; with `auto_fix`, repair what drifted.
    #[instrument(skip(self))]
    pub async fn run_validation(&self, auto_fix: bool) -> Result<ValidationReport, SyncError> {
        let started_at = Utc::now();
        let store = self.orchestrator.store();
        let executor = self.orchestrator.store_executor();

        let main = if self.settings.sample_size > 0 {
            self.sample(self.settings.sample_size).await?
        } else {
            Arc::new(UpstreamSample { orders: Vec::new(), reported_total: None })
        };

        // Count comparison
        let local_count = executor.call("count_all", || store.count_all()).await?;

        // Missing detection
        let ids: Vec<i64> = main.orders.iter().map(|o| o.id).collect();
        let existing = if ids.is_empty() {
            HashSet::new()
        } else {
            executor.call("existing_ids", || store.existing_ids(&ids)).await?
        };
        let missing: Vec<&UpstreamOrder> = main.orders.iter().filter(|o| !existing.contains(&o.id)).collect();

        // Outdated detection over the smaller, more recent sample
        let recent = if self.settings.outdated_sample_size == 0 {
            Arc::new(UpstreamSample { orders: Vec::new(), reported_total: None })
        } else if self.settings.outdated_sample_size <= main.orders.len() {
            Arc::new(UpstreamSample {
                orders: main.orders[..self.settings.outdated_sample_size].to_vec(),
                reported_total: main.reported_total,
            })
        } else {
            self.sample(self.settings.outdated_sample_size).await?
        };
        let recent_ids: Vec<i64> = recent.orders.iter().map(|o| o.id).collect();
        let local_updated = if recent_ids.is_empty() {
            Default::default()
        } else {
            executor
                .call("lookup_updated_at", || store.updated_at_for(&recent_ids))
                .await?
        };
        let outdated: Vec<&UpstreamOrder> = recent
            .orders
            .iter()
            .filter(|o| match local_updated.get(&o.id) {
                Some(local) => is_newer(o.updated_at, *local),
                // Absent locally: that is "missing", never "outdated"
                None => false,
            })
            .collect();

        let (accuracy, status) = score(main.orders.len(), missing.len());

        let (repaired, repair_failed) = if auto_fix && (!missing.is_empty() || !outdated.is_empty()) {
            let mut seen = HashSet::new();
            let to_repair: Vec<UpstreamOrder> = missing
                .iter()
                .chain(outdated.iter())
                .filter(|o| seen.insert(o.id))
                .map(|o| (*o).clone())
                .collect();
            info!(count = to_repair.len(), "Repairing drifted orders");
            let outcome = self.orchestrator.persist(&to_repair).await;
            crate::metrics::record_repaired(outcome.synced);
            (outcome.synced, outcome.failed_records)
        } else {
            (0, 0)
        };

        let finished_at = Utc::now();
        let report = ValidationReport {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            sample_size: main.orders.len(),
            outdated_sample_size: recent.orders.len(),
            upstream_reported_total: main.reported_total,
            local_count,
            present: main.orders.len() - missing.len(),
            missing_ids: missing.iter().map(|o| o.id).collect(),
            outdated_ids: outdated.iter().map(|o| o.id).collect(),
            accuracy,
            status,
            auto_fix,
            repaired,
            repair_failed,
        };

        crate::metrics::set_validation_accuracy(accuracy);
        crate::metrics::set_drift("missing", report.missing());
        crate::metrics::set_drift("outdated", report.outdated());
        crate::metrics::record_run("validation", status.as_str(), report_duration(&report));

        if status == ValidationStatus::Ok {
            info!(accuracy, sample = report.sample_size, local_count, "Validation finished");
        } else {
            warn!(
                status = %status,
                accuracy,
                sample = report.sample_size,
                missing = report.missing(),
                outdated = report.outdated(),
                repaired,
                "Validation found drift"
            );
        }
        Ok(report)
    }
}

fn report_duration(report: &ValidationReport) -> Duration {
    Duration::from_millis(report.duration_ms)
}
