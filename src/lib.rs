// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Order Sync
//!
//! A sync reliability and consistency engine that mirrors a paginated upstream
//! order API into a local SQL store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Upstream Order API                      │
//! │  • GET /orders?page=&per_page=&updated_from=&updated_to=   │
//! │  • Unreliable pagination metadata, repeated pages          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!             (retry + circuit breaker per dependency)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Paginated Fetcher                       │
//! │  • Dedup by order id across pages                          │
//! │  • Stops on empty page, duplicate pages, total, ceiling    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Sync Orchestrator                        │
//! │  • Full / incremental runs, skip-if-unchanged              │
//! │  • Batched idempotent upserts, partial failure tolerated   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Order Store (SQLite / MySQL)                │
//! │  • Keyed by upstream order id                              │
//! │  • Reconciler samples upstream and repairs drift           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use order_sync::{SyncConfig, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), order_sync::SyncError> {
//!     let config = SyncConfig {
//!         api_base_url: "https://orders.example.com/api/v1".into(),
//!         api_token: Some("token".into()),
//!         sql_url: Some("sqlite:orders.db?mode=rwc".into()),
//!         ..Default::default()
//!     };
//!
//!     let mut engine = SyncEngine::connect(config).await?;
//!     engine.start();
//!
//!     let report = engine.run_full_sync().await?;
//!     println!("{} synced, status {}", report.synced, report.status);
//!
//!     let drift = engine.run_validation(true).await?;
//!     println!("{:.1}% accurate, {} repaired", drift.accuracy, drift.repaired);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: The [`SyncEngine`] facade wiring everything together
//! - [`upstream`]: Order sources (HTTP, in-memory)
//! - [`fetcher`]: Defensive pagination
//! - [`orchestrator`]: Full and incremental sync runs
//! - [`reconcile`]: Drift detection and repair
//! - [`storage`]: Order stores (SQL, memory)
//! - [`resilience`]: Circuit breakers and retry logic
//! - [`cache`]: TTL cache for samples and reports
//! - [`webhook`]: Signed inbound order pushes
//! - [`alert`]: Outbound alert sinks

pub mod alert;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod metrics;
pub mod orchestrator;
pub mod order;
pub mod reconcile;
pub mod resilience;
pub mod run_log;
pub mod storage;
pub mod upstream;
pub mod webhook;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use alert::{Alert, AlertLevel, AlertSink};
pub use cache::{CachedValue, TtlCache};
pub use config::SyncConfig;
pub use engine::SyncEngine;
pub use error::{Retryable, SyncError, UpstreamError};
pub use fetcher::{FetchOutcome, PaginatedFetcher, StopReason};
pub use orchestrator::{RunStatus, SyncMode, SyncOrchestrator, SyncReport};
pub use order::{OrderRow, UpstreamOrder};
pub use reconcile::{ValidationReport, ValidationStatus};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState, DependencyCircuits};
pub use resilience::retry::RetryConfig;
pub use storage::{InMemoryOrderStore, OrderStore, SqlOrderStore, StorageError};
pub use upstream::{HttpOrderSource, InMemorySource, OrderSource};
pub use webhook::{WebhookHandler, WebhookOutcome};
pub use metrics::LatencyTimer;
