// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic order-sync example.
//!
//! Demonstrates:
//! 1. Loading `ORDER_SYNC_*` settings from the environment (or a `.env` file)
//! 2. A full backfill over a paginated upstream
//! 3. An incremental run that skips unchanged orders
//! 4. Drift detection and auto-fix
//! 5. Displaying metrics
//!
//! The upstream and store are in-memory, so no services are needed.
//!
//! # Run
//!
//! ```bash
//! RUST_LOG=order_sync=info cargo run --example basic_sync
//! ```

use chrono::{Duration as ChronoDuration, Utc};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use order_sync::{InMemoryOrderStore, InMemorySource, OrderStore, SyncConfig, SyncEngine, UpstreamOrder};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().map_err(|e| e.to_string())?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("order_sync=info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║              order-sync: Basic Sync Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure the engine
    // ─────────────────────────────────────────────────────────────────────────
    let config = SyncConfig {
        batch_delay_ms: 0,
        validation_sample_size: 200,
        outdated_sample_size: 50,
        ..SyncConfig::from_env()?
    };

    let now = Utc::now();
    let orders: Vec<UpstreamOrder> = (1..=250)
        .map(|id| {
            let mut order = UpstreamOrder::new(id, Some(now - ChronoDuration::hours(6)));
            order.status = Some("completed".into());
            order.total = Some(format!("{}.99", id % 90 + 10));
            order.created_at = Some(now - ChronoDuration::days(id % 30));
            order
        })
        .collect();
    let source = Arc::new(InMemorySource::catalog(orders));
    let store = Arc::new(InMemoryOrderStore::new());

    let mut engine = SyncEngine::new(config, source.clone(), store.clone())?;
    engine.start();

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Full backfill
    // ─────────────────────────────────────────────────────────────────────────
    let full = engine.run_full_sync().await?;
    println!(
        "📥 Full sync: {} pages, {} fetched, {} synced ({}), stop: {}",
        full.pages_requested, full.fetched, full.synced, full.status, full.stop_reason
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Incremental run after a few upstream changes
    // ─────────────────────────────────────────────────────────────────────────
    for id in [3, 14, 159] {
        let mut changed = UpstreamOrder::new(id, Some(Utc::now()));
        changed.status = Some("refunded".into());
        source.put(changed);
    }
    let incremental = engine.run_incremental_sync_default().await?;
    println!(
        "🔁 Incremental: {} fetched, {} unchanged, {} synced",
        incremental.fetched, incremental.skipped_unchanged, incremental.synced
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Drift: lose some rows locally, then detect and repair
    // ─────────────────────────────────────────────────────────────────────────
    for id in [20, 21, 22] {
        store.remove(id);
    }
    let drift = engine.run_validation(true).await?;
    println!(
        "🔍 Validation: {:.1}% accurate ({}), {} missing, {} outdated, {} repaired",
        drift.accuracy,
        drift.status,
        drift.missing(),
        drift.outdated(),
        drift.repaired
    );
    println!("   Local rows after repair: {}", store.count_all().await?);

    let circuits = engine.circuit_metrics();
    println!(
        "⚡ Circuits: upstream {} / store {}",
        circuits.upstream_state, circuits.store_state
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    dump_metrics(&snapshotter);
    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
            let rendered = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
            };
            format!("  {}{} = {}", key.name(), label_str, rendered)
        })
        .collect();
    lines.sort();

    println!("\n📊 Metrics:");
    for line in lines {
        println!("{line}");
    }
}
