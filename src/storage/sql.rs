// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL order store (SQLite or MySQL through the sqlx `Any` driver).
//!
//! Schema:
//! ```sql
//! CREATE TABLE orders (
//!   id BIGINT PRIMARY KEY,           -- upstream identifier, upsert conflict key
//!   order_number, status, payment_status, fulfillment_status, currency,
//!   total_price, subtotal_price, total_tax, total_discounts,   -- decimal strings
//!   customer, line_items, payment_details, refunds,           -- JSON as TEXT
//!   affiliate_id, affiliate_name, affiliate_commission,       -- nullable
//!   refunded_amount TEXT,
//!   chargeback TINYINT, chargeback_at BIGINT,
//!   created_at BIGINT, updated_at BIGINT,                     -- upstream, epoch millis
//!   synced_at BIGINT NOT NULL                                 -- local, epoch millis
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! JSON blobs live in TEXT/LONGTEXT columns because the `Any` driver has no
//! JSON type mapping, and MySQL LONGTEXT comes back as bytes, so text columns
//! are read as `String` first and `Vec<u8>` second. Timestamps are stored as
//! epoch millis since `Any` cannot bind chrono types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing::info;

use super::traits::{OrderStore, StorageError};
use crate::order::{from_millis, OrderRow, Refund};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
use crate::resilience::retry::{Executor, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const COLUMNS: &[&str] = &[
    "id",
    "order_number",
    "status",
    "payment_status",
    "fulfillment_status",
    "currency",
    "total_price",
    "subtotal_price",
    "total_tax",
    "total_discounts",
    "customer",
    "line_items",
    "payment_details",
    "affiliate_id",
    "affiliate_name",
    "affiliate_commission",
    "refunds",
    "refunded_amount",
    "chargeback",
    "chargeback_at",
    "created_at",
    "updated_at",
    "synced_at",
];

/// Bound placeholders per statement stay well under SQLite's variable limit.
const UPSERT_CHUNK_SIZE: usize = 500;
const LOOKUP_CHUNK_SIZE: usize = 500;

pub struct SqlOrderStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlOrderStore {
    /// Connect with startup-mode retry (fails fast if config is wrong) and create the schema.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let startup = Executor::new(
            RetryConfig {
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(2),
                max_retries: 4,
            },
            Arc::new(CircuitBreaker::new("sql_connect", CircuitConfig::default())),
        );
        let pool = startup
            .call("sql_connect", || async {
                AnyPoolOptions::new()
                    .max_connections(if is_sqlite { 1 } else { 10 })
                    .acquire_timeout(Duration::from_secs(10))
                    .idle_timeout(Duration::from_secs(300))
                    .connect(connection_string)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .await
            .map_err(|e| match e {
                CircuitError::Inner(inner) => inner,
                rejected => StorageError::Backend(rejected.to_string()),
            })?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        info!(sqlite = is_sqlite, "Order store ready");
        Ok(store)
    }

    /// Enable WAL (Write-Ahead Logging) mode for SQLite so readers don't block the sync writer.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: Vec<&str> = if self.is_sqlite {
            vec![
                r#"
                CREATE TABLE IF NOT EXISTS orders (
                    id INTEGER PRIMARY KEY,
                    order_number TEXT NOT NULL,
                    status TEXT NOT NULL,
                    payment_status TEXT NOT NULL,
                    fulfillment_status TEXT NOT NULL,
                    currency TEXT NOT NULL,
                    total_price TEXT NOT NULL,
                    subtotal_price TEXT NOT NULL,
                    total_tax TEXT NOT NULL,
                    total_discounts TEXT NOT NULL,
                    customer TEXT NOT NULL,
                    line_items TEXT NOT NULL,
                    payment_details TEXT NOT NULL,
                    affiliate_id TEXT,
                    affiliate_name TEXT,
                    affiliate_commission TEXT,
                    refunds TEXT NOT NULL,
                    refunded_amount TEXT NOT NULL,
                    chargeback INTEGER NOT NULL DEFAULT 0,
                    chargeback_at INTEGER,
                    created_at INTEGER,
                    updated_at INTEGER,
                    synced_at INTEGER NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders (created_at)",
                "CREATE INDEX IF NOT EXISTS idx_orders_updated_at ON orders (updated_at)",
            ]
        } else {
            vec![
                r#"
                CREATE TABLE IF NOT EXISTS orders (
                    id BIGINT PRIMARY KEY,
                    order_number VARCHAR(64) NOT NULL,
                    status VARCHAR(64) NOT NULL,
                    payment_status VARCHAR(64) NOT NULL,
                    fulfillment_status VARCHAR(64) NOT NULL,
                    currency VARCHAR(8) NOT NULL,
                    total_price VARCHAR(32) NOT NULL,
                    subtotal_price VARCHAR(32) NOT NULL,
                    total_tax VARCHAR(32) NOT NULL,
                    total_discounts VARCHAR(32) NOT NULL,
                    customer LONGTEXT NOT NULL,
                    line_items LONGTEXT NOT NULL,
                    payment_details LONGTEXT NOT NULL,
                    affiliate_id VARCHAR(128),
                    affiliate_name VARCHAR(255),
                    affiliate_commission VARCHAR(32),
                    refunds LONGTEXT NOT NULL,
                    refunded_amount VARCHAR(32) NOT NULL,
                    chargeback TINYINT NOT NULL DEFAULT 0,
                    chargeback_at BIGINT,
                    created_at BIGINT,
                    updated_at BIGINT,
                    synced_at BIGINT NOT NULL,
                    INDEX idx_orders_created_at (created_at),
                    INDEX idx_orders_updated_at (updated_at)
                )
                "#,
            ]
        };

        for sql in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }

        Ok(())
    }

    fn upsert_sql(&self, rows: usize) -> String {
        let row_placeholder = format!("({})", vec!["?"; COLUMNS.len()].join(", "));
        let placeholders = vec![row_placeholder.as_str(); rows].join(", ");
        let updates: Vec<String> = COLUMNS
            .iter()
            .skip(1)
            .map(|col| {
                if self.is_sqlite {
                    format!("{col} = excluded.{col}")
                } else {
                    format!("{col} = VALUES({col})")
                }
            })
            .collect();
        let conflict = if self.is_sqlite {
            "ON CONFLICT(id) DO UPDATE SET"
        } else {
            "ON DUPLICATE KEY UPDATE"
        };
        format!(
            "INSERT INTO orders ({}) VALUES {} {} {}",
            COLUMNS.join(", "),
            placeholders,
            conflict,
            updates.join(", ")
        )
    }

    async fn upsert_chunk(&self, chunk: &[OrderRow]) -> Result<usize, StorageError> {
        let prepared = chunk
            .iter()
            .map(PreparedRow::from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let sql = self.upsert_sql(prepared.len());
        let mut query = sqlx::query(&sql);
        for row in &prepared {
            query = query
                .bind(row.id)
                .bind(row.order_number.as_str())
                .bind(row.status.as_str())
                .bind(row.payment_status.as_str())
                .bind(row.fulfillment_status.as_str())
                .bind(row.currency.as_str())
                .bind(row.total_price.as_str())
                .bind(row.subtotal_price.as_str())
                .bind(row.total_tax.as_str())
                .bind(row.total_discounts.as_str())
                .bind(row.customer.as_str())
                .bind(row.line_items.as_str())
                .bind(row.payment_details.as_str())
                .bind(row.affiliate_id.clone())
                .bind(row.affiliate_name.clone())
                .bind(row.affiliate_commission.clone())
                .bind(row.refunds.as_str())
                .bind(row.refunded_amount.as_str())
                .bind(row.chargeback)
                .bind(row.chargeback_at)
                .bind(row.created_at)
                .bind(row.updated_at)
                .bind(row.synced_at);
        }

        query
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(chunk.len())
    }

    fn id_list_sql(&self, select: &str, count: usize) -> String {
        format!(
            "SELECT {} FROM orders WHERE id IN ({})",
            select,
            vec!["?"; count].join(", ")
        )
    }

    async fn fetch_by_ids(&self, select: &str, ids: &[i64]) -> Result<Vec<AnyRow>, StorageError> {
        let mut rows = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(LOOKUP_CHUNK_SIZE) {
            let sql = self.id_list_sql(select, chunk.len());
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(*id);
            }
            let found = query
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            rows.extend(found);
        }
        Ok(rows)
    }
}

/// An [`OrderRow`] flattened to bindable column values.
struct PreparedRow {
    id: i64,
    order_number: String,
    status: String,
    payment_status: String,
    fulfillment_status: String,
    currency: String,
    total_price: String,
    subtotal_price: String,
    total_tax: String,
    total_discounts: String,
    customer: String,
    line_items: String,
    payment_details: String,
    affiliate_id: Option<String>,
    affiliate_name: Option<String>,
    affiliate_commission: Option<String>,
    refunds: String,
    refunded_amount: String,
    chargeback: i64,
    chargeback_at: Option<i64>,
    created_at: Option<i64>,
    updated_at: Option<i64>,
    synced_at: i64,
}

impl PreparedRow {
    fn from_row(row: &OrderRow) -> Result<Self, StorageError> {
        let encode = |value: &dyn erased::Json| {
            value.to_json().map_err(|e| StorageError::Serialization {
                id: row.id,
                reason: e.to_string(),
            })
        };

        Ok(Self {
            id: row.id,
            order_number: row.order_number.clone(),
            status: row.status.clone(),
            payment_status: row.payment_status.clone(),
            fulfillment_status: row.fulfillment_status.clone(),
            currency: row.currency.clone(),
            total_price: row.total_price.clone(),
            subtotal_price: row.subtotal_price.clone(),
            total_tax: row.total_tax.clone(),
            total_discounts: row.total_discounts.clone(),
            customer: encode(&row.customer)?,
            line_items: encode(&row.line_items)?,
            payment_details: encode(&row.payment_details)?,
            affiliate_id: row.affiliate_id.clone(),
            affiliate_name: row.affiliate_name.clone(),
            affiliate_commission: row.affiliate_commission.clone(),
            refunds: encode(&row.refunds)?,
            refunded_amount: row.refunded_amount.clone(),
            chargeback: i64::from(row.chargeback),
            chargeback_at: row.chargeback_at.map(|t| t.timestamp_millis()),
            created_at: row.created_at.map(|t| t.timestamp_millis()),
            updated_at: row.updated_at.map(|t| t.timestamp_millis()),
            synced_at: row.synced_at.timestamp_millis(),
        })
    }
}

mod erased {
    /// Object-safe JSON encoding so one closure can serialize differently typed fields.
    pub(super) trait Json {
        fn to_json(&self) -> Result<String, serde_json::Error>;
    }

    impl<T: serde::Serialize> Json for T {
        fn to_json(&self) -> Result<String, serde_json::Error> {
            serde_json::to_string(self)
        }
    }
}

/// Read a text column: String first (SQLite TEXT), then bytes (MySQL LONGTEXT).
fn text_column(row: &AnyRow, name: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(name)
        .ok()
        .flatten()
        .or_else(|| {
            row.try_get::<Option<Vec<u8>>, _>(name)
                .ok()
                .flatten()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
}

fn millis_column(row: &AnyRow, name: &str) -> Option<DateTime<Utc>> {
    row.try_get::<Option<i64>, _>(name).ok().flatten().and_then(from_millis)
}

fn decode_row(row: &AnyRow) -> Result<OrderRow, StorageError> {
    let id: i64 = row
        .try_get("id")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let json = |name: &str| -> Result<serde_json::Value, StorageError> {
        match text_column(row, name) {
            Some(s) => serde_json::from_str(&s).map_err(|e| StorageError::Serialization {
                id,
                reason: format!("{name}: {e}"),
            }),
            None => Ok(serde_json::Value::Null),
        }
    };
    let refunds: Vec<Refund> = match text_column(row, "refunds") {
        Some(s) => serde_json::from_str(&s).map_err(|e| StorageError::Serialization {
            id,
            reason: format!("refunds: {e}"),
        })?,
        None => Vec::new(),
    };
    let synced_at = millis_column(row, "synced_at").ok_or_else(|| StorageError::Serialization {
        id,
        reason: "synced_at missing".to_string(),
    })?;

    Ok(OrderRow {
        id,
        order_number: text_column(row, "order_number").unwrap_or_default(),
        status: text_column(row, "status").unwrap_or_default(),
        payment_status: text_column(row, "payment_status").unwrap_or_default(),
        fulfillment_status: text_column(row, "fulfillment_status").unwrap_or_default(),
        currency: text_column(row, "currency").unwrap_or_default(),
        total_price: text_column(row, "total_price").unwrap_or_default(),
        subtotal_price: text_column(row, "subtotal_price").unwrap_or_default(),
        total_tax: text_column(row, "total_tax").unwrap_or_default(),
        total_discounts: text_column(row, "total_discounts").unwrap_or_default(),
        customer: json("customer")?,
        line_items: json("line_items")?,
        payment_details: json("payment_details")?,
        affiliate_id: text_column(row, "affiliate_id"),
        affiliate_name: text_column(row, "affiliate_name"),
        affiliate_commission: text_column(row, "affiliate_commission"),
        refunds,
        refunded_amount: text_column(row, "refunded_amount").unwrap_or_default(),
        chargeback: row.try_get::<i64, _>("chargeback").unwrap_or(0) != 0,
        chargeback_at: millis_column(row, "chargeback_at"),
        created_at: millis_column(row, "created_at"),
        updated_at: millis_column(row, "updated_at"),
        synced_at,
    })
}

#[async_trait]
impl OrderStore for SqlOrderStore {
    async fn upsert_batch(&self, rows: &[OrderRow]) -> Result<usize, StorageError> {
        let mut written = 0;
        for chunk in rows.chunks(UPSERT_CHUNK_SIZE) {
            written += self.upsert_chunk(chunk).await?;
        }
        crate::metrics::record_rows_written(written);
        Ok(written)
    }

    async fn get(&self, id: i64) -> Result<Option<OrderRow>, StorageError> {
        let sql = format!("SELECT {} FROM orders WHERE id = ?", COLUMNS.join(", "));
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn existing_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StorageError> {
        let rows = self.fetch_by_ids("id", ids).await?;
        rows.iter()
            .map(|r| r.try_get::<i64, _>("id").map_err(|e| StorageError::Backend(e.to_string())))
            .collect()
    }

    async fn updated_at_for(&self, ids: &[i64]) -> Result<HashMap<i64, Option<DateTime<Utc>>>, StorageError> {
        let rows = self.fetch_by_ids("id, updated_at", ids).await?;
        rows.iter()
            .map(|r| {
                let id = r
                    .try_get::<i64, _>("id")
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                Ok((id, millis_column(r, "updated_at")))
            })
            .collect()
    }

    async fn count_all(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM orders")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let count: i64 = row
            .try_get("cnt")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(count.max(0) as u64)
    }

    async fn scan_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OrderRow>, StorageError> {
        let sql = format!(
            "SELECT {} FROM orders WHERE created_at >= ? AND created_at < ? ORDER BY created_at, id LIMIT ?",
            COLUMNS.join(", ")
        );
        let rows = sqlx::query(&sql)
            .bind(from.timestamp_millis())
            .bind(to.timestamp_millis())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.iter().map(decode_row).collect()
    }
}
