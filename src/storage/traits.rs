// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::error::Retryable;
use crate::order::OrderRow;

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Failed to encode/decode row for order {id}: {reason}")]
    Serialization { id: i64, reason: String },
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        // Backend errors cover lock contention, dropped connections and pool timeouts
        matches!(self, Self::Backend(_))
    }
}

/// The local relational order store.
///
/// Upserts are keyed by [`OrderRow::id`] and replace the row wholesale;
/// there is no partial-field merge. Repeated upserts of the same row
/// converge to a single row holding the last-written values.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert-or-replace every row. Returns the number of rows written.
    async fn upsert_batch(&self, rows: &[OrderRow]) -> Result<usize, StorageError>;

    async fn get(&self, id: i64) -> Result<Option<OrderRow>, StorageError>;

    /// Which of `ids` exist locally.
    async fn existing_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StorageError>;

    /// Stored upstream `updated_at` for each of `ids` that exists locally.
    /// Absent ids are omitted from the map.
    async fn updated_at_for(&self, ids: &[i64]) -> Result<HashMap<i64, Option<DateTime<Utc>>>, StorageError>;

    /// Count total rows in store.
    async fn count_all(&self) -> Result<u64, StorageError>;

    /// Rows with `from <= created_at < to`, oldest first.
    async fn scan_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OrderRow>, StorageError>;
}
