// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};

use super::traits::{OrderStore, StorageError};
use crate::order::OrderRow;

/// DashMap-backed order store for tests and local tooling.
pub struct InMemoryOrderStore {
    data: DashMap<i64, OrderRow>,
}

impl InMemoryOrderStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Get current row count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remove a row (simulates local data loss)
    pub fn remove(&self, id: i64) -> Option<OrderRow> {
        self.data.remove(&id).map(|(_, row)| row)
    }

    /// Clear all rows
    pub fn clear(&self) {
        self.data.clear();
    }
}

impl Default for InMemoryOrderStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn upsert_batch(&self, rows: &[OrderRow]) -> Result<usize, StorageError> {
        for row in rows {
            self.data.insert(row.id, row.clone());
        }
        Ok(rows.len())
    }

    async fn get(&self, id: i64) -> Result<Option<OrderRow>, StorageError> {
        Ok(self.data.get(&id).map(|r| r.value().clone()))
    }

    async fn existing_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StorageError> {
        Ok(ids.iter().copied().filter(|id| self.data.contains_key(id)).collect())
    }

    async fn updated_at_for(&self, ids: &[i64]) -> Result<HashMap<i64, Option<DateTime<Utc>>>, StorageError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.data.get(id).map(|r| (*id, r.updated_at)))
            .collect())
    }

    async fn count_all(&self) -> Result<u64, StorageError> {
        Ok(self.data.len() as u64)
    }

    async fn scan_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OrderRow>, StorageError> {
        let mut rows: Vec<OrderRow> = self
            .data
            .iter()
            .filter(|r| r.created_at.is_some_and(|c| c >= from && c < to))
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|r| (r.created_at, r.id));
        rows.truncate(limit);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{parse_timestamp, transform, UpstreamOrder};

    fn row(id: i64, updated: &str) -> OrderRow {
        let mut order = UpstreamOrder::new(id, parse_timestamp(updated));
        order.created_at = parse_timestamp(updated);
        transform(&order, Utc::now())
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = InMemoryOrderStore::new();
        assert!(store.is_empty());
        assert_eq!(store.count_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upsert_overwrites_wholesale() {
        let store = InMemoryOrderStore::new();
        let mut first = row(1, "2026-01-01T00:00:00Z");
        first.affiliate_id = Some("aff".into());
        let second = row(1, "2026-01-02T00:00:00Z");

        store.upsert_batch(&[first]).await.unwrap();
        store.upsert_batch(&[second.clone()]).await.unwrap();

        assert_eq!(store.len(), 1);
        let stored = store.get(1).await.unwrap().unwrap();
        assert_eq!(stored, second);
        assert_eq!(stored.affiliate_id, None);
    }

    #[tokio::test]
    async fn test_existence_and_updated_at_lookups() {
        let store = InMemoryOrderStore::new();
        store
            .upsert_batch(&[row(1, "2026-01-01T00:00:00Z"), row(2, "2026-01-02T00:00:00Z")])
            .await
            .unwrap();

        let existing = store.existing_ids(&[1, 2, 3]).await.unwrap();
        assert_eq!(existing, HashSet::from([1, 2]));

        let updated = store.updated_at_for(&[2, 3]).await.unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[&2], parse_timestamp("2026-01-02T00:00:00Z"));
    }

    #[tokio::test]
    async fn test_scan_created_between() {
        let store = InMemoryOrderStore::new();
        store
            .upsert_batch(&[
                row(3, "2026-01-03T00:00:00Z"),
                row(1, "2026-01-01T00:00:00Z"),
                row(2, "2026-01-02T00:00:00Z"),
            ])
            .await
            .unwrap();

        let from = parse_timestamp("2026-01-01T12:00:00Z").unwrap();
        let to = parse_timestamp("2026-01-03T00:00:00Z").unwrap();
        let rows = store.scan_created_between(from, to, 10).await.unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2]);

        let all = store
            .scan_created_between(parse_timestamp("2025-01-01T00:00:00Z").unwrap(), Utc::now(), 2)
            .await
            .unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_concurrent_upserts() {
        use std::sync::Arc;

        let store = Arc::new(InMemoryOrderStore::new());
        let mut handles = vec![];

        for batch in 0..10 {
            let store_clone = store.clone();
            handles.push(tokio::spawn(async move {
                let rows: Vec<OrderRow> = (0..10)
                    .map(|i| row(batch * 10 + i, "2026-01-01T00:00:00Z"))
                    .collect();
                store_clone.upsert_batch(&rows).await.unwrap();
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len(), 100);
    }
}
