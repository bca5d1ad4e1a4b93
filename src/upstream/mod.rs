// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The upstream order API, seen as a source of numbered pages.
//!
//! A page response is either a bare JSON array of orders or an envelope:
//!
//! ```json
//! { "data": [ {...}, {...} ],
//!   "meta": { "current_page": 1, "total_pages": 3, "total": 250 } }
//! ```
//!
//! `orders` is accepted in place of `data`, `pagination` in place of `meta`,
//! and `last_page` / `total_count` as aliases. Records are decoded one by one
//! so a single malformed order never fails the page.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::UpstreamError;
use crate::order::UpstreamOrder;

pub use http::HttpOrderSource;
pub use memory::InMemorySource;

/// Inclusive `updated_at` filter sent upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl DateWindow {
    /// The `hours` leading up to `now`.
    #[must_use]
    pub fn trailing_hours(hours: u32, now: DateTime<Utc>) -> Self {
        Self {
            from: now - ChronoDuration::hours(i64::from(hours)),
            to: now,
        }
    }

    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.from && at <= self.to
    }
}

/// One page request. Pages are 1-indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
    pub window: Option<DateWindow>,
}

/// Optional pagination metadata returned alongside a page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMeta {
    pub current_page: Option<u32>,
    pub total_pages: Option<u32>,
    pub total_count: Option<u64>,
}

/// A decoded page.
#[derive(Debug, Clone, Default)]
pub struct OrderPage {
    pub orders: Vec<UpstreamOrder>,
    /// Records on this page that could not be decoded
    pub malformed: usize,
    pub meta: Option<PageMeta>,
}

impl OrderPage {
    /// Decode raw records, counting the ones that fail.
    pub fn from_records(records: Vec<Value>, meta: Option<PageMeta>) -> Self {
        let (orders, malformed) = UpstreamOrder::decode_all(records);
        Self { orders, malformed, meta }
    }

    /// Decode a full response body (bare array or `{data, meta}` envelope).
    pub fn from_body(body: Value) -> Result<Self, UpstreamError> {
        match body {
            Value::Array(records) => Ok(Self::from_records(records, None)),
            Value::Object(mut obj) => {
                let records = ["data", "orders"]
                    .iter()
                    .find_map(|k| match obj.remove(*k) {
                        Some(Value::Array(records)) => Some(records),
                        _ => None,
                    })
                    .ok_or_else(|| {
                        UpstreamError::Decode("response envelope has no `data` array".to_string())
                    })?;
                let meta = ["meta", "pagination"]
                    .iter()
                    .find_map(|k| obj.get(*k).and_then(Value::as_object))
                    .map(parse_meta);
                Ok(Self::from_records(records, meta))
            }
            other => Err(UpstreamError::Decode(format!(
                "expected an array or object, got {}",
                type_name(&other)
            ))),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.orders.len()
    }

    /// Records the upstream returned, decodable or not.
    #[must_use]
    pub fn raw_len(&self) -> usize {
        self.orders.len() + self.malformed
    }

    /// True when the upstream returned no records at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw_len() == 0
    }
}

fn parse_meta(obj: &Map<String, Value>) -> PageMeta {
    let number = |keys: &[&str]| -> Option<u64> {
        keys.iter().find_map(|k| match obj.get(*k)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    };
    PageMeta {
        current_page: number(&["current_page", "page"]).and_then(|n| u32::try_from(n).ok()),
        total_pages: number(&["total_pages", "last_page", "pages"]).and_then(|n| u32::try_from(n).ok()),
        total_count: number(&["total", "total_count", "count"]),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A paginated order list endpoint.
#[async_trait]
pub trait OrderSource: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<OrderPage, UpstreamError>;
}
