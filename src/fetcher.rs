// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sequential page walker with identifier dedup.
//!
//! Pages are requested one at a time from page 1, each through the upstream
//! [`Executor`] (retry + breaker). A fetch stops normally when any of:
//!
//! | Condition | [`StopReason`] |
//! |---|---|
//! | a page has zero records | `EmptyPage` |
//! | `duplicate_page_limit` consecutive pages contain only already-seen ids | `DuplicatePages` |
//! | the `total_pages` reported by page 1 has been requested | `TotalPagesReached` |
//! | the page ceiling has been requested | `PageCeiling` |
//!
//! A short page is not a stop condition, and neither is a page whose records
//! all failed to decode: it counts toward the duplicate streak instead.
//! `total_pages` is read from page 1 only and never trusted on its own.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::UpstreamError;
use crate::order::UpstreamOrder;
use crate::resilience::circuit_breaker::CircuitError;
use crate::resilience::retry::Executor;
use crate::upstream::{DateWindow, OrderSource, PageRequest};

/// Consecutive all-duplicate pages tolerated before giving up.
pub const DEFAULT_DUPLICATE_PAGE_LIMIT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EmptyPage,
    DuplicatePages,
    TotalPagesReached,
    PageCeiling,
}

impl StopReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyPage => "empty_page",
            Self::DuplicatePages => "duplicate_pages",
            Self::TotalPagesReached => "total_pages_reached",
            Self::PageCeiling => "page_ceiling",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to fetch.
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub window: Option<DateWindow>,
    /// Safety ceiling on pages requested
    pub max_pages: u32,
}

/// Result of one paginated fetch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Unique by id, in first-seen order
    pub orders: Vec<UpstreamOrder>,
    pub pages_requested: u32,
    /// Records dropped because their id was already seen
    pub duplicates: usize,
    /// Records that could not be decoded
    pub malformed: usize,
    /// Upstream retries across all pages
    pub retries: u32,
    pub stop_reason: StopReason,
    /// `total_count` from page 1's metadata, if any
    pub reported_total: Option<u64>,
}

pub struct PaginatedFetcher {
    source: Arc<dyn OrderSource>,
    executor: Executor,
    page_size: u32,
    duplicate_page_limit: u32,
}

impl PaginatedFetcher {
    pub fn new(source: Arc<dyn OrderSource>, executor: Executor, page_size: u32) -> Self {
        Self {
            source,
            executor,
            page_size: page_size.max(1),
            duplicate_page_limit: DEFAULT_DUPLICATE_PAGE_LIMIT,
        }
    }

    #[must_use]
    pub fn with_duplicate_page_limit(mut self, limit: u32) -> Self {
        self.duplicate_page_limit = limit.max(1);
        self
    }

    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    #[must_use]
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Walk pages until a stop condition holds. Fails only when a page cannot
    /// be fetched after retries or the upstream breaker is open.
    #[instrument(skip(self), fields(max_pages = options.max_pages, windowed = options.window.is_some()))]
    pub async fn fetch(&self, options: FetchOptions) -> Result<FetchOutcome, CircuitError<UpstreamError>> {
        let mut seen: HashSet<i64> = HashSet::new();
        let mut orders: Vec<UpstreamOrder> = Vec::new();
        let mut duplicates = 0usize;
        let mut malformed = 0usize;
        let mut retries = 0u32;
        let mut consecutive_duplicate_pages = 0u32;
        let mut total_pages: Option<u32> = None;
        let mut reported_total: Option<u64> = None;
        let mut page = 0u32;

        let stop_reason = loop {
            if page >= options.max_pages {
                break StopReason::PageCeiling;
            }
            if total_pages.is_some_and(|total| page >= total) {
                break StopReason::TotalPagesReached;
            }
            page += 1;

            let request = PageRequest {
                page,
                per_page: self.page_size,
                window: options.window,
            };
            let (result, page_retries) = self
                .executor
                .call_tracked(
                    "fetch_page",
                    |e: &UpstreamError| crate::error::Retryable::is_retryable(e),
                    || self.source.fetch_page(&request),
                )
                .await;
            retries += page_retries;
            let fetched = result?;

            if page == 1 {
                if let Some(meta) = fetched.meta {
                    total_pages = meta.total_pages;
                    reported_total = meta.total_count;
                }
            }
            malformed += fetched.malformed;

            if fetched.is_empty() {
                crate::metrics::record_page(false);
                break StopReason::EmptyPage;
            }

            let mut fresh = 0usize;
            for order in fetched.orders {
                if seen.insert(order.id) {
                    orders.push(order);
                    fresh += 1;
                } else {
                    duplicates += 1;
                }
            }

            crate::metrics::record_page(fresh == 0);
            if fresh == 0 {
                consecutive_duplicate_pages += 1;
                warn!(page, consecutive = consecutive_duplicate_pages, "Page contained no new orders");
                if consecutive_duplicate_pages >= self.duplicate_page_limit {
                    break StopReason::DuplicatePages;
                }
            } else {
                consecutive_duplicate_pages = 0;
            }
            debug!(page, fresh, total = orders.len(), "Fetched page");
        };

        crate::metrics::record_fetch_stop(stop_reason.as_str());
        info!(
            pages = page,
            unique = orders.len(),
            duplicates,
            malformed,
            stop_reason = %stop_reason,
            "Paginated fetch finished"
        );

        Ok(FetchOutcome {
            orders,
            pages_requested: page,
            duplicates,
            malformed,
            retries,
            stop_reason,
            reported_total,
        })
    }
}
