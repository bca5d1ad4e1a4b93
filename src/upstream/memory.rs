// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory order source for tests and local tooling.
//!
//! Two shapes:
//! - **scripted**: a fixed list of raw pages served by page number, for
//!   exercising pagination edge cases (repeated pages, bogus metadata)
//! - **catalog**: a mutable set of orders, filtered by window and paginated
//!   per request, newest `updated_at` first, like a real list endpoint
//!
//! Both support failure injection and record every request they receive.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::VecDeque;

use super::{OrderPage, OrderSource, PageMeta, PageRequest};
use crate::error::UpstreamError;
use crate::order::UpstreamOrder;

enum Pages {
    Scripted(Vec<Vec<Value>>),
    Catalog(RwLock<Vec<UpstreamOrder>>),
}

pub struct InMemorySource {
    pages: Pages,
    total_pages: Option<u32>,
    report_meta: bool,
    failures: Mutex<VecDeque<UpstreamError>>,
    requests: Mutex<Vec<PageRequest>>,
}

impl InMemorySource {
    /// Serve `pages` verbatim; page N is `pages[N - 1]`, beyond that pages are empty.
    pub fn scripted(pages: Vec<Vec<UpstreamOrder>>) -> Self {
        let raw = pages
            .into_iter()
            .map(|page| {
                page.iter()
                    .filter_map(|o| serde_json::to_value(o).ok())
                    .collect()
            })
            .collect();
        Self::scripted_raw(raw)
    }

    /// Like [`InMemorySource::scripted`] with undecoded JSON records.
    pub fn scripted_raw(pages: Vec<Vec<Value>>) -> Self {
        Self::with_pages(Pages::Scripted(pages))
    }

    /// Serve a mutable order set, paginated by each request's `per_page`.
    pub fn catalog(orders: Vec<UpstreamOrder>) -> Self {
        Self::with_pages(Pages::Catalog(RwLock::new(orders)))
    }

    fn with_pages(pages: Pages) -> Self {
        Self {
            pages,
            total_pages: None,
            report_meta: true,
            failures: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Report this `total_pages` in page metadata (scripted sources report none by default).
    #[must_use]
    pub fn with_total_pages(mut self, total_pages: u32) -> Self {
        self.total_pages = Some(total_pages);
        self
    }

    /// Omit pagination metadata entirely.
    #[must_use]
    pub fn without_meta(mut self) -> Self {
        self.report_meta = false;
        self
    }

    /// Fail the next request with `error`. Queued failures are consumed in order.
    pub fn push_failure(&self, error: UpstreamError) {
        self.failures.lock().push_back(error);
    }

    /// Fail the next `times` requests with clones of `error`.
    pub fn fail_next(&self, times: usize, error: UpstreamError) {
        let mut failures = self.failures.lock();
        for _ in 0..times {
            failures.push_back(error.clone());
        }
    }

    /// Insert or replace an order in a catalog source. No-op for scripted sources.
    pub fn put(&self, order: UpstreamOrder) {
        if let Pages::Catalog(orders) = &self.pages {
            let mut orders = orders.write();
            match orders.iter_mut().find(|o| o.id == order.id) {
                Some(existing) => *existing = order,
                None => orders.push(order),
            }
        }
    }

    /// Total requests received, failed ones included.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().clone()
    }

    fn serve(&self, request: &PageRequest) -> OrderPage {
        let index = request.page.saturating_sub(1) as usize;
        match &self.pages {
            Pages::Scripted(pages) => {
                let records = pages.get(index).cloned().unwrap_or_default();
                let meta = self.report_meta.then(|| PageMeta {
                    current_page: Some(request.page),
                    total_pages: self.total_pages,
                    total_count: None,
                });
                OrderPage::from_records(records, meta)
            }
            Pages::Catalog(orders) => {
                let mut matching: Vec<UpstreamOrder> = orders
                    .read()
                    .iter()
                    .filter(|o| match (&request.window, o.updated_at) {
                        (Some(window), Some(at)) => window.contains(at),
                        (Some(_), None) => false,
                        (None, _) => true,
                    })
                    .cloned()
                    .collect();
                matching.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));

                let per_page = request.per_page.max(1) as usize;
                let total = matching.len();
                let total_pages = self
                    .total_pages
                    .unwrap_or_else(|| u32::try_from(total.div_ceil(per_page)).unwrap_or(u32::MAX));
                let orders: Vec<UpstreamOrder> =
                    matching.into_iter().skip(index * per_page).take(per_page).collect();
                let meta = self.report_meta.then(|| PageMeta {
                    current_page: Some(request.page),
                    total_pages: Some(total_pages),
                    total_count: Some(total as u64),
                });
                OrderPage { orders, malformed: 0, meta }
            }
        }
    }
}

#[async_trait]
impl OrderSource for InMemorySource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<OrderPage, UpstreamError> {
        self.requests.lock().push(request.clone());
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        Ok(self.serve(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::parse_timestamp;
    use crate::upstream::DateWindow;

    fn order(id: i64, updated: &str) -> UpstreamOrder {
        UpstreamOrder::new(id, parse_timestamp(updated))
    }

    fn request(page: u32, per_page: u32) -> PageRequest {
        PageRequest { page, per_page, window: None }
    }

    #[tokio::test]
    async fn test_scripted_pages_and_past_the_end() {
        let source = InMemorySource::scripted(vec![vec![order(1, "2026-01-01T00:00:00Z")]])
            .with_total_pages(1);

        let first = source.fetch_page(&request(1, 100)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first.meta.unwrap().total_pages, Some(1));

        let second = source.fetch_page(&request(2, 100)).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(source.request_count(), 2);
    }

    #[tokio::test]
    async fn test_catalog_paginates_newest_first() {
        let source = InMemorySource::catalog(vec![
            order(1, "2026-01-01T00:00:00Z"),
            order(2, "2026-01-03T00:00:00Z"),
            order(3, "2026-01-02T00:00:00Z"),
        ]);

        let page = source.fetch_page(&request(1, 2)).await.unwrap();
        assert_eq!(page.orders.iter().map(|o| o.id).collect::<Vec<_>>(), vec![2, 3]);
        let meta = page.meta.unwrap();
        assert_eq!(meta.total_pages, Some(2));
        assert_eq!(meta.total_count, Some(3));

        let page = source.fetch_page(&request(2, 2)).await.unwrap();
        assert_eq!(page.orders.iter().map(|o| o.id).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn test_catalog_filters_by_window() {
        let source = InMemorySource::catalog(vec![
            order(1, "2026-01-01T00:00:00Z"),
            order(2, "2026-01-05T00:00:00Z"),
            UpstreamOrder::new(3, None),
        ]);
        let window = DateWindow {
            from: parse_timestamp("2026-01-04T00:00:00Z").unwrap(),
            to: parse_timestamp("2026-01-06T00:00:00Z").unwrap(),
        };
        let page = source
            .fetch_page(&PageRequest { page: 1, per_page: 10, window: Some(window) })
            .await
            .unwrap();
        assert_eq!(page.orders.iter().map(|o| o.id).collect::<Vec<_>>(), vec![2]);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let source = InMemorySource::catalog(vec![order(1, "2026-01-01T00:00:00Z")]);
        source.fail_next(2, UpstreamError::Status { status: 503, body: String::new() });

        assert!(source.fetch_page(&request(1, 10)).await.is_err());
        assert!(source.fetch_page(&request(1, 10)).await.is_err());
        assert_eq!(source.fetch_page(&request(1, 10)).await.unwrap().len(), 1);
        assert_eq!(source.request_count(), 3);
    }

    #[tokio::test]
    async fn test_put_replaces_catalog_order() {
        let source = InMemorySource::catalog(vec![order(1, "2026-01-01T00:00:00Z")]);
        source.put(order(1, "2026-02-01T00:00:00Z"));
        source.put(order(2, "2026-01-15T00:00:00Z"));

        let page = source.fetch_page(&request(1, 10)).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page.orders[0].updated_at, parse_timestamp("2026-02-01T00:00:00Z"));
    }
}
