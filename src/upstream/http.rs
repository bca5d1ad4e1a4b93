// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! reqwest client for the upstream `GET {base}/orders` list endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{OrderPage, OrderSource, PageRequest};
use crate::config::SyncConfig;
use crate::error::UpstreamError;

/// Longest error body kept in [`UpstreamError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Pages are requested newest-first (`sort=updated_at&order=desc`) so the
/// leading pages are the most recent orders the reconciler samples.
pub struct HttpOrderSource {
    client: Client,
    orders_url: String,
    api_token: Option<String>,
    timeout: Duration,
}

impl HttpOrderSource {
    pub fn new(
        base_url: &str,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(UpstreamError::Request("upstream base URL is empty".to_string()));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| UpstreamError::Request(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            orders_url: format!("{base_url}/orders"),
            api_token,
            timeout,
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, UpstreamError> {
        Self::new(&config.api_base_url, config.api_token.clone(), config.request_timeout())
    }

    async fn send(&self, request: &PageRequest) -> Result<OrderPage, UpstreamError> {
        let mut builder = self
            .client
            .get(&self.orders_url)
            .query(&query_params(request))
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| self.map_request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            crate::metrics::record_upstream_response(if status.is_server_error() { "5xx" } else { "4xx" });
            let mut body = response.text().await.unwrap_or_default();
            truncate_on_char_boundary(&mut body, MAX_ERROR_BODY);
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response.json().await.map_err(|e| self.map_request_error(e))?;
        crate::metrics::record_upstream_response("2xx");
        OrderPage::from_body(body)
    }

    fn map_request_error(&self, error: reqwest::Error) -> UpstreamError {
        if error.is_timeout() {
            crate::metrics::record_upstream_response("timeout");
            UpstreamError::Timeout(self.timeout)
        } else if error.is_connect() {
            crate::metrics::record_upstream_response("connection");
            UpstreamError::Connection(error.to_string())
        } else if error.is_decode() {
            UpstreamError::Decode(error.to_string())
        } else {
            UpstreamError::Request(error.to_string())
        }
    }
}

#[async_trait]
impl OrderSource for HttpOrderSource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<OrderPage, UpstreamError> {
        let _timer = crate::time_operation!("upstream", "fetch_page");
        debug!(page = request.page, per_page = request.per_page, "Requesting upstream page");
        match tokio::time::timeout(self.timeout, self.send(request)).await {
            Ok(result) => result,
            Err(_) => {
                crate::metrics::record_upstream_response("timeout");
                Err(UpstreamError::Timeout(self.timeout))
            }
        }
    }
}

fn query_params(request: &PageRequest) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("page", request.page.to_string()),
        ("per_page", request.per_page.to_string()),
        ("sort", "updated_at".to_string()),
        ("order", "desc".to_string()),
    ];
    if let Some(window) = &request.window {
        params.push(("updated_from", window.from.to_rfc3339()));
        params.push(("updated_to", window.to.to_rfc3339()));
    }
    params
}

fn truncate_on_char_boundary(s: &mut String, max: usize) {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Retryable;
    use crate::order::parse_timestamp;
    use crate::upstream::DateWindow;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the raw request head.
    async fn one_shot_server(status_line: &str, body: &str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut head = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                head.extend_from_slice(&buf[..n]);
                if n == 0 || head.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&head).to_string()
        });
        (format!("http://{addr}"), handle)
    }

    #[test]
    fn test_query_params_request_newest_first() {
        let params = query_params(&PageRequest { page: 1, per_page: 100, window: None });
        assert!(params.contains(&("sort", "updated_at".to_string())));
        assert!(params.contains(&("order", "desc".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "updated_from"));
    }

    #[test]
    fn test_query_params_include_window() {
        let window = DateWindow {
            from: parse_timestamp("2026-01-01T00:00:00Z").unwrap(),
            to: parse_timestamp("2026-01-02T00:00:00Z").unwrap(),
        };
        let params = query_params(&PageRequest { page: 3, per_page: 50, window: Some(window) });
        assert_eq!(params[0], ("page", "3".to_string()));
        assert_eq!(params[1], ("per_page", "50".to_string()));
        assert_eq!(params[4].0, "updated_from");
        assert_eq!(params[5].0, "updated_to");
        assert!(params[5].1.starts_with("2026-01-02T00:00:00"));
    }

    #[test]
    fn test_empty_base_url_rejected() {
        assert!(HttpOrderSource::new("  ", None, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_fetches_envelope_with_bearer_auth() {
        let (base, server) = one_shot_server(
            "200 OK",
            r#"{"data":[{"id":1,"total":"9.99"},{"id":2}],"meta":{"current_page":1,"total_pages":1,"total":2}}"#,
        )
        .await;
        let source = HttpOrderSource::new(&base, Some("tok".into()), Duration::from_secs(5)).unwrap();

        let page = source
            .fetch_page(&PageRequest { page: 1, per_page: 100, window: None })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page.meta.unwrap().total_pages, Some(1));

        let head = server.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /orders?page=1&per_page=100 "));
        assert!(head.contains("authorization: bearer tok"));
    }

    #[tokio::test]
    async fn test_server_error_maps_to_retryable_status() {
        let (base, server) = one_shot_server("503 Service Unavailable", r#"{"error":"busy"}"#).await;
        let source = HttpOrderSource::new(&base, None, Duration::from_secs(5)).unwrap();

        let err = source
            .fetch_page(&PageRequest { page: 1, per_page: 10, window: None })
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Status { status: 503, .. }));
        assert!(err.is_retryable());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_error_is_not_retryable() {
        let (base, server) = one_shot_server("422 Unprocessable Entity", r#"{"error":"bad page"}"#).await;
        let source = HttpOrderSource::new(&base, None, Duration::from_secs(5)).unwrap();

        let err = source
            .fetch_page(&PageRequest { page: 0, per_page: 10, window: None })
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Status { status: 422, ref body } if body.contains("bad page")));
        assert!(!err.is_retryable());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connection_is_retryable() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let source = HttpOrderSource::new(&format!("http://{addr}"), None, Duration::from_secs(5)).unwrap();
        let err = source
            .fetch_page(&PageRequest { page: 1, per_page: 10, window: None })
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Connection(_) | UpstreamError::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let mut s = "é".repeat(10);
        truncate_on_char_boundary(&mut s, 5);
        assert_eq!(s, "éé");
    }
}
