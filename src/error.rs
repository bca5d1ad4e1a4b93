// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types shared across the sync engine.
//!
//! Each layer has its own `thiserror` enum:
//! - [`UpstreamError`] for the remote order API
//! - [`crate::storage::StorageError`] for the local store
//! - [`crate::resilience::circuit_breaker::CircuitError`] for fail-fast rejections
//! - [`SyncError`] for whole runs
//!
//! The [`Retryable`] trait is the default predicate the executor uses to decide
//! whether a failed attempt is worth repeating.

use std::time::Duration;
use thiserror::Error;

use crate::resilience::circuit_breaker::CircuitError;
use crate::storage::StorageError;

/// Classifies an error as transient (worth retrying) or permanent.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Markers seen in transport/gateway error messages that indicate a transient fault.
const TRANSIENT_MARKERS: &[&str] = &[
    "econnreset",
    "connection reset",
    "etimedout",
    "timed out",
    "socket hang up",
    "gateway timeout",
    "bad gateway",
    "service unavailable",
    "504",
];

/// Returns true when a free-form error message carries a known transient marker.
#[must_use]
pub fn has_transient_marker(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Errors returned by the upstream order API.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    /// The call did not complete within its deadline.
    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),

    /// Could not reach the upstream (refused, reset, DNS).
    #[error("upstream connection failed: {0}")]
    Connection(String),

    /// The upstream answered with a non-success status.
    #[error("upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body could not be decoded.
    #[error("failed to decode upstream response: {0}")]
    Decode(String),

    /// Anything else reported by the transport.
    #[error("upstream request failed: {0}")]
    Request(String),
}

impl Retryable for UpstreamError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) => true,
            // 4xx is never retried, even when the body looks transient
            Self::Status { status, .. } => (500..600).contains(status),
            Self::Decode(_) => false,
            Self::Request(msg) => has_transient_marker(msg),
        }
    }
}

/// Errors that abort a whole sync or validation run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("upstream fetch failed: {0}")]
    Upstream(#[from] CircuitError<UpstreamError>),

    #[error("store operation failed: {0}")]
    Storage(#[from] CircuitError<StorageError>),

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_upstream_errors_are_retryable() {
        assert!(UpstreamError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(UpstreamError::Connection("refused".into()).is_retryable());
        assert!(UpstreamError::Status { status: 502, body: String::new() }.is_retryable());
        assert!(UpstreamError::Status { status: 504, body: "Gateway Timeout".into() }.is_retryable());
        assert!(UpstreamError::Request("read ECONNRESET".into()).is_retryable());
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        assert!(!UpstreamError::Status { status: 400, body: "bad page".into() }.is_retryable());
        assert!(!UpstreamError::Status { status: 401, body: String::new() }.is_retryable());
        assert!(!UpstreamError::Status { status: 404, body: "gateway timeout".into() }.is_retryable());
        assert!(!UpstreamError::Status { status: 429, body: String::new() }.is_retryable());
        assert!(!UpstreamError::Decode("expected array".into()).is_retryable());
        assert!(!UpstreamError::Request("invalid url".into()).is_retryable());
    }

    #[test]
    fn test_transient_marker_matching_is_case_insensitive() {
        assert!(has_transient_marker("Socket Hang Up"));
        assert!(has_transient_marker("upstream: GATEWAY TIMEOUT"));
        assert!(!has_transient_marker("validation failed"));
    }
}
