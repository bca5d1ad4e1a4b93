// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Inbound order webhooks.
//!
//! A best-effort supplement to polling: a pushed order goes through the same
//! transform + upsert path as a sync run, but nothing relies on webhooks for
//! correctness. Accepted bodies:
//!
//! ```json
//! {"event": "order.updated", "order": {"id": 1001, ...}}
//! {"event": "order.updated", "data": {"id": 1001, ...}}
//! {"id": 1001, ...}
//! ```
//!
//! Signatures are hex HMAC-SHA256 of the raw body, optionally prefixed `sha256=`.
//! Bad signatures and unparseable bodies are rejected with a client-error status
//! and always logged.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::order::UpstreamOrder;
use crate::orchestrator::SyncOrchestrator;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature header missing")]
    Missing,
    #[error("signature is not valid hex")]
    Malformed,
    #[error("signature mismatch")]
    Mismatch,
}

/// Pass/fail check of a webhook body against its signature header.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, body: &[u8], signature: Option<&str>) -> Result<(), SignatureError>;
}

pub struct HmacSha256Verifier {
    keyed: HmacSha256,
}

impl HmacSha256Verifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, hmac::digest::InvalidLength> {
        Ok(Self {
            keyed: HmacSha256::new_from_slice(secret.as_ref())?,
        })
    }

    /// Hex signature of `body`, as a sender would compute it.
    #[must_use]
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac = self.keyed.clone();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }
}

impl SignatureVerifier for HmacSha256Verifier {
    fn verify(&self, body: &[u8], signature: Option<&str>) -> Result<(), SignatureError> {
        let signature = signature.map(str::trim).filter(|s| !s.is_empty()).ok_or(SignatureError::Missing)?;
        let hex_sig = signature.strip_prefix("sha256=").unwrap_or(signature);
        let expected = hex::decode(hex_sig).map_err(|_| SignatureError::Malformed)?;

        let mut mac = self.keyed.clone();
        mac.update(body);
        // Constant-time comparison
        mac.verify_slice(&expected).map_err(|_| SignatureError::Mismatch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The order was upserted
    Accepted { order_id: i64, event: Option<String> },
    /// Signature or body rejected; client-error equivalent
    Rejected { status: u16, reason: String },
    /// Valid request the store could not persist
    Failed { status: u16, reason: String },
}

impl WebhookOutcome {
    /// HTTP-equivalent status for the caller's transport.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Accepted { .. } => 200,
            Self::Rejected { status, .. } | Self::Failed { status, .. } => *status,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "accepted",
            Self::Rejected { .. } => "rejected",
            Self::Failed { .. } => "failed",
        }
    }
}

pub struct WebhookHandler {
    verifier: Option<Arc<dyn SignatureVerifier>>,
    orchestrator: Arc<SyncOrchestrator>,
}

impl WebhookHandler {
    /// With `verifier` unset, signatures are not checked.
    pub fn new(verifier: Option<Arc<dyn SignatureVerifier>>, orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self { verifier, orchestrator }
    }

    #[instrument(skip_all, fields(bytes = body.len()))]
    pub async fn handle(&self, body: &[u8], signature: Option<&str>) -> WebhookOutcome {
        let outcome = self.process(body, signature).await;
        crate::metrics::record_webhook(outcome.label());
        match &outcome {
            WebhookOutcome::Accepted { order_id, event } => {
                info!(order_id, event = event.as_deref().unwrap_or("-"), "Webhook order upserted");
            }
            WebhookOutcome::Rejected { status, reason } => {
                warn!(status, reason = %reason, "Webhook rejected");
            }
            WebhookOutcome::Failed { status, reason } => {
                warn!(status, reason = %reason, "Webhook order could not be persisted");
            }
        }
        outcome
    }

    async fn process(&self, body: &[u8], signature: Option<&str>) -> WebhookOutcome {
        if let Some(verifier) = &self.verifier {
            if let Err(e) = verifier.verify(body, signature) {
                return WebhookOutcome::Rejected {
                    status: 401,
                    reason: e.to_string(),
                };
            }
        }

        let (event, order) = match parse_body(body) {
            Ok(parsed) => parsed,
            Err(reason) => return WebhookOutcome::Rejected { status: 400, reason },
        };

        let persisted = self.orchestrator.persist(std::slice::from_ref(&order)).await;
        if persisted.failed_batches > 0 {
            return WebhookOutcome::Failed {
                status: 500,
                reason: format!("order {} could not be written", order.id),
            };
        }
        WebhookOutcome::Accepted {
            order_id: order.id,
            event,
        }
    }
}

fn parse_body(body: &[u8]) -> Result<(Option<String>, UpstreamOrder), String> {
    let value: Value = serde_json::from_slice(body).map_err(|e| format!("invalid JSON: {e}"))?;
    let Value::Object(mut obj) = value else {
        return Err("webhook body must be a JSON object".to_string());
    };

    let event = obj.get("event").and_then(Value::as_str).map(str::to_string);
    let payload = match ["order", "data"].iter().find_map(|k| obj.remove(*k)) {
        Some(inner @ Value::Object(_)) => inner,
        Some(_) => return Err("order payload must be a JSON object".to_string()),
        None if event.is_some() => return Err("event envelope carries no order".to_string()),
        None => Value::Object(obj),
    };

    UpstreamOrder::from_value(payload)
        .map(|order| (event, order))
        .map_err(|e| format!("invalid order: {e}"))
}
