// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound run alerts.
//!
//! Delivery is best-effort: a sink that cannot deliver logs the failure and
//! returns `false`, it never fails the run that raised the alert.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A leveled message with structured context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub message: String,
    pub context: Value,
}

impl Alert {
    pub fn new(level: AlertLevel, message: impl Into<String>, context: Value) -> Self {
        Self {
            level,
            message: message.into(),
            context,
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver `alert`. Returns whether delivery succeeded; never errors.
    async fn send(&self, alert: &Alert) -> bool;
}

/// Writes alerts to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn send(&self, alert: &Alert) -> bool {
        match alert.level {
            AlertLevel::Info => info!(context = %alert.context, "{}", alert.message),
            AlertLevel::Warning => warn!(context = %alert.context, "{}", alert.message),
            AlertLevel::Critical => error!(context = %alert.context, "{}", alert.message),
        }
        crate::metrics::record_alert(alert.level.as_str(), true);
        true
    }
}

/// POSTs `{level, message, context}` JSON to a URL.
pub struct WebhookAlertSink {
    client: Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn send(&self, alert: &Alert) -> bool {
        let delivered = match self.client.post(&self.url).json(alert).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(status = response.status().as_u16(), level = %alert.level, "Alert webhook rejected alert");
                false
            }
            Err(e) => {
                warn!(error = %e, level = %alert.level, "Alert webhook unreachable");
                false
            }
        };
        crate::metrics::record_alert(alert.level.as_str(), delivered);
        delivered
    }
}

/// Log locally, then forward to an optional remote sink.
pub struct CompositeAlertSink {
    local: TracingAlertSink,
    remote: Option<Box<dyn AlertSink>>,
}

impl CompositeAlertSink {
    pub fn new(remote: Option<Box<dyn AlertSink>>) -> Self {
        Self {
            local: TracingAlertSink,
            remote,
        }
    }
}

#[async_trait]
impl AlertSink for CompositeAlertSink {
    async fn send(&self, alert: &Alert) -> bool {
        self.local.send(alert).await;
        match &self.remote {
            Some(remote) => remote.send(alert).await,
            None => true,
        }
    }
}
