// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! JSON-lines sidecar of run reports.
//!
//! One line per run: `{"kind": "sync" | "validation", "recorded_at": ..., "report": {...}}`.
//! The sidecar is diagnostic only; a failed write is logged and dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub kind: String,
    pub recorded_at: DateTime<Utc>,
    pub report: Value,
}

pub struct RunLog {
    path: PathBuf,
    // Serializes appends so concurrent runs never interleave lines
    write_lock: Mutex<()>,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `report` as one line. Returns whether the write succeeded.
    pub async fn append<T: Serialize>(&self, kind: &str, report: &T) -> bool {
        match self.try_append(kind, report).await {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to append run log entry");
                false
            }
        }
    }

    async fn try_append<T: Serialize>(&self, kind: &str, report: &T) -> std::io::Result<()> {
        let entry = RunLogEntry {
            kind: kind.to_string(),
            recorded_at: Utc::now(),
            report: serde_json::to_value(report)?,
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }

    /// Read every entry back, skipping lines that do not parse.
    pub async fn read_all(&self) -> std::io::Result<Vec<RunLogEntry>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
