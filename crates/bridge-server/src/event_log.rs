//! Append-only event log
//!
//! One JSON line per pipeline step outcome. The log is the durable record of
//! exactly which remote entities a run touched, for audit and manual
//! reconciliation; a failure to write it only degrades auditability, so it is
//! logged and swallowed rather than failing the request.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// One structured record in the event log
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub timestamp: String,
    /// Form identifier or webhook source
    pub source: String,
    /// Step name, e.g. `deal.create`, `file.upload`
    pub step: String,
    /// Entity kind touched, e.g. `deal`, `contact`, `file`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl EventRecord {
    /// A new record stamped with the current time
    pub fn new(source: &str, step: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            source: source.to_string(),
            step: step.to_string(),
            entity: None,
            entity_id: None,
            success: true,
            error: None,
            extra: None,
        }
    }

    pub fn entity(mut self, kind: &str, id: Option<String>) -> Self {
        self.entity = Some(kind.to_string());
        self.entity_id = id;
        self
    }

    pub fn failed(mut self, error: impl ToString) -> Self {
        self.success = false;
        self.error = Some(error.to_string());
        self
    }

    pub fn extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// Append-only JSON Lines event log
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append one record; write failures are logged, never propagated
    pub async fn append(&self, record: EventRecord) {
        if let Err(err) = self.try_append(&record).await {
            warn!(%err, step = %record.step, "Failed to write event log record");
        }
    }

    async fn try_append(&self, record: &EventRecord) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
