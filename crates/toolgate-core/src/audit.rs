//! Operational audit sink.
//!
//! Unlike the ledger, the audit log is not tamper-evident: it is a plain
//! JSONL stream for debugging and operational visibility. Decision lines
//! share the ledger's fail-closed write; outcome lines are best-effort.

use std::io::Write as _;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::BoxFuture;
use crate::canonical::format_timestamp;
use crate::policy::Decision;

/// Errors from audit sink writes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditError {
    /// I/O error against the log file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry could not be serialized.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One operational audit line.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// The invocation this line belongs to.
    pub request_id: String,
    /// `"decision"` or `"outcome"`.
    pub event: String,
    /// Fully-qualified callable identity.
    pub action: String,
    /// The decision in force.
    pub decision: Decision,
    /// Human-readable justification.
    pub reason: String,
    /// Outcome status, for outcome lines.
    pub outcome: Option<String>,
    /// Error type, for failed outcomes.
    pub error_type: Option<String>,
    /// Sanitized error message, for failed outcomes.
    pub error: Option<String>,
    /// Free-form extras (already redacted upstream).
    pub metadata: serde_json::Value,
}

impl AuditEntry {
    /// Renders the entry as a single JSON line.
    ///
    /// # Errors
    ///
    /// Returns serialization failures.
    pub fn to_json_line(&self) -> Result<String, AuditError> {
        let value = serde_json::json!({
            "timestamp": format_timestamp(self.timestamp),
            "request_id": self.request_id,
            "event": self.event,
            "action": self.action,
            "decision": self.decision.as_str(),
            "reason": self.reason,
            "outcome": self.outcome,
            "error_type": self.error_type,
            "error": self.error,
            "metadata": self.metadata,
        });
        Ok(serde_json::to_string(&value)?)
    }
}

/// Object-safe async contract for operational audit sinks.
pub trait AuditSink: Send + Sync {
    /// Writes one audit entry.
    fn log<'a>(&'a self, entry: &'a AuditEntry) -> BoxFuture<'a, Result<(), AuditError>>;
}

/// Append-only JSONL audit sink.
#[derive(Debug, Clone)]
pub struct JsonlAuditSink {
    path: PathBuf,
}

impl JsonlAuditSink {
    /// Creates a sink writing to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn log_blocking(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = entry.to_json_line()?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

impl AuditSink for JsonlAuditSink {
    fn log<'a>(&'a self, entry: &'a AuditEntry) -> BoxFuture<'a, Result<(), AuditError>> {
        Box::pin(async move { self.log_blocking(entry) })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn audit_lines_are_appended_json() {
        let dir = TempDir::new().expect("temp dir");
        let sink = JsonlAuditSink::new(dir.path().join("audit.jsonl"));
        let entry = AuditEntry {
            timestamp: Utc::now(),
            request_id: "req-1".to_string(),
            event: "decision".to_string(),
            action: "billing.refund".to_string(),
            decision: Decision::Allow,
            reason: "within limit".to_string(),
            outcome: None,
            error_type: None,
            error: None,
            metadata: serde_json::json!({"reason_code": "POLICY_ALLOW_LOW_RISK"}),
        };
        sink.log(&entry).await.expect("log");
        sink.log(&entry).await.expect("log");

        let contents = std::fs::read_to_string(dir.path().join("audit.jsonl")).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).expect("parse");
        assert_eq!(parsed["event"], "decision");
        assert_eq!(parsed["decision"], "allow");
        assert_eq!(parsed["metadata"]["reason_code"], "POLICY_ALLOW_LOW_RISK");
    }
}
