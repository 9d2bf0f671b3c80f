//! Append-only audit trail.
//!
//! Every state change of every compliance operation lands here as one JSON
//! line, written before the change becomes visible anywhere else. A failed
//! append means the action itself must be treated as failed by the caller.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    domain::{OperationId, OperationStatus, OperationType, SubjectId},
    errors::Error,
    Result,
};

const AUDIT_MAX_TEXT: usize = 500;

/// One line of the audit trail.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub recorded_at: DateTime<Utc>,
    pub operation_id: OperationId,
    pub subject_id: SubjectId,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub authorized_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AuditEntry {
    pub fn new(
        operation_id: &OperationId,
        subject_id: &SubjectId,
        operation_type: OperationType,
        status: OperationStatus,
        authorized_by: &str,
        details: Option<serde_json::Value>,
    ) -> Self {
        Self {
            recorded_at: Utc::now(),
            operation_id: operation_id.clone(),
            subject_id: subject_id.clone(),
            operation_type,
            status,
            authorized_by: authorized_by.to_string(),
            details,
        }
    }
}

/// Append-only JSONL audit log.
///
/// One mutex serialises appends so concurrent operations never interleave
/// partial lines. Queries take the same lock to read a consistent snapshot.
pub struct AuditLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, mut entry: AuditEntry) -> Result<()> {
        // Bound free-text payloads; the archive holds the full data, not the log.
        if let Some(v) = &entry.details {
            entry.details = Some(truncate_json_strings(v, AUDIT_MAX_TEXT));
        }
        let line =
            serde_json::to_string(&entry).map_err(|e| Error::AuditWrite(e.to_string()))?;

        let _guard = self.lock.lock().await;
        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            writeln!(file, "{line}")?;
            Ok(())
        };
        write().map_err(|e| Error::AuditWrite(e.to_string()))
    }

    /// Full trail for one subject, oldest first.
    pub async fn for_subject(&self, subject: &SubjectId) -> Result<Vec<AuditEntry>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|e| &e.subject_id == subject)
            .collect())
    }

    /// Full trail for one operation, oldest first.
    pub async fn for_operation(&self, operation: &OperationId) -> Result<Vec<AuditEntry>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|e| &e.operation_id == operation)
            .collect())
    }

    async fn read_all(&self) -> Result<Vec<AuditEntry>> {
        let _guard = self.lock.lock().await;
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let txt = std::fs::read_to_string(&self.path)?;

        let mut out = Vec::new();
        for line in txt.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            // A line that does not parse means the trail was tampered with or
            // torn; surface it instead of skipping.
            out.push(serde_json::from_str::<AuditEntry>(line)?);
        }
        Ok(out)
    }
}

fn truncate_text(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}

fn truncate_json_strings(v: &serde_json::Value, max_str_len: usize) -> serde_json::Value {
    match v {
        serde_json::Value::String(s) => serde_json::Value::String(truncate_text(s, max_str_len)),
        serde_json::Value::Array(xs) => serde_json::Value::Array(
            xs.iter()
                .map(|x| truncate_json_strings(x, max_str_len))
                .collect(),
        ),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), truncate_json_strings(v, max_str_len)))
                .collect(),
        ),
        other => other.clone(),
    }
}
