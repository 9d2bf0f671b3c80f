//! Operation records and their lifecycle.
//!
//! Every compliance request becomes a `ComplianceOperation` persisted as one
//! JSON file under the operations directory. Status changes go through
//! `OperationStore::transition`, the single place that enforces the forward
//! order and writes the audit entry before the change becomes visible.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    audit::{AuditEntry, AuditLog},
    domain::{OperationId, OperationStatus, OperationType, SubjectId, WorkspaceId},
    errors::Error,
    Result,
};

/// Durable record of one compliance operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComplianceOperation {
    pub operation_id: OperationId,
    pub subject_id: SubjectId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<WorkspaceId>,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub requested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub authorized_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
}

impl ComplianceOperation {
    pub fn new(
        subject_id: SubjectId,
        workspace_id: Option<WorkspaceId>,
        operation_type: OperationType,
        authorized_by: &str,
    ) -> Self {
        Self {
            operation_id: OperationId::generate(),
            subject_id,
            workspace_id,
            operation_type,
            status: OperationStatus::Pending,
            requested_at: Utc::now(),
            completed_at: None,
            authorized_by: authorized_by.to_string(),
            failure_reason: None,
            detail: serde_json::Value::Null,
        }
    }
}

/// Store of operation records: per-operation JSON files plus an in-memory map
/// of `Arc<Mutex<_>>` handles so writes to one operation serialise without a
/// global lock.
pub struct OperationStore {
    dir: PathBuf,
    audit: Arc<AuditLog>,
    ops: Mutex<HashMap<OperationId, Arc<Mutex<ComplianceOperation>>>>,
}

impl OperationStore {
    pub fn new(dir: impl Into<PathBuf>, audit: Arc<AuditLog>) -> Self {
        Self {
            dir: dir.into(),
            audit,
            ops: Mutex::new(HashMap::new()),
        }
    }

    /// Register a fresh operation. The pending audit entry is appended first;
    /// if that fails the operation never comes into existence.
    pub async fn create(&self, op: ComplianceOperation) -> Result<ComplianceOperation> {
        let details = match &op.detail {
            serde_json::Value::Null => None,
            d => Some(d.clone()),
        };
        self.audit
            .append(AuditEntry::new(
                &op.operation_id,
                &op.subject_id,
                op.operation_type,
                op.status,
                &op.authorized_by,
                details,
            ))
            .await?;

        std::fs::create_dir_all(&self.dir)?;
        save_operation_file(&self.op_path(&op.operation_id), &op)?;

        let mut map = self.ops.lock().await;
        map.insert(op.operation_id.clone(), Arc::new(Mutex::new(op.clone())));
        Ok(op)
    }

    /// Move an operation forward.
    ///
    /// Order per call: validate the transition, append the audit entry,
    /// persist, then make the new status visible in memory. A failed audit
    /// append leaves the operation exactly as it was.
    pub async fn transition(
        &self,
        id: &OperationId,
        next: OperationStatus,
        detail: Option<serde_json::Value>,
        failure_reason: Option<String>,
    ) -> Result<ComplianceOperation> {
        let handle = self.handle(id).await?;
        let mut guard = handle.lock().await;

        if !guard.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: guard.status,
                to: next,
            });
        }

        let mut updated = guard.clone();
        updated.status = next;
        if next.is_terminal() {
            updated.completed_at = Some(Utc::now());
        }
        if let Some(d) = detail {
            updated.detail = d;
        }
        if failure_reason.is_some() {
            updated.failure_reason = failure_reason;
        }

        let audit_details = match (&updated.failure_reason, &updated.detail) {
            (Some(reason), d) => Some(serde_json::json!({
                "failure_reason": reason,
                "detail": d,
            })),
            (None, serde_json::Value::Null) => None,
            (None, d) => Some(d.clone()),
        };
        self.audit
            .append(AuditEntry::new(
                &updated.operation_id,
                &updated.subject_id,
                updated.operation_type,
                next,
                &updated.authorized_by,
                audit_details,
            ))
            .await?;

        save_operation_file(&self.op_path(id), &updated)?;
        *guard = updated.clone();
        Ok(updated)
    }

    /// Current record for an operation, from memory or disk.
    pub async fn get(&self, id: &OperationId) -> Result<ComplianceOperation> {
        let handle = self.handle(id).await?;
        let guard = handle.lock().await;
        Ok(guard.clone())
    }

    async fn handle(&self, id: &OperationId) -> Result<Arc<Mutex<ComplianceOperation>>> {
        let mut map = self.ops.lock().await;
        if let Some(h) = map.get(id) {
            return Ok(h.clone());
        }

        // Disk fallback keeps operations from previous runs queryable.
        let Some(op) = load_operation_file(&self.op_path(id))? else {
            return Err(Error::NotFound(format!("operation {id}")));
        };
        let h = Arc::new(Mutex::new(op));
        map.insert(id.clone(), h.clone());
        Ok(h)
    }

    fn op_path(&self, id: &OperationId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

fn load_operation_file(path: &std::path::Path) -> Result<Option<ComplianceOperation>> {
    if !path.exists() {
        return Ok(None);
    }
    let txt = std::fs::read_to_string(path)?;
    if txt.trim().is_empty() {
        return Ok(None);
    }
    let op: ComplianceOperation = serde_json::from_str(&txt)?;
    Ok(Some(op))
}

fn save_operation_file(path: &std::path::Path, op: &ComplianceOperation) -> Result<()> {
    let txt = serde_json::to_string(op)?;
    std::fs::write(path, txt)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tmp(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_millis();
        let pid = std::process::id();
        PathBuf::from(format!("/tmp/{prefix}-{pid}-{ts}"))
    }

    fn store(base: &std::path::Path) -> (OperationStore, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::new(base.join("audit.jsonl")));
        (
            OperationStore::new(base.join("operations"), Arc::clone(&audit)),
            audit,
        )
    }

    fn op(subject: &str) -> ComplianceOperation {
        ComplianceOperation::new(
            SubjectId(subject.to_string()),
            None,
            OperationType::Erasure,
            "dpo@example.com",
        )
    }

    #[tokio::test]
    async fn create_is_audited_and_queryable() {
        let base = tmp("dsr-ops");
        std::fs::create_dir_all(&base).unwrap();
        let (store, audit) = store(&base);

        let created = store.create(op("alice")).await.unwrap();
        let got = store.get(&created.operation_id).await.unwrap();
        assert_eq!(got.status, OperationStatus::Pending);

        let trail = audit.for_operation(&created.operation_id).await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].status, OperationStatus::Pending);
    }

    #[tokio::test]
    async fn full_lifecycle_audits_every_step() {
        let base = tmp("dsr-ops-life");
        std::fs::create_dir_all(&base).unwrap();
        let (store, audit) = store(&base);

        let created = store.create(op("alice")).await.unwrap();
        store
            .transition(&created.operation_id, OperationStatus::InProgress, None, None)
            .await
            .unwrap();
        let done = store
            .transition(
                &created.operation_id,
                OperationStatus::Completed,
                Some(serde_json::json!({"stores_processed": 2})),
                None,
            )
            .await
            .unwrap();

        assert_eq!(done.status, OperationStatus::Completed);
        assert!(done.completed_at.is_some());

        let trail = audit.for_operation(&created.operation_id).await.unwrap();
        let statuses: Vec<_> = trail.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![
                OperationStatus::Pending,
                OperationStatus::InProgress,
                OperationStatus::Completed
            ]
        );
    }

    #[tokio::test]
    async fn terminal_status_rejects_further_transitions() {
        let base = tmp("dsr-ops-term");
        std::fs::create_dir_all(&base).unwrap();
        let (store, audit) = store(&base);

        let created = store.create(op("alice")).await.unwrap();
        store
            .transition(&created.operation_id, OperationStatus::Failed, None, Some("boom".to_string()))
            .await
            .unwrap();

        let err = store
            .transition(&created.operation_id, OperationStatus::Completed, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        // Rejected transition leaves no audit entry and no record change.
        let got = store.get(&created.operation_id).await.unwrap();
        assert_eq!(got.status, OperationStatus::Failed);
        assert_eq!(got.failure_reason.as_deref(), Some("boom"));
        let trail = audit.for_operation(&created.operation_id).await.unwrap();
        assert_eq!(trail.len(), 2);
    }

    #[tokio::test]
    async fn records_survive_a_fresh_store() {
        let base = tmp("dsr-ops-reload");
        std::fs::create_dir_all(&base).unwrap();

        let id = {
            let (store, _) = store(&base);
            let created = store.create(op("alice")).await.unwrap();
            store
                .transition(&created.operation_id, OperationStatus::InProgress, None, None)
                .await
                .unwrap();
            created.operation_id
        };

        let (fresh, _) = store(&base);
        let got = fresh.get(&id).await.unwrap();
        assert_eq!(got.status, OperationStatus::InProgress);
    }

    #[tokio::test]
    async fn unknown_operation_is_not_found() {
        let base = tmp("dsr-ops-missing");
        std::fs::create_dir_all(&base).unwrap();
        let (store, _) = store(&base);

        let err = store.get(&OperationId::generate()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn failed_audit_append_blocks_the_change() {
        let base = tmp("dsr-ops-noaudit");
        std::fs::create_dir_all(&base).unwrap();

        // Appending to a directory path fails.
        let audit_dir = base.join("audit-as-dir");
        std::fs::create_dir_all(&audit_dir).unwrap();
        let audit = Arc::new(AuditLog::new(&audit_dir));
        let store = OperationStore::new(base.join("operations"), Arc::clone(&audit));

        let err = store.create(op("alice")).await.unwrap_err();
        assert!(matches!(err, Error::AuditWrite(_)));
        assert!(!base.join("operations").exists());
    }

    #[tokio::test]
    async fn racing_terminal_transitions_have_one_winner() {
        let base = tmp("dsr-ops-race");
        std::fs::create_dir_all(&base).unwrap();
        let (store, audit) = store(&base);
        let store = Arc::new(store);

        let created = store.create(op("alice")).await.unwrap();
        store
            .transition(&created.operation_id, OperationStatus::InProgress, None, None)
            .await
            .unwrap();

        let a = {
            let store = Arc::clone(&store);
            let id = created.operation_id.clone();
            tokio::spawn(async move {
                store
                    .transition(&id, OperationStatus::Completed, None, None)
                    .await
            })
        };
        let b = {
            let store = Arc::clone(&store);
            let id = created.operation_id.clone();
            tokio::spawn(async move {
                store
                    .transition(&id, OperationStatus::Failed, None, Some("late".to_string()))
                    .await
            })
        };

        let ra = a.await.unwrap();
        let rb = b.await.unwrap();
        assert!(ra.is_ok() != rb.is_ok(), "exactly one transition must win");

        let got = store.get(&created.operation_id).await.unwrap();
        assert!(got.status.is_terminal());

        // pending + in_progress + exactly one terminal entry.
        let trail = audit.for_operation(&created.operation_id).await.unwrap();
        assert_eq!(trail.len(), 3);
    }
}
