//! Compliance engine: the single entry point for data subject rights requests.
//!
//! Every request follows the same path: validate the subject id, authorize the
//! actor, register an audited operation, then do the work. Export and erasure
//! run in background workers so dispatch returns an operation id immediately;
//! restriction and locate finish inline. Workers are tracked in a handle map
//! and wound down through one cancellation token on shutdown.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::Utc;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    archive::{build_export_bundle, ArchiveMeta, ArchiveStore},
    audit::{AuditEntry, AuditLog},
    config::{Config, ErasurePolicy},
    crypto,
    domain::{OperationId, OperationStatus, OperationType, SubjectId, WorkspaceId},
    errors::Error,
    locator::{DataLocator, LocationReport},
    operations::{ComplianceOperation, OperationStore},
    ports::{Authorizer, EraseMode, EraseReport, StoreAdapter, StoreSection},
    restriction::{RestrictionFlag, RestrictionStore},
    security::{validate_store_name, validate_subject_id},
    Result,
};

#[derive(Clone, Copy)]
enum WorkKind {
    Export,
    Erasure,
}

/// What a worker hands back for the terminal transition.
struct OperationOutcome {
    status: OperationStatus,
    detail: serde_json::Value,
    failure_reason: Option<String>,
}

#[derive(Clone)]
pub struct ComplianceEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for ComplianceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComplianceEngine").finish_non_exhaustive()
    }
}

struct EngineInner {
    cfg: Arc<Config>,
    authorizer: Arc<dyn Authorizer>,
    locator: Arc<DataLocator>,
    audit: Arc<AuditLog>,
    operations: Arc<OperationStore>,
    restrictions: RestrictionStore,
    archives: Arc<ArchiveStore>,
    workers: Mutex<HashMap<OperationId, JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl ComplianceEngine {
    pub fn new(
        cfg: Arc<Config>,
        stores: Vec<Arc<dyn StoreAdapter>>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for store in &stores {
            validate_store_name(store.name())?;
            if !seen.insert(store.name().to_string()) {
                return Err(Error::Config(format!(
                    "store name registered twice: {}",
                    store.name()
                )));
            }
        }

        let audit = Arc::new(AuditLog::new(&cfg.audit_log_path));
        let operations = Arc::new(OperationStore::new(cfg.operations_dir(), Arc::clone(&audit)));
        let restrictions = RestrictionStore::new(cfg.restrictions_dir());
        let archives = Arc::new(ArchiveStore::new(
            cfg.archives_dir(),
            cfg.secret.clone(),
            cfg.export_retention_days,
        ));
        let locator = Arc::new(DataLocator::new(stores, cfg.store_timeout));

        Ok(Self {
            inner: Arc::new(EngineInner {
                cfg,
                authorizer,
                locator,
                audit,
                operations,
                restrictions,
                archives,
                workers: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Right of access / portability: build an encrypted export archive.
    ///
    /// Returns as soon as the operation is dispatched; the archive is built by
    /// a background worker. Poll `status` or call `await_terminal`.
    pub async fn export_user_data(
        &self,
        actor: &str,
        subject: &SubjectId,
        workspace: Option<&WorkspaceId>,
    ) -> Result<OperationId> {
        validate_subject_id(&subject.0)?;
        self.authorize(actor, OperationType::Export, subject)
            .await?;

        let op = ComplianceOperation::new(
            subject.clone(),
            workspace.cloned(),
            OperationType::Export,
            actor,
        );
        let op = self.inner.operations.create(op).await?;
        let op = self
            .inner
            .operations
            .transition(&op.operation_id, OperationStatus::InProgress, None, None)
            .await?;

        let id = op.operation_id.clone();
        self.spawn_worker(op, WorkKind::Export).await;
        Ok(id)
    }

    /// Right to erasure: apply each store's configured policy (delete or
    /// anonymize) to everything the locator finds. Re-running after success is
    /// a no-op that still completes.
    pub async fn delete_user_data(
        &self,
        actor: &str,
        subject: &SubjectId,
        workspace: Option<&WorkspaceId>,
        reason: Option<&str>,
    ) -> Result<OperationId> {
        validate_subject_id(&subject.0)?;
        self.authorize(actor, OperationType::Erasure, subject)
            .await?;

        let mut op = ComplianceOperation::new(
            subject.clone(),
            workspace.cloned(),
            OperationType::Erasure,
            actor,
        );
        if let Some(reason) = reason {
            op.detail = serde_json::json!({ "reason": reason });
        }
        let op = self.inner.operations.create(op).await?;
        let op = self
            .inner
            .operations
            .transition(&op.operation_id, OperationStatus::InProgress, None, None)
            .await?;

        let id = op.operation_id.clone();
        self.spawn_worker(op, WorkKind::Erasure).await;
        Ok(id)
    }

    /// Right to restriction: set the durable flag. Enforcement is on whoever
    /// processes the subject's data; they check `is_restricted` first.
    pub async fn restrict_processing(
        &self,
        actor: &str,
        subject: &SubjectId,
    ) -> Result<ComplianceOperation> {
        self.set_restriction(actor, subject, true, OperationType::RestrictProcessing)
            .await
    }

    pub async fn lift_restriction(
        &self,
        actor: &str,
        subject: &SubjectId,
    ) -> Result<ComplianceOperation> {
        self.set_restriction(actor, subject, false, OperationType::LiftRestriction)
            .await
    }

    /// Plain read, not audited: this sits on the hot path of every processor
    /// that honours restriction flags.
    pub async fn is_restricted(&self, subject: &SubjectId) -> Result<bool> {
        self.inner.restrictions.is_restricted(subject).await
    }

    pub async fn restriction(&self, subject: &SubjectId) -> Result<Option<RestrictionFlag>> {
        self.inner.restrictions.get(subject).await
    }

    /// Transparency: ask every registered store where the subject's data
    /// lives. Runs inline and is audited like any other operation.
    pub async fn get_data_locations(
        &self,
        actor: &str,
        subject: &SubjectId,
        workspace: Option<&WorkspaceId>,
    ) -> Result<(ComplianceOperation, LocationReport)> {
        validate_subject_id(&subject.0)?;
        self.authorize(actor, OperationType::Locate, subject)
            .await?;

        let op = ComplianceOperation::new(
            subject.clone(),
            workspace.cloned(),
            OperationType::Locate,
            actor,
        );
        let op = self.inner.operations.create(op).await?;
        let op = self
            .inner
            .operations
            .transition(&op.operation_id, OperationStatus::InProgress, None, None)
            .await?;

        match self.inner.locator.locate(subject, workspace).await {
            Ok(report) => {
                let op = self
                    .inner
                    .operations
                    .transition(
                        &op.operation_id,
                        OperationStatus::Completed,
                        Some(serde_json::json!({
                            "locations": report.locations.len(),
                            "unreachable": report.unreachable.len(),
                        })),
                        None,
                    )
                    .await?;
                Ok((op, report))
            }
            Err(e) => {
                self.finalize_failed(&op.operation_id, &e).await;
                Err(e)
            }
        }
    }

    pub async fn status(&self, id: &OperationId) -> Result<ComplianceOperation> {
        self.inner.operations.get(id).await
    }

    /// Wait for a dispatched operation's worker to finish, then return the
    /// terminal record. Operations without a live worker return immediately.
    pub async fn await_terminal(&self, id: &OperationId) -> Result<ComplianceOperation> {
        let handle = {
            let mut workers = self.inner.workers.lock().await;
            workers.remove(id)
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("worker for operation {id} panicked: {e}");
            }
        }
        self.inner.operations.get(id).await
    }

    /// Cancel all in-flight workers and wait for each to finalise its
    /// operation as failed. Nothing is left in `in_progress`.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles: Vec<_> = {
            let mut workers = self.inner.workers.lock().await;
            workers.drain().collect()
        };
        for (id, handle) in handles {
            if let Err(e) = handle.await {
                tracing::error!("worker for operation {id} did not stop cleanly: {e}");
            }
        }
    }

    /// Drop export archives past their retention window. Operation records
    /// and the audit log are kept; only archive blobs and sidecars go.
    pub fn purge_expired_archives(&self) -> Result<Vec<OperationId>> {
        self.inner.archives.purge_expired(Utc::now())
    }

    pub fn archive_meta(&self, id: &OperationId) -> Result<Option<ArchiveMeta>> {
        self.inner.archives.meta(id)
    }

    /// Decrypt a stored export archive back to the plaintext zip.
    pub fn open_archive(&self, id: &OperationId) -> Result<Vec<u8>> {
        self.inner.archives.open(id)
    }

    pub async fn audit_trail(&self, subject: &SubjectId) -> Result<Vec<AuditEntry>> {
        self.inner.audit.for_subject(subject).await
    }

    pub async fn audit_trail_for_operation(&self, id: &OperationId) -> Result<Vec<AuditEntry>> {
        self.inner.audit.for_operation(id).await
    }

    /// Authorization check; a denial is itself written to the audit log.
    async fn authorize(
        &self,
        actor: &str,
        operation: OperationType,
        subject: &SubjectId,
    ) -> Result<()> {
        match self
            .inner
            .authorizer
            .authorize(actor, operation, subject)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                let entry = AuditEntry::new(
                    &OperationId::generate(),
                    subject,
                    operation,
                    OperationStatus::Failed,
                    actor,
                    Some(serde_json::json!({ "denied": e.to_string() })),
                );
                if let Err(audit_e) = self.inner.audit.append(entry).await {
                    tracing::error!("could not audit denied request: {audit_e}");
                }
                Err(e)
            }
        }
    }

    async fn set_restriction(
        &self,
        actor: &str,
        subject: &SubjectId,
        restricted: bool,
        op_type: OperationType,
    ) -> Result<ComplianceOperation> {
        validate_subject_id(&subject.0)?;
        self.authorize(actor, op_type, subject).await?;

        let op = ComplianceOperation::new(subject.clone(), None, op_type, actor);
        let op = self.inner.operations.create(op).await?;
        let op = self
            .inner
            .operations
            .transition(&op.operation_id, OperationStatus::InProgress, None, None)
            .await?;

        match self.inner.restrictions.set(subject, restricted, actor).await {
            Ok(flag) => {
                self.inner
                    .operations
                    .transition(
                        &op.operation_id,
                        OperationStatus::Completed,
                        Some(serde_json::json!({
                            "restricted": flag.restricted,
                            "set_at": flag.set_at,
                        })),
                        None,
                    )
                    .await
            }
            Err(e) => {
                self.finalize_failed(&op.operation_id, &e).await;
                Err(e)
            }
        }
    }

    /// Best-effort terminal failure mark. A failure to record the failure is
    /// logged and swallowed so the original error reaches the caller.
    async fn finalize_failed(&self, id: &OperationId, cause: &Error) {
        let res = self
            .inner
            .operations
            .transition(id, OperationStatus::Failed, None, Some(cause.to_string()))
            .await;
        if let Err(e) = res {
            tracing::error!("could not mark operation {id} failed: {e}");
        }
    }

    /// The handle is in the map before dispatch returns, so `await_terminal`
    /// called right after dispatch always finds the worker.
    async fn spawn_worker(&self, op: ComplianceOperation, kind: WorkKind) {
        let engine = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let id = op.operation_id.clone();

        let mut workers = self.inner.workers.lock().await;
        let handle = tokio::spawn(async move {
            engine.run_operation(op, kind, shutdown).await;
        });
        workers.insert(id, handle);
    }

    async fn run_operation(
        &self,
        op: ComplianceOperation,
        kind: WorkKind,
        shutdown: CancellationToken,
    ) {
        let id = op.operation_id.clone();

        // Cancellation abandons the work future; store calls already in
        // flight keep running but their results are discarded.
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => None,
            res = async {
                match kind {
                    WorkKind::Export => self.run_export(&op).await,
                    WorkKind::Erasure => self.run_erasure(&op).await,
                }
            } => Some(res),
        };

        let (status, detail, failure_reason) = match outcome {
            Some(Ok(out)) => (out.status, Some(out.detail), out.failure_reason),
            Some(Err(e)) => {
                tracing::error!("operation {id} aborted: {e}");
                (OperationStatus::Failed, None, Some(e.to_string()))
            }
            None => (
                OperationStatus::Failed,
                None,
                Some("shutdown requested before completion".to_string()),
            ),
        };

        if let Err(e) = self
            .inner
            .operations
            .transition(&id, status, detail, failure_reason)
            .await
        {
            tracing::error!("could not finalise operation {id}: {e}");
        }
    }

    async fn run_export(&self, op: &ComplianceOperation) -> Result<OperationOutcome> {
        let subject = &op.subject_id;
        let report = self
            .inner
            .locator
            .locate(subject, op.workspace_id.as_ref())
            .await?;

        // One section per store that holds data, however many locations it
        // reported.
        let store_names = dedupe_store_names(&report);

        let mut handles = Vec::new();
        for name in &store_names {
            let Some(store) = self.inner.locator.store_by_name(name) else {
                continue;
            };
            let subject = subject.clone();
            let workspace = op.workspace_id.clone();
            let timeout = self.inner.cfg.store_timeout;
            let task_name = name.clone();
            let handle = tokio::spawn(async move {
                match tokio::time::timeout(
                    timeout,
                    store.export_section(&subject, workspace.as_ref()),
                )
                .await
                {
                    Ok(res) => res,
                    Err(_) => Err(Error::store(
                        &task_name,
                        format!("export timed out after {timeout:?}"),
                    )),
                }
            });
            handles.push((name.clone(), handle));
        }

        let mut sections: Vec<StoreSection> = Vec::new();
        let mut failed: Vec<(String, String)> = Vec::new();
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(section)) => sections.push(section),
                Ok(Err(e)) => {
                    tracing::warn!("export section {name} failed: {e}");
                    failed.push((name, e.to_string()));
                }
                Err(e) => {
                    tracing::warn!("export task for {name} failed: {e}");
                    failed.push((name, format!("export task failed: {e}")));
                }
            }
        }

        let failed_detail: Vec<serde_json::Value> = failed
            .iter()
            .map(|(n, r)| serde_json::json!({ "store_name": n, "reason": r }))
            .collect();

        // Data was located but no section could be read: failing beats
        // shipping an archive that silently misses known data.
        if !store_names.is_empty() && sections.is_empty() {
            return Ok(OperationOutcome {
                status: OperationStatus::Failed,
                detail: serde_json::json!({
                    "sections_failed": failed_detail,
                    "unreachable_at_locate": report.unreachable,
                }),
                failure_reason: Some("no store section could be exported".to_string()),
            });
        }

        sections.sort_by(|a, b| a.store_name.cmp(&b.store_name));
        let bundle = build_export_bundle(subject, &sections, &self.inner.cfg.privacy_contact)?;
        let meta = self.inner.archives.store(
            &op.operation_id,
            subject,
            &bundle,
            sections.iter().map(|s| s.store_name.clone()).collect(),
            failed.iter().map(|(n, _)| n.clone()).collect(),
        )?;

        Ok(OperationOutcome {
            status: OperationStatus::Completed,
            detail: serde_json::json!({
                "archive": {
                    "path": self.inner.archives.blob_path(&op.operation_id).display().to_string(),
                    "sha256": meta.sha256,
                    "size": meta.size,
                    "expires_at": meta.expires_at,
                },
                "sections_included": meta.sections_included,
                "sections_failed": failed_detail,
                "unreachable_at_locate": report.unreachable,
            }),
            failure_reason: None,
        })
    }

    async fn run_erasure(&self, op: &ComplianceOperation) -> Result<OperationOutcome> {
        let subject = &op.subject_id;
        let report = self
            .inner
            .locator
            .locate(subject, op.workspace_id.as_ref())
            .await?;

        let store_names = dedupe_store_names(&report);

        // The pseudonym is derived, never stored: the same subject and secret
        // always yield the same token, which keeps erasure re-runnable.
        let token = crypto::pseudonym_token(&self.inner.cfg.secret, &subject.0);

        let mut handles = Vec::new();
        for name in &store_names {
            let Some(store) = self.inner.locator.store_by_name(name) else {
                continue;
            };
            let mode = match self.inner.cfg.erasure_policy_for(name) {
                ErasurePolicy::Delete => EraseMode::Delete,
                ErasurePolicy::Anonymize => EraseMode::Anonymize {
                    token: token.clone(),
                },
            };
            let subject = subject.clone();
            let timeout = self.inner.cfg.store_timeout;
            let task_name = name.clone();
            let handle = tokio::spawn(async move {
                match tokio::time::timeout(timeout, store.erase(&subject, &mode)).await {
                    Ok(res) => res,
                    Err(_) => Err(Error::store(
                        &task_name,
                        format!("erase timed out after {timeout:?}"),
                    )),
                }
            });
            handles.push((name.clone(), handle));
        }

        let mut reports: Vec<EraseReport> = Vec::new();
        let mut failed: Vec<(String, String)> = Vec::new();
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(r)) => reports.push(r),
                Ok(Err(e)) => {
                    tracing::warn!("erase in {name} failed: {e}");
                    failed.push((name, e.to_string()));
                }
                Err(e) => {
                    tracing::warn!("erase task for {name} failed: {e}");
                    failed.push((name, format!("erase task failed: {e}")));
                }
            }
        }

        reports.sort_by(|a, b| a.store_name.cmp(&b.store_name));
        let mut detail = serde_json::json!({
            "stores_processed": reports,
            "stores_failed": failed
                .iter()
                .map(|(n, r)| serde_json::json!({ "store_name": n, "reason": r }))
                .collect::<Vec<_>>(),
            "unreachable_at_locate": report.unreachable,
        });
        if let Some(reason) = op.detail.get("reason") {
            detail["reason"] = reason.clone();
        }

        if failed.is_empty() {
            Ok(OperationOutcome {
                status: OperationStatus::Completed,
                detail,
                failure_reason: None,
            })
        } else {
            Ok(OperationOutcome {
                status: OperationStatus::Failed,
                detail,
                failure_reason: Some(format!(
                    "{} of {} stores failed to erase",
                    failed.len(),
                    store_names.len()
                )),
            })
        }
    }
}

fn dedupe_store_names(report: &LocationReport) -> Vec<String> {
    let mut names = Vec::new();
    for loc in &report.locations {
        if !names.iter().any(|n| n == &loc.store_name) {
            names.push(loc.store_name.clone());
        }
    }
    names
}
