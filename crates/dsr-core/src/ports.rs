use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    domain::{OperationType, StoreKind, SubjectId, WorkspaceId},
    errors::Error,
    Result,
};

/// One place inside a store where a subject's data lives, as reported by
/// `locate`: a table, a directory, a remote collection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataLocation {
    pub store_kind: StoreKind,
    pub store_name: String,
    pub resource: String,
    /// Locator-level hint only; export reads the authoritative records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_count_hint: Option<u64>,
}

/// One store's contribution to an export archive.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreSection {
    pub store_kind: StoreKind,
    pub store_name: String,
    pub records: serde_json::Value,
    pub record_count: u64,
}

/// What erasure should do to the subject's records in one store.
#[derive(Clone, Debug)]
pub enum EraseMode {
    Delete,
    /// Replace identifying values with the irreversible pseudonym `token`.
    Anonymize { token: String },
}

impl EraseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EraseMode::Delete => "delete",
            EraseMode::Anonymize { .. } => "anonymize",
        }
    }
}

/// Result of one store's erase call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EraseReport {
    pub store_name: String,
    pub mode: String,
    pub records_affected: u64,
}

/// Hexagonal port fronting one data store.
///
/// `locate` must be side-effect free. Implementations map transport failures
/// into `Error::Store` so the engine can tell a per-store failure from an
/// engine-fatal one. Every method gets a deadline from the engine; adapters
/// do not need their own retry loops.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    fn kind(&self) -> StoreKind;
    fn name(&self) -> &str;

    /// Find this store's holdings for a subject. Empty when it has none.
    async fn locate(
        &self,
        subject: &SubjectId,
        workspace: Option<&WorkspaceId>,
    ) -> Result<Vec<DataLocation>>;

    async fn export_section(
        &self,
        subject: &SubjectId,
        workspace: Option<&WorkspaceId>,
    ) -> Result<StoreSection>;

    async fn erase(&self, subject: &SubjectId, mode: &EraseMode) -> Result<EraseReport>;
}

/// Authorization port: decides whether `actor` may run a compliance operation.
///
/// The engine refuses to dispatch anything the authorizer rejects, and the
/// refusal itself is audited.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        actor: &str,
        operation: OperationType,
        subject: &SubjectId,
    ) -> Result<()>;
}

/// Allow-list authorizer backed by config. An empty list denies everyone.
pub struct AllowListAuthorizer {
    operators: Vec<String>,
}

impl AllowListAuthorizer {
    pub fn new(operators: Vec<String>) -> Self {
        Self { operators }
    }
}

#[async_trait]
impl Authorizer for AllowListAuthorizer {
    async fn authorize(
        &self,
        actor: &str,
        operation: OperationType,
        subject: &SubjectId,
    ) -> Result<()> {
        if actor.trim().is_empty() {
            return Err(Error::Authorization(
                "request carries no authorizing identity".to_string(),
            ));
        }
        if self.operators.iter().any(|o| o == actor) {
            return Ok(());
        }
        Err(Error::Authorization(format!(
            "{actor} may not run {operation} for subject {subject}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_list_accepts_known_operator() {
        let auth = AllowListAuthorizer::new(vec!["dpo@example.com".to_string()]);
        auth.authorize(
            "dpo@example.com",
            OperationType::Export,
            &SubjectId("alice".to_string()),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn allow_list_rejects_unknown_and_empty_actor() {
        let auth = AllowListAuthorizer::new(vec!["dpo@example.com".to_string()]);

        let err = auth
            .authorize(
                "intruder",
                OperationType::Erasure,
                &SubjectId("alice".to_string()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authorization(_)));

        let err = auth
            .authorize("", OperationType::Erasure, &SubjectId("alice".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authorization(_)));
    }

    #[tokio::test]
    async fn empty_allow_list_denies_everyone() {
        let auth = AllowListAuthorizer::new(vec![]);
        let err = auth
            .authorize(
                "dpo@example.com",
                OperationType::Locate,
                &SubjectId("alice".to_string()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authorization(_)));
    }
}
