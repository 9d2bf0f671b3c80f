//! Data locator: the union of everything the registered stores hold for one
//! subject.
//!
//! Stores are queried concurrently. A store that cannot answer is flagged in
//! the report, never silently dropped; only all stores failing at once is a
//! locator error.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    domain::{StoreKind, SubjectId, WorkspaceId},
    errors::Error,
    ports::{DataLocation, StoreAdapter},
    Result,
};

/// A store that could not answer `locate`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnreachableStore {
    pub store_kind: StoreKind,
    pub store_name: String,
    pub reason: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LocationReport {
    pub locations: Vec<DataLocation>,
    pub unreachable: Vec<UnreachableStore>,
}

impl LocationReport {
    /// Transparency view grouped by store kind, with the retention notes the
    /// report is published with.
    pub fn grouped(&self) -> serde_json::Value {
        let mut relational = Vec::new();
        let mut file_storage = Vec::new();
        let mut third_party = Vec::new();

        for loc in &self.locations {
            let label = format!("{} ({})", loc.store_name, loc.resource);
            match loc.store_kind {
                StoreKind::Relational => relational.push(label),
                StoreKind::FileStorage => file_storage.push(label),
                StoreKind::ThirdParty => third_party.push(label),
            }
        }

        serde_json::json!({
            "relational": relational,
            "file_storage": file_storage,
            "third_party": third_party,
            "unreachable": self.unreachable,
            "retention": {
                "subject_data": "until erasure is requested",
                "compliance_records": "7 years (legal requirement)",
            },
        })
    }
}

/// Registry of store adapters plus the fan-out over them.
pub struct DataLocator {
    stores: Vec<Arc<dyn StoreAdapter>>,
    store_timeout: Duration,
}

impl DataLocator {
    pub fn new(stores: Vec<Arc<dyn StoreAdapter>>, store_timeout: Duration) -> Self {
        Self {
            stores,
            store_timeout,
        }
    }

    pub fn stores(&self) -> &[Arc<dyn StoreAdapter>] {
        &self.stores
    }

    pub fn store_by_name(&self, name: &str) -> Option<Arc<dyn StoreAdapter>> {
        self.stores.iter().find(|s| s.name() == name).cloned()
    }

    pub async fn locate(
        &self,
        subject: &SubjectId,
        workspace: Option<&WorkspaceId>,
    ) -> Result<LocationReport> {
        if self.stores.is_empty() {
            return Ok(LocationReport::default());
        }

        let mut handles = Vec::new();
        for store in &self.stores {
            let kind = store.kind();
            let name = store.name().to_string();
            let store = Arc::clone(store);
            let subject = subject.clone();
            let workspace = workspace.cloned();
            let timeout = self.store_timeout;
            let handle = tokio::spawn(async move {
                match tokio::time::timeout(timeout, store.locate(&subject, workspace.as_ref()))
                    .await
                {
                    Ok(res) => res,
                    Err(_) => Err(Error::store(
                        store.name(),
                        format!("locate timed out after {timeout:?}"),
                    )),
                }
            });
            handles.push((kind, name, handle));
        }

        let total = handles.len();
        let mut failed = 0usize;
        let mut report = LocationReport::default();

        for (kind, name, handle) in handles {
            let res = match handle.await {
                Ok(res) => res,
                Err(e) => Err(Error::store(&name, format!("locate task failed: {e}"))),
            };
            match res {
                Ok(locations) => report.locations.extend(locations),
                Err(e) => {
                    failed += 1;
                    tracing::warn!(store = %name, error = %e, "store unreachable during locate");
                    report.unreachable.push(UnreachableStore {
                        store_kind: kind,
                        store_name: name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if failed == total {
            return Err(Error::LocatorUnavailable(format!(
                "all {total} registered stores failed to answer"
            )));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{EraseMode, EraseReport, StoreSection};
    use async_trait::async_trait;

    struct FakeStore {
        name: String,
        kind: StoreKind,
        locations: Vec<DataLocation>,
        fail: bool,
    }

    impl FakeStore {
        fn with_resources(name: &str, kind: StoreKind, resources: &[&str]) -> Self {
            let locations = resources
                .iter()
                .map(|r| DataLocation {
                    store_kind: kind,
                    store_name: name.to_string(),
                    resource: r.to_string(),
                    record_count_hint: None,
                })
                .collect();
            Self {
                name: name.to_string(),
                kind,
                locations,
                fail: false,
            }
        }

        fn failing(name: &str, kind: StoreKind) -> Self {
            Self {
                name: name.to_string(),
                kind,
                locations: vec![],
                fail: true,
            }
        }
    }

    #[async_trait]
    impl StoreAdapter for FakeStore {
        fn kind(&self) -> StoreKind {
            self.kind
        }

        fn name(&self) -> &str {
            &self.name
        }

        async fn locate(
            &self,
            _subject: &SubjectId,
            _workspace: Option<&WorkspaceId>,
        ) -> Result<Vec<DataLocation>> {
            if self.fail {
                return Err(Error::store(&self.name, "connection refused"));
            }
            Ok(self.locations.clone())
        }

        async fn export_section(
            &self,
            _subject: &SubjectId,
            _workspace: Option<&WorkspaceId>,
        ) -> Result<StoreSection> {
            Err(Error::store(&self.name, "not used in locator tests"))
        }

        async fn erase(&self, _subject: &SubjectId, _mode: &EraseMode) -> Result<EraseReport> {
            Err(Error::store(&self.name, "not used in locator tests"))
        }
    }

    fn locator(stores: Vec<Arc<dyn StoreAdapter>>) -> DataLocator {
        DataLocator::new(stores, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn union_across_stores() {
        let loc = locator(vec![
            Arc::new(FakeStore::with_resources(
                "postgrest",
                StoreKind::Relational,
                &["users", "messages"],
            )),
            Arc::new(FakeStore::with_resources(
                "uploads",
                StoreKind::FileStorage,
                &["alice/"],
            )),
        ]);

        let report = loc
            .locate(&SubjectId("alice".to_string()), None)
            .await
            .unwrap();
        assert_eq!(report.locations.len(), 3);
        assert!(report.unreachable.is_empty());
    }

    #[tokio::test]
    async fn unreachable_store_is_flagged_not_dropped() {
        let loc = locator(vec![
            Arc::new(FakeStore::with_resources(
                "postgrest",
                StoreKind::Relational,
                &["users"],
            )),
            Arc::new(FakeStore::failing("crm", StoreKind::ThirdParty)),
        ]);

        let report = loc
            .locate(&SubjectId("alice".to_string()), None)
            .await
            .unwrap();
        assert_eq!(report.locations.len(), 1);
        assert_eq!(report.unreachable.len(), 1);
        assert_eq!(report.unreachable[0].store_name, "crm");
        assert!(report.unreachable[0].reason.contains("connection refused"));
    }

    #[tokio::test]
    async fn all_stores_failing_is_a_locator_error() {
        let loc = locator(vec![
            Arc::new(FakeStore::failing("postgrest", StoreKind::Relational)),
            Arc::new(FakeStore::failing("crm", StoreKind::ThirdParty)),
        ]);

        let err = loc
            .locate(&SubjectId("alice".to_string()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LocatorUnavailable(_)));
    }

    #[tokio::test]
    async fn unknown_subject_yields_empty_report() {
        let loc = locator(vec![Arc::new(FakeStore::with_resources(
            "postgrest",
            StoreKind::Relational,
            &[],
        ))]);

        let report = loc
            .locate(&SubjectId("nobody".to_string()), None)
            .await
            .unwrap();
        assert!(report.locations.is_empty());
        assert!(report.unreachable.is_empty());
    }

    #[tokio::test]
    async fn no_registered_stores_yields_empty_report() {
        let loc = locator(vec![]);
        let report = loc
            .locate(&SubjectId("alice".to_string()), None)
            .await
            .unwrap();
        assert!(report.locations.is_empty());
    }

    #[test]
    fn grouped_report_covers_all_kinds() {
        let report = LocationReport {
            locations: vec![DataLocation {
                store_kind: StoreKind::Relational,
                store_name: "postgrest".to_string(),
                resource: "users".to_string(),
                record_count_hint: Some(1),
            }],
            unreachable: vec![],
        };

        let grouped = report.grouped();
        assert_eq!(grouped["relational"][0], "postgrest (users)");
        assert!(grouped["file_storage"].as_array().unwrap().is_empty());
        assert!(grouped["retention"]["compliance_records"]
            .as_str()
            .unwrap()
            .contains("7 years"));
    }
}
