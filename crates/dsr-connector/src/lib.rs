//! Third-party integration adapter: one REST contract for external services
//! holding subject data (contact syncs, messaging integrations and the like).
//!
//! Expected endpoints on the remote side:
//!   GET    /subjects/{id}/records     -> JSON array of records
//!   DELETE /subjects/{id}             -> remove everything for the subject
//!   POST   /subjects/{id}/anonymize   -> `{"token": ...}`, optional
//!
//! A 404 from the records endpoint means the service holds nothing; a 404
//! from the anonymize endpoint means the service cannot pseudonymize and the
//! store should be configured with the delete policy instead.

use async_trait::async_trait;
use dsr_core::{
    domain::{StoreKind, SubjectId, WorkspaceId},
    errors::Error,
    ports::{DataLocation, EraseMode, EraseReport, StoreAdapter, StoreSection},
    Result,
};

const STORE_NAME: &str = "connector";

pub struct ConnectorStore {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl ConnectorStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url: String = base_url.into();
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("reqwest client build");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http,
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn fetch_records(&self, subject: &SubjectId) -> Result<Vec<serde_json::Value>> {
        let url = format!("{}/subjects/{}/records", self.base_url, subject.0);
        let resp = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(request_err)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(status_err(resp).await);
        }
        resp.json().await.map_err(json_err)
    }
}

#[async_trait]
impl StoreAdapter for ConnectorStore {
    fn kind(&self) -> StoreKind {
        StoreKind::ThirdParty
    }

    fn name(&self) -> &str {
        STORE_NAME
    }

    async fn locate(
        &self,
        subject: &SubjectId,
        _workspace: Option<&WorkspaceId>,
    ) -> Result<Vec<DataLocation>> {
        let records = self.fetch_records(subject).await?;
        if records.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![DataLocation {
            store_kind: StoreKind::ThirdParty,
            store_name: STORE_NAME.to_string(),
            resource: format!("subjects/{}/records", subject.0),
            record_count_hint: Some(records.len() as u64),
        }])
    }

    async fn export_section(
        &self,
        subject: &SubjectId,
        _workspace: Option<&WorkspaceId>,
    ) -> Result<StoreSection> {
        let records = self.fetch_records(subject).await?;
        Ok(StoreSection {
            store_kind: StoreKind::ThirdParty,
            store_name: STORE_NAME.to_string(),
            record_count: records.len() as u64,
            records: serde_json::Value::Array(records),
        })
    }

    async fn erase(&self, subject: &SubjectId, mode: &EraseMode) -> Result<EraseReport> {
        let held = self.fetch_records(subject).await?.len() as u64;
        if held == 0 {
            return Ok(EraseReport {
                store_name: STORE_NAME.to_string(),
                mode: mode.as_str().to_string(),
                records_affected: 0,
            });
        }

        let affected = match mode {
            EraseMode::Delete => {
                let url = format!("{}/subjects/{}", self.base_url, subject.0);
                let resp = self
                    .request(reqwest::Method::DELETE, &url)
                    .send()
                    .await
                    .map_err(request_err)?;
                // Already gone on the remote side counts as done.
                if resp.status() == reqwest::StatusCode::NOT_FOUND {
                    0
                } else if !resp.status().is_success() {
                    return Err(status_err(resp).await);
                } else {
                    affected_from_body(resp.text().await.unwrap_or_default()).unwrap_or(held)
                }
            }
            EraseMode::Anonymize { token } => {
                let url = format!("{}/subjects/{}/anonymize", self.base_url, subject.0);
                let resp = self
                    .request(reqwest::Method::POST, &url)
                    .json(&serde_json::json!({ "token": token }))
                    .send()
                    .await
                    .map_err(request_err)?;
                if resp.status() == reqwest::StatusCode::NOT_FOUND {
                    return Err(Error::store(
                        STORE_NAME,
                        "service does not support anonymization; configure the delete policy for this store",
                    ));
                }
                if !resp.status().is_success() {
                    return Err(status_err(resp).await);
                }
                affected_from_body(resp.text().await.unwrap_or_default()).unwrap_or(held)
            }
        };

        tracing::info!("erased {affected} records at the remote service");
        Ok(EraseReport {
            store_name: STORE_NAME.to_string(),
            mode: mode.as_str().to_string(),
            records_affected: affected,
        })
    }
}

/// Remote services may report `{"deleted": n}` or `{"anonymized": n}`; absent
/// or unreadable bodies fall back to the count observed before the call.
fn affected_from_body(body: String) -> Option<u64> {
    let v: serde_json::Value = serde_json::from_str(&body).ok()?;
    v.get("deleted")
        .or_else(|| v.get("anonymized"))
        .and_then(|n| n.as_u64())
}

fn request_err(e: reqwest::Error) -> Error {
    Error::store(STORE_NAME, format!("request error: {e}"))
}

fn json_err(e: reqwest::Error) -> Error {
    Error::store(STORE_NAME, format!("json error: {e}"))
}

async fn status_err(resp: reqwest::Response) -> Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Error::store(
        STORE_NAME,
        format!(
            "{status} {}",
            body.chars().take(200).collect::<String>()
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affected_count_reads_either_report_key() {
        assert_eq!(affected_from_body(r#"{"deleted": 3}"#.to_string()), Some(3));
        assert_eq!(
            affected_from_body(r#"{"anonymized": 2}"#.to_string()),
            Some(2)
        );
        assert_eq!(affected_from_body("".to_string()), None);
        assert_eq!(affected_from_body("ok".to_string()), None);
        assert_eq!(affected_from_body(r#"{"status": "done"}"#.to_string()), None);
    }
}
