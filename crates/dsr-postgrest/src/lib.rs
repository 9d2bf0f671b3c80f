//! Relational store adapter speaking a PostgREST-style HTTP API (Supabase or
//! plain PostgREST).
//!
//! Each configured table names the column holding the subject id. Counting
//! uses the `Prefer: count=exact` range probe so locate never pulls rows;
//! anonymization rewrites the subject column and whichever identifying
//! columns the rows actually have.

use async_trait::async_trait;
use dsr_core::{
    domain::{StoreKind, SubjectId, WorkspaceId},
    errors::Error,
    ports::{DataLocation, EraseMode, EraseReport, StoreAdapter, StoreSection},
    Result,
};

const STORE_NAME: &str = "postgrest";

/// One table plus the column that holds the subject id.
#[derive(Clone, Debug, PartialEq)]
pub struct TableSpec {
    pub table: String,
    pub column: String,
}

impl TableSpec {
    /// Parses `table` or `table:column`; the column defaults to `user_id`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match raw.split_once(':') {
            Some((t, c)) if !t.trim().is_empty() && !c.trim().is_empty() => Some(Self {
                table: t.trim().to_string(),
                column: c.trim().to_string(),
            }),
            Some(_) => None,
            None => Some(Self {
                table: raw.to_string(),
                column: "user_id".to_string(),
            }),
        }
    }
}

pub struct PostgrestStore {
    base_url: String,
    api_key: Option<String>,
    tables: Vec<TableSpec>,
    http: reqwest::Client,
}

impl PostgrestStore {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        tables: Vec<TableSpec>,
    ) -> Self {
        let base_url: String = base_url.into();
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("reqwest client build");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            tables,
            http,
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, url);
        if let Some(key) = &self.api_key {
            req = req.header("apikey", key).bearer_auth(key);
        }
        req
    }

    fn table_url(&self, spec: &TableSpec, subject: &SubjectId) -> String {
        format!(
            "{}/{}?{}=eq.{}",
            self.base_url, spec.table, spec.column, subject.0
        )
    }

    async fn count_rows(&self, spec: &TableSpec, subject: &SubjectId) -> Result<u64> {
        let url = format!("{}&select={}", self.table_url(spec, subject), spec.column);
        let resp = self
            .request(reqwest::Method::GET, &url)
            .header("Prefer", "count=exact")
            .header("Range-Unit", "items")
            .header("Range", "0-0")
            .send()
            .await
            .map_err(|e| request_err(&spec.table, e))?;
        if !resp.status().is_success() {
            return Err(status_err(&spec.table, resp).await);
        }
        let range = resp
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        parse_content_range(&range).ok_or_else(|| {
            Error::store(
                STORE_NAME,
                format!("{}: missing count in content-range {range:?}", spec.table),
            )
        })
    }

    async fn fetch_rows(
        &self,
        spec: &TableSpec,
        subject: &SubjectId,
        limit_one: bool,
    ) -> Result<Vec<serde_json::Value>> {
        let mut url = format!("{}&select=*", self.table_url(spec, subject));
        if limit_one {
            url.push_str("&limit=1");
        }
        let resp = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|e| request_err(&spec.table, e))?;
        if !resp.status().is_success() {
            return Err(status_err(&spec.table, resp).await);
        }
        resp.json()
            .await
            .map_err(|e| json_err(&spec.table, e))
    }

    async fn delete_rows(&self, spec: &TableSpec, subject: &SubjectId) -> Result<u64> {
        let url = self.table_url(spec, subject);
        let resp = self
            .request(reqwest::Method::DELETE, &url)
            .header("Prefer", "return=representation")
            .send()
            .await
            .map_err(|e| request_err(&spec.table, e))?;
        if !resp.status().is_success() {
            return Err(status_err(&spec.table, resp).await);
        }
        let rows: Vec<serde_json::Value> =
            resp.json().await.map_err(|e| json_err(&spec.table, e))?;
        if !rows.is_empty() {
            tracing::info!("deleted {} rows from {}", rows.len(), spec.table);
        }
        Ok(rows.len() as u64)
    }

    async fn anonymize_rows(
        &self,
        spec: &TableSpec,
        subject: &SubjectId,
        token: &str,
    ) -> Result<u64> {
        // Sample one row first so the PATCH only names columns that exist.
        let sample = match self.fetch_rows(spec, subject, true).await?.into_iter().next() {
            Some(row) => row,
            None => return Ok(0),
        };

        let body = anonymize_body(spec, &sample, token);
        let resp = self
            .request(reqwest::Method::PATCH, &self.table_url(spec, subject))
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await
            .map_err(|e| request_err(&spec.table, e))?;
        if !resp.status().is_success() {
            return Err(status_err(&spec.table, resp).await);
        }
        let rows: Vec<serde_json::Value> =
            resp.json().await.map_err(|e| json_err(&spec.table, e))?;
        tracing::info!("anonymized {} rows in {}", rows.len(), spec.table);
        Ok(rows.len() as u64)
    }
}

#[async_trait]
impl StoreAdapter for PostgrestStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Relational
    }

    fn name(&self) -> &str {
        STORE_NAME
    }

    async fn locate(
        &self,
        subject: &SubjectId,
        _workspace: Option<&WorkspaceId>,
    ) -> Result<Vec<DataLocation>> {
        let mut out = Vec::new();
        for spec in &self.tables {
            let count = self.count_rows(spec, subject).await?;
            if count > 0 {
                out.push(DataLocation {
                    store_kind: StoreKind::Relational,
                    store_name: STORE_NAME.to_string(),
                    resource: spec.table.clone(),
                    record_count_hint: Some(count),
                });
            }
        }
        Ok(out)
    }

    async fn export_section(
        &self,
        subject: &SubjectId,
        _workspace: Option<&WorkspaceId>,
    ) -> Result<StoreSection> {
        let mut tables = serde_json::Map::new();
        let mut total = 0u64;
        for spec in &self.tables {
            let rows = self.fetch_rows(spec, subject, false).await?;
            total += rows.len() as u64;
            tables.insert(spec.table.clone(), serde_json::Value::Array(rows));
        }
        Ok(StoreSection {
            store_kind: StoreKind::Relational,
            store_name: STORE_NAME.to_string(),
            records: serde_json::Value::Object(tables),
            record_count: total,
        })
    }

    async fn erase(&self, subject: &SubjectId, mode: &EraseMode) -> Result<EraseReport> {
        let mut affected = 0u64;
        for spec in &self.tables {
            affected += match mode {
                EraseMode::Delete => self.delete_rows(spec, subject).await?,
                EraseMode::Anonymize { token } => {
                    self.anonymize_rows(spec, subject, token).await?
                }
            };
        }
        Ok(EraseReport {
            store_name: STORE_NAME.to_string(),
            mode: mode.as_str().to_string(),
            records_affected: affected,
        })
    }
}

/// PATCH body for one table: the subject column is always rewritten; email
/// and name are replaced only when the sampled row actually carries them.
fn anonymize_body(spec: &TableSpec, sample: &serde_json::Value, token: &str) -> serde_json::Value {
    let mut body = serde_json::Map::new();
    body.insert(
        spec.column.clone(),
        serde_json::Value::String(token.to_string()),
    );
    if sample.get("email").is_some() {
        body.insert(
            "email".to_string(),
            serde_json::Value::String(format!("deleted_{token}@anonymized.local")),
        );
    }
    if sample.get("name").is_some() {
        body.insert(
            "name".to_string(),
            serde_json::Value::String("Deleted User".to_string()),
        );
    }
    serde_json::Value::Object(body)
}

fn parse_content_range(raw: &str) -> Option<u64> {
    raw.rsplit_once('/')?.1.trim().parse().ok()
}

fn request_err(table: &str, e: reqwest::Error) -> Error {
    Error::store(STORE_NAME, format!("{table}: request error: {e}"))
}

fn json_err(table: &str, e: reqwest::Error) -> Error {
    Error::store(STORE_NAME, format!("{table}: json error: {e}"))
}

async fn status_err(table: &str, resp: reqwest::Response) -> Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Error::store(
        STORE_NAME,
        format!(
            "{table}: {status} {}",
            body.chars().take(200).collect::<String>()
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_spec_parses_with_and_without_column() {
        assert_eq!(
            TableSpec::parse("users:id"),
            Some(TableSpec {
                table: "users".to_string(),
                column: "id".to_string()
            })
        );
        assert_eq!(
            TableSpec::parse("contacts"),
            Some(TableSpec {
                table: "contacts".to_string(),
                column: "user_id".to_string()
            })
        );
        assert_eq!(
            TableSpec::parse(" orders : customer_id "),
            Some(TableSpec {
                table: "orders".to_string(),
                column: "customer_id".to_string()
            })
        );
        assert_eq!(TableSpec::parse(""), None);
        assert_eq!(TableSpec::parse(":"), None);
        assert_eq!(TableSpec::parse("users:"), None);
    }

    #[test]
    fn content_range_carries_the_exact_count() {
        assert_eq!(parse_content_range("0-0/42"), Some(42));
        assert_eq!(parse_content_range("*/0"), Some(0));
        assert_eq!(parse_content_range("0-0/*"), None);
        assert_eq!(parse_content_range(""), None);
    }

    #[test]
    fn anonymize_body_matches_row_shape() {
        let spec = TableSpec {
            table: "users".to_string(),
            column: "id".to_string(),
        };
        let full = serde_json::json!({
            "id": "alice",
            "email": "alice@example.com",
            "name": "Alice",
            "created_at": "2026-01-01T00:00:00Z",
        });
        let body = anonymize_body(&spec, &full, "tok123");
        assert_eq!(body["id"], "tok123");
        assert_eq!(body["email"], "deleted_tok123@anonymized.local");
        assert_eq!(body["name"], "Deleted User");
        assert!(body.get("created_at").is_none());

        let minimal = serde_json::json!({ "user_id": "alice", "payload": {} });
        let spec = TableSpec {
            table: "events".to_string(),
            column: "user_id".to_string(),
        };
        let body = anonymize_body(&spec, &minimal, "tok123");
        assert_eq!(body["user_id"], "tok123");
        assert!(body.get("email").is_none());
        assert!(body.get("name").is_none());
    }
}
