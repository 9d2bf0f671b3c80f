//! File-storage adapter: a subject's files live under `{root}/{subject_id}/`.
//!
//! Export inlines file contents into the section (UTF-8 as text, anything
//! else base64) up to a per-file cap. Erasure with the delete policy removes
//! the whole subject directory; with the anonymize policy the contents are
//! blanked and the directory is renamed to the pseudonym token, keeping the
//! structure without the identity.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use dsr_core::{
    domain::{StoreKind, SubjectId, WorkspaceId},
    ports::{DataLocation, EraseMode, EraseReport, StoreAdapter, StoreSection},
    security::validate_subject_id,
    Result,
};

const STORE_NAME: &str = "filestore";

/// Files above this are described in the export but not inlined.
const INLINE_MAX_BYTES: u64 = 10 * 1024 * 1024;

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    // Subject ids come in validated, but the path join stays guarded anyway.
    fn subject_dir(&self, subject: &SubjectId) -> Result<PathBuf> {
        validate_subject_id(&subject.0)?;
        Ok(self.root.join(&subject.0))
    }
}

#[async_trait]
impl StoreAdapter for FileStore {
    fn kind(&self) -> StoreKind {
        StoreKind::FileStorage
    }

    fn name(&self) -> &str {
        STORE_NAME
    }

    async fn locate(
        &self,
        subject: &SubjectId,
        _workspace: Option<&WorkspaceId>,
    ) -> Result<Vec<DataLocation>> {
        let dir = self.subject_dir(subject)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        walk_files(&dir, &mut files)?;
        if files.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![DataLocation {
            store_kind: StoreKind::FileStorage,
            store_name: STORE_NAME.to_string(),
            resource: format!("{}/", subject.0),
            record_count_hint: Some(files.len() as u64),
        }])
    }

    async fn export_section(
        &self,
        subject: &SubjectId,
        _workspace: Option<&WorkspaceId>,
    ) -> Result<StoreSection> {
        let dir = self.subject_dir(subject)?;
        let mut files = Vec::new();
        if dir.is_dir() {
            walk_files(&dir, &mut files)?;
        }
        files.sort();

        let mut records = Vec::new();
        for path in &files {
            records.push(file_record(&dir, path)?);
        }
        Ok(StoreSection {
            store_kind: StoreKind::FileStorage,
            store_name: STORE_NAME.to_string(),
            record_count: records.len() as u64,
            records: serde_json::Value::Array(records),
        })
    }

    async fn erase(&self, subject: &SubjectId, mode: &EraseMode) -> Result<EraseReport> {
        let dir = self.subject_dir(subject)?;
        if !dir.is_dir() {
            return Ok(EraseReport {
                store_name: STORE_NAME.to_string(),
                mode: mode.as_str().to_string(),
                records_affected: 0,
            });
        }

        let mut files = Vec::new();
        walk_files(&dir, &mut files)?;
        let affected = files.len() as u64;

        match mode {
            EraseMode::Delete => {
                std::fs::remove_dir_all(&dir)?;
                tracing::info!("removed subject directory with {affected} files");
            }
            EraseMode::Anonymize { token } => {
                for path in &files {
                    std::fs::write(path, b"")?;
                }
                let target = self.root.join(token);
                if target.exists() {
                    std::fs::remove_dir_all(&dir)?;
                } else {
                    std::fs::rename(&dir, &target)?;
                }
                tracing::info!("blanked {affected} files under pseudonym directory");
            }
        }

        Ok(EraseReport {
            store_name: STORE_NAME.to_string(),
            mode: mode.as_str().to_string(),
            records_affected: affected,
        })
    }
}

fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn file_record(base: &Path, path: &Path) -> Result<serde_json::Value> {
    let meta = std::fs::metadata(path)?;
    let rel = path
        .strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string();

    let mut record = serde_json::json!({
        "path": rel,
        "size": meta.len(),
    });
    if let Ok(modified) = meta.modified() {
        record["modified"] = serde_json::json!(DateTime::<Utc>::from(modified));
    }

    if meta.len() > INLINE_MAX_BYTES {
        record["content_omitted"] = serde_json::json!(format!(
            "file larger than {INLINE_MAX_BYTES} bytes; request a copy via the privacy contact"
        ));
        return Ok(record);
    }

    let bytes = std::fs::read(path)?;
    match String::from_utf8(bytes) {
        Ok(text) => record["content"] = serde_json::Value::String(text),
        Err(e) => {
            record["content_base64"] =
                serde_json::Value::String(general_purpose::STANDARD.encode(e.into_bytes()));
        }
    }
    Ok(record)
}
