//! Export archives.
//!
//! An export bundle is a zip with one `{store}.json` section per store, a
//! `manifest.json`, and a `README.txt` stating the subject's rights. The zip
//! bytes are sealed before they touch disk; blob and metadata sidecar live
//! under the archives directory keyed by operation id.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use zip::{write::FileOptions, CompressionMethod, ZipWriter};

use crate::{
    crypto,
    domain::{OperationId, SubjectId},
    errors::Error,
    ports::StoreSection,
    Result,
};

/// Sidecar describing one stored archive. Salt and nonce here are what makes
/// the ciphertext blob openable again.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveMeta {
    pub operation_id: OperationId,
    pub subject_id: SubjectId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub salt: String,
    pub nonce: String,
    /// Checksum of the ciphertext blob.
    pub sha256: String,
    pub size: u64,
    pub sections_included: Vec<String>,
    pub sections_failed: Vec<String>,
}

/// Builds the plaintext zip for an export.
///
/// Valid even with zero sections: the manifest and README still describe what
/// was (not) found.
pub fn build_export_bundle(
    subject: &SubjectId,
    sections: &[StoreSection],
    privacy_contact: &str,
) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = serde_json::json!({
        "subject_id": subject,
        "generated_at": Utc::now(),
        "sections": sections.iter().map(|s| serde_json::json!({
            "store_name": s.store_name,
            "store_kind": s.store_kind,
            "record_count": s.record_count,
        })).collect::<Vec<_>>(),
    });

    zip.start_file("manifest.json", opts).map_err(zip_err)?;
    zip.write_all(&serde_json::to_vec_pretty(&manifest)?)?;

    zip.start_file("README.txt", opts).map_err(zip_err)?;
    zip.write_all(readme_text(subject, privacy_contact).as_bytes())?;

    for section in sections {
        zip.start_file(format!("{}.json", section.store_name), opts)
            .map_err(zip_err)?;
        zip.write_all(&serde_json::to_vec_pretty(section)?)?;
    }

    let cursor = zip.finish().map_err(zip_err)?;
    Ok(cursor.into_inner())
}

fn readme_text(subject: &SubjectId, privacy_contact: &str) -> String {
    format!(
        "Subject Data Export\n\
         ===================\n\
         \n\
         Subject: {subject}\n\
         Generated: {}\n\
         \n\
         This archive contains the records held about you by each listed data\n\
         store, one JSON file per store, plus a manifest describing what was\n\
         included.\n\
         \n\
         Your rights under the GDPR include:\n\
         \x20 - Art. 15  access to your personal data (this export)\n\
         \x20 - Art. 17  erasure (\"right to be forgotten\")\n\
         \x20 - Art. 18  restriction of processing\n\
         \x20 - Art. 20  data portability\n\
         \n\
         Questions and further requests: {privacy_contact}\n",
        Utc::now().to_rfc3339()
    )
}

fn zip_err(e: zip::result::ZipError) -> Error {
    Error::Archive(format!("zip error: {e}"))
}

/// Encrypted-at-rest archive storage with retention-based expiry.
pub struct ArchiveStore {
    dir: PathBuf,
    secret: String,
    retention_days: u32,
}

impl ArchiveStore {
    pub fn new(dir: impl Into<PathBuf>, secret: impl Into<String>, retention_days: u32) -> Self {
        Self {
            dir: dir.into(),
            secret: secret.into(),
            retention_days: retention_days.max(1),
        }
    }

    /// Seal the plaintext zip and persist blob plus sidecar.
    pub fn store(
        &self,
        operation_id: &OperationId,
        subject: &SubjectId,
        plaintext_zip: &[u8],
        sections_included: Vec<String>,
        sections_failed: Vec<String>,
    ) -> Result<ArchiveMeta> {
        std::fs::create_dir_all(&self.dir)?;

        let sealed = crypto::seal(&self.secret, plaintext_zip)?;
        let now = Utc::now();
        let meta = ArchiveMeta {
            operation_id: operation_id.clone(),
            subject_id: subject.clone(),
            created_at: now,
            expires_at: now + Duration::days(i64::from(self.retention_days)),
            salt: sealed.salt,
            nonce: sealed.nonce,
            sha256: crypto::sha256_hex(&sealed.ciphertext),
            size: sealed.ciphertext.len() as u64,
            sections_included,
            sections_failed,
        };

        std::fs::write(self.blob_path(operation_id), &sealed.ciphertext)?;
        std::fs::write(
            self.meta_path(operation_id),
            serde_json::to_string_pretty(&meta)?,
        )?;
        Ok(meta)
    }

    pub fn meta(&self, operation_id: &OperationId) -> Result<Option<ArchiveMeta>> {
        let path = self.meta_path(operation_id);
        if !path.exists() {
            return Ok(None);
        }
        let txt = std::fs::read_to_string(path)?;
        let meta: ArchiveMeta = serde_json::from_str(&txt)?;
        Ok(Some(meta))
    }

    /// Decrypt an archive back to plaintext zip bytes.
    pub fn open(&self, operation_id: &OperationId) -> Result<Vec<u8>> {
        let meta = self
            .meta(operation_id)?
            .ok_or_else(|| Error::NotFound(format!("archive for operation {operation_id}")))?;

        let ciphertext = std::fs::read(self.blob_path(operation_id))?;
        if crypto::sha256_hex(&ciphertext) != meta.sha256 {
            return Err(Error::Archive(
                "archive checksum mismatch; blob was modified".to_string(),
            ));
        }
        crypto::open(&self.secret, &ciphertext, &meta.salt, &meta.nonce)
    }

    /// Delete archives past their retention horizon. Returns the purged ids.
    ///
    /// Operation and audit records are never touched here; only export blobs
    /// expire.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<OperationId>> {
        let mut purged = Vec::new();
        if !self.dir.exists() {
            return Ok(purged);
        }

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(id) = name.strip_suffix(".meta.json") else {
                continue;
            };

            let txt = std::fs::read_to_string(entry.path())?;
            let Ok(meta) = serde_json::from_str::<ArchiveMeta>(&txt) else {
                tracing::warn!(file = %name, "skipping unreadable archive sidecar");
                continue;
            };

            if meta.expires_at <= now {
                let id = OperationId(id.to_string());
                let _ = std::fs::remove_file(self.blob_path(&id));
                std::fs::remove_file(self.meta_path(&id))?;
                tracing::info!(operation = %id, "purged expired export archive");
                purged.push(id);
            }
        }
        Ok(purged)
    }

    pub fn blob_path(&self, operation_id: &OperationId) -> PathBuf {
        self.dir.join(format!("{operation_id}.zip.enc"))
    }

    fn meta_path(&self, operation_id: &OperationId) -> PathBuf {
        self.dir.join(format!("{operation_id}.meta.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StoreKind;
    use std::io::Read;
    use std::time::Duration as StdDuration;

    fn tmp(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(StdDuration::from_secs(0))
            .as_millis();
        let pid = std::process::id();
        PathBuf::from(format!("/tmp/{prefix}-{pid}-{ts}"))
    }

    fn section(store: &str) -> StoreSection {
        StoreSection {
            store_kind: StoreKind::Relational,
            store_name: store.to_string(),
            records: serde_json::json!([{"id": 1, "email": "alice@example.com"}]),
            record_count: 1,
        }
    }

    fn subject() -> SubjectId {
        SubjectId("alice@example.com".to_string())
    }

    #[test]
    fn bundle_contains_manifest_readme_and_sections() {
        let bytes =
            build_export_bundle(&subject(), &[section("users_db")], "privacy@example.com").unwrap();

        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"manifest.json".to_string()));
        assert!(names.contains(&"README.txt".to_string()));
        assert!(names.contains(&"users_db.json".to_string()));

        let mut readme = String::new();
        archive
            .by_name("README.txt")
            .unwrap()
            .read_to_string(&mut readme)
            .unwrap();
        assert!(readme.contains("alice@example.com"));
        assert!(readme.contains("privacy@example.com"));
        assert!(readme.contains("Art. 17"));
    }

    #[test]
    fn empty_bundle_is_still_a_valid_archive() {
        let bytes = build_export_bundle(&subject(), &[], "privacy@example.com").unwrap();
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);

        let mut manifest = String::new();
        archive
            .by_name("manifest.json")
            .unwrap()
            .read_to_string(&mut manifest)
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&manifest).unwrap();
        assert!(parsed["sections"].as_array().unwrap().is_empty());
    }

    #[test]
    fn store_then_open_roundtrip() {
        let store = ArchiveStore::new(tmp("dsr-archive"), "secret", 30);
        let op = OperationId::generate();
        let plain = build_export_bundle(&subject(), &[section("users_db")], "p@example.com")
            .unwrap();

        let meta = store
            .store(&op, &subject(), &plain, vec!["users_db".to_string()], vec![])
            .unwrap();
        assert_eq!(meta.sections_included, vec!["users_db".to_string()]);
        assert!(meta.expires_at > meta.created_at);

        let reopened = store.open(&op).unwrap();
        assert_eq!(reopened, plain);
    }

    #[test]
    fn blob_on_disk_is_not_plaintext() {
        let store = ArchiveStore::new(tmp("dsr-archive-enc"), "secret", 30);
        let op = OperationId::generate();
        let plain = build_export_bundle(&subject(), &[section("users_db")], "p@example.com")
            .unwrap();
        store
            .store(&op, &subject(), &plain, vec![], vec![])
            .unwrap();

        let on_disk = std::fs::read(store.blob_path(&op)).unwrap();
        assert_ne!(on_disk, plain);
        // Zip magic must not appear at the start of the encrypted blob.
        assert_ne!(&on_disk[0..2], &b"PK"[..]);
    }

    #[test]
    fn tampered_blob_is_rejected() {
        let store = ArchiveStore::new(tmp("dsr-archive-tamper"), "secret", 30);
        let op = OperationId::generate();
        let plain = build_export_bundle(&subject(), &[], "p@example.com").unwrap();
        store
            .store(&op, &subject(), &plain, vec![], vec![])
            .unwrap();

        let blob_path = store.blob_path(&op);
        let mut blob = std::fs::read(&blob_path).unwrap();
        blob[0] ^= 0xff;
        std::fs::write(&blob_path, blob).unwrap();

        let err = store.open(&op).unwrap_err();
        assert!(matches!(err, Error::Archive(_)));
    }

    #[test]
    fn purge_removes_only_expired_archives() {
        let store = ArchiveStore::new(tmp("dsr-archive-purge"), "secret", 30);
        let fresh = OperationId::generate();
        let expired = OperationId::generate();
        let plain = build_export_bundle(&subject(), &[], "p@example.com").unwrap();

        store
            .store(&fresh, &subject(), &plain, vec![], vec![])
            .unwrap();
        let mut old_meta = store
            .store(&expired, &subject(), &plain, vec![], vec![])
            .unwrap();

        // Rewrite the sidecar with an expiry in the past.
        old_meta.expires_at = Utc::now() - Duration::days(1);
        std::fs::write(
            store.meta_path(&expired),
            serde_json::to_string_pretty(&old_meta).unwrap(),
        )
        .unwrap();

        let purged = store.purge_expired(Utc::now()).unwrap();
        assert_eq!(purged, vec![expired.clone()]);
        assert!(store.meta(&expired).unwrap().is_none());
        assert!(!store.blob_path(&expired).exists());
        assert!(store.meta(&fresh).unwrap().is_some());
    }
}
