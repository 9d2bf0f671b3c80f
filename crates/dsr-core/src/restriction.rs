use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{domain::SubjectId, security::validate_subject_id, Result};

/// Durable processing-restriction flag for one subject.
///
/// The flag is a compliance record in its own right: erasure of the subject's
/// data leaves it in place, and only an explicit lift clears it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestrictionFlag {
    pub subject_id: SubjectId,
    pub restricted: bool,
    pub set_at: DateTime<Utc>,
    pub authorized_by: String,
}

/// One JSON file per subject under the restrictions directory.
pub struct RestrictionStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl RestrictionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub async fn set(
        &self,
        subject: &SubjectId,
        restricted: bool,
        authorized_by: &str,
    ) -> Result<RestrictionFlag> {
        validate_subject_id(&subject.0)?;

        let flag = RestrictionFlag {
            subject_id: subject.clone(),
            restricted,
            set_at: Utc::now(),
            authorized_by: authorized_by.to_string(),
        };

        let _guard = self.lock.lock().await;
        std::fs::create_dir_all(&self.dir)?;
        let txt = serde_json::to_string(&flag)?;
        std::fs::write(self.flag_path(subject), txt)?;
        Ok(flag)
    }

    pub async fn get(&self, subject: &SubjectId) -> Result<Option<RestrictionFlag>> {
        validate_subject_id(&subject.0)?;

        let _guard = self.lock.lock().await;
        let path = self.flag_path(subject);
        if !path.exists() {
            return Ok(None);
        }
        let txt = std::fs::read_to_string(path)?;
        if txt.trim().is_empty() {
            return Ok(None);
        }
        let flag: RestrictionFlag = serde_json::from_str(&txt)?;
        Ok(Some(flag))
    }

    /// Subjects with no flag on file are unrestricted.
    pub async fn is_restricted(&self, subject: &SubjectId) -> Result<bool> {
        Ok(self
            .get(subject)
            .await?
            .map(|f| f.restricted)
            .unwrap_or(false))
    }

    fn flag_path(&self, subject: &SubjectId) -> PathBuf {
        self.dir.join(format!("{subject}.json"))
    }
}
