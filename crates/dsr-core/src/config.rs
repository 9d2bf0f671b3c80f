use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// How erasure treats a given store: drop the subject's records entirely, or
/// replace identifying fields with pseudonym tokens while keeping the rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErasurePolicy {
    Delete,
    Anonymize,
}

impl ErasurePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "delete" => Some(ErasurePolicy::Delete),
            "anonymize" => Some(ErasurePolicy::Anonymize),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErasurePolicy::Delete => "delete",
            ErasurePolicy::Anonymize => "anonymize",
        }
    }
}

/// Typed configuration for the compliance engine and its store adapters.
#[derive(Clone, Debug)]
pub struct Config {
    // Storage layout
    pub data_dir: PathBuf,
    pub audit_log_path: PathBuf,

    // Authorization
    pub authorized_operators: Vec<String>,

    // Install secret: keys archive encryption and pseudonym derivation.
    pub secret: String,

    // Retention / erasure
    pub export_retention_days: u32,
    pub erasure_policies: HashMap<String, ErasurePolicy>,
    pub default_erasure_policy: ErasurePolicy,

    // Export archive contents
    pub privacy_contact: String,

    // Per-store call timeout inside operations
    pub store_timeout: Duration,

    // Relational store adapter (enabled when the URL is set)
    pub postgrest_url: Option<String>,
    pub postgrest_api_key: Option<String>,
    pub postgrest_tables: Vec<String>,

    // File storage adapter
    pub filestore_root: Option<PathBuf>,

    // Third-party connector adapter
    pub connector_url: Option<String>,
    pub connector_token: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let secret = env_str("DSR_SECRET").and_then(non_empty).ok_or_else(|| {
            Error::Config("DSR_SECRET environment variable is required".to_string())
        })?;

        let authorized_operators = parse_csv(env_str("DSR_AUTHORIZED_OPERATORS"));
        if authorized_operators.is_empty() {
            return Err(Error::Config(
                "DSR_AUTHORIZED_OPERATORS environment variable is required".to_string(),
            ));
        }

        let data_dir = env_path("DSR_DATA_DIR").unwrap_or_else(|| PathBuf::from("data"));
        fs::create_dir_all(&data_dir)?;

        let audit_log_path =
            env_path("DSR_AUDIT_LOG_PATH").unwrap_or_else(|| data_dir.join("audit.jsonl"));

        let export_retention_days = env_u32("DSR_EXPORT_RETENTION_DAYS").unwrap_or(30);

        let erasure_policies = parse_csv_policies(env_str("DSR_ERASURE_POLICIES"))?;
        let default_erasure_policy = match env_str("DSR_DEFAULT_ERASURE_POLICY") {
            Some(raw) => ErasurePolicy::parse(&raw).ok_or_else(|| {
                Error::Config(format!("invalid DSR_DEFAULT_ERASURE_POLICY: {raw:?}"))
            })?,
            None => ErasurePolicy::Anonymize,
        };

        let privacy_contact =
            env_str("DSR_PRIVACY_CONTACT").unwrap_or_else(|| "privacy@example.com".to_string());

        let store_timeout =
            Duration::from_millis(env_u64("DSR_STORE_TIMEOUT_MS").unwrap_or(30_000));

        let postgrest_url = env_str("DSR_POSTGREST_URL").and_then(non_empty);
        let postgrest_api_key = env_str("DSR_POSTGREST_API_KEY").and_then(non_empty);
        let postgrest_tables = parse_csv(env_str("DSR_POSTGREST_TABLES"));

        let filestore_root = env_path("DSR_FILESTORE_ROOT");

        let connector_url = env_str("DSR_CONNECTOR_URL").and_then(non_empty);
        let connector_token = env_str("DSR_CONNECTOR_TOKEN").and_then(non_empty);

        Ok(Self {
            data_dir,
            audit_log_path,
            authorized_operators,
            secret,
            export_retention_days,
            erasure_policies,
            default_erasure_policy,
            privacy_contact,
            store_timeout,
            postgrest_url,
            postgrest_api_key,
            postgrest_tables,
            filestore_root,
            connector_url,
            connector_token,
        })
    }

    pub fn operations_dir(&self) -> PathBuf {
        self.data_dir.join("operations")
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.data_dir.join("archives")
    }

    pub fn restrictions_dir(&self) -> PathBuf {
        self.data_dir.join("restrictions")
    }

    pub fn erasure_policy_for(&self, store_name: &str) -> ErasurePolicy {
        self.erasure_policies
            .get(store_name)
            .copied()
            .unwrap_or(self.default_erasure_policy)
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `store=policy` pairs, e.g. `users_db=anonymize,uploads=delete`.
///
/// Unknown policy values are a hard config error rather than a silent fall
/// back to the default: erasure semantics must never be guessed.
fn parse_csv_policies(v: Option<String>) -> Result<HashMap<String, ErasurePolicy>> {
    let mut out = HashMap::new();
    let Some(v) = v else {
        return Ok(out);
    };

    for entry in v.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((store, policy)) = entry.split_once('=') else {
            return Err(Error::Config(format!(
                "invalid DSR_ERASURE_POLICIES entry (expected store=policy): {entry:?}"
            )));
        };
        let store = store.trim();
        let parsed = ErasurePolicy::parse(policy).ok_or_else(|| {
            Error::Config(format!(
                "invalid erasure policy for store {store:?}: {policy:?}"
            ))
        })?;
        out.insert(store.to_string(), parsed);
    }

    Ok(out)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
