use std::sync::OnceLock;

use regex::Regex;

use crate::{errors::Error, Result};

// Subject ids end up as file names (restriction flags) and URL path segments
// (REST adapters), so the allowed alphabet is strict. Emails are valid ids.
const SUBJECT_ID_MAX_LEN: usize = 128;
const STORE_NAME_MAX_LEN: usize = 64;

fn subject_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.@-]*$").expect("valid regex"))
}

fn store_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("valid regex"))
}

pub fn validate_subject_id(raw: &str) -> Result<()> {
    if raw.is_empty() {
        return Err(Error::Config("subject id is empty".to_string()));
    }
    if raw.len() > SUBJECT_ID_MAX_LEN {
        return Err(Error::Config(format!(
            "subject id exceeds {SUBJECT_ID_MAX_LEN} chars"
        )));
    }
    if !subject_id_re().is_match(raw) {
        return Err(Error::Config(format!(
            "subject id contains forbidden characters: {raw:?}"
        )));
    }
    Ok(())
}

/// Store names become zip entry names (`{store}.json`), so the same
/// no-traversal discipline applies.
pub fn validate_store_name(raw: &str) -> Result<()> {
    if raw.is_empty() {
        return Err(Error::Config("store name is empty".to_string()));
    }
    if raw.len() > STORE_NAME_MAX_LEN {
        return Err(Error::Config(format!(
            "store name exceeds {STORE_NAME_MAX_LEN} chars"
        )));
    }
    if !store_name_re().is_match(raw) {
        return Err(Error::Config(format!(
            "store name contains forbidden characters: {raw:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_email_shaped_subject_ids() {
        validate_subject_id("alice@example.com").unwrap();
        validate_subject_id("user-123").unwrap();
        validate_subject_id("7f9c2ba4").unwrap();
    }

    #[test]
    fn rejects_traversal_in_subject_ids() {
        assert!(validate_subject_id("../etc/passwd").is_err());
        assert!(validate_subject_id("..").is_err());
        assert!(validate_subject_id(".hidden").is_err());
        assert!(validate_subject_id("a/b").is_err());
        assert!(validate_subject_id("a\\b").is_err());
        assert!(validate_subject_id("").is_err());
    }

    #[test]
    fn rejects_oversized_subject_ids() {
        let long = "a".repeat(SUBJECT_ID_MAX_LEN + 1);
        assert!(validate_subject_id(&long).is_err());
    }

    #[test]
    fn store_names_are_lowercase_tokens() {
        validate_store_name("postgrest").unwrap();
        validate_store_name("file_storage").unwrap();
        assert!(validate_store_name("Postgrest").is_err());
        assert!(validate_store_name("a b").is_err());
        assert!(validate_store_name("a/b").is_err());
    }
}
