use crate::domain::OperationStatus;

/// Core error type for the compliance engine.
///
/// Adapter crates should map their store-specific failures into this type so
/// the engine can decide what fails a whole operation and what is recorded as
/// a per-store failure inside an otherwise successful one.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("authorization denied: {0}")]
    Authorization(String),

    #[error("no data store reachable: {0}")]
    LocatorUnavailable(String),

    #[error("store {store}: {message}")]
    Store { store: String, message: String },

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: OperationStatus,
        to: OperationStatus,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("audit write failed: {0}")]
    AuditWrite(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn store(store: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Store {
            store: store.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
