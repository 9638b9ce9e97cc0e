use thiserror::Error;

/// Faults that make a reconciliation run untrustworthy. Any of these aborts the
/// run before a registry or result set is published.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityFault {
    #[error("verbatim identifier '{key}' is claimed by both '{first}' and '{second}'")]
    VerbatimCollision {
        key: String,
        first: String,
        second: String,
    },

    #[error("canonical id '{0}' is carried by more than one entity")]
    DuplicateCanonicalId(String),

    #[error("malformed {kind} in {location}: {detail}")]
    MalformedInput {
        kind: String,
        location: String,
        detail: String,
    },

    #[error("resolved relationship points at '{0}', which is not in the entity set")]
    DanglingEndpoint(String),
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("integrity fault: {0}")]
    Integrity(#[from] IntegrityFault),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Checkpoint rejected: {0}")]
    Checkpoint(String),

    #[error("Supersession rejected: {0}")]
    Supersession(String),
}

impl ReconcileError {
    /// The integrity fault behind this error, if that is what it is.
    pub fn integrity_fault(&self) -> Option<&IntegrityFault> {
        match self {
            ReconcileError::Integrity(fault) => Some(fault),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
