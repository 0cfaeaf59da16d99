//! Error types for `gantry`.
//!
//! One crate-wide error enum plus a `Result` alias. The import pipeline
//! distinguishes cancellation from failure: [`GantryError::Cancelled`] is a
//! normal terminal state, everything else recorded on a session is a failure.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, GantryError>;

/// All errors produced by gantry.
#[derive(Debug, Error)]
pub enum GantryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation failed for '{field}': {message}")]
    Validation { field: String, message: String },

    /// A remote tracker call failed (bad status, malformed payload, missing
    /// entity). Step-fatal everywhere except attachment downloads.
    #[error("remote tracker error: {message}")]
    Remote { message: String },

    /// Mapping a single source entity failed. The entity is dropped and the
    /// pipeline continues.
    #[error("mapping '{key}' failed: {reason}")]
    Mapping { key: String, reason: String },

    #[error("blob store error: {0}")]
    Blob(String),

    #[error("actor '{actor}' already has an active import")]
    AlreadyImporting { actor: String },

    #[error("import session '{id}' not found")]
    SessionNotFound { id: String },

    /// Distinguished sentinel for cooperative cancellation.
    #[error("import cancelled")]
    Cancelled,
}

impl GantryError {
    /// Construct a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Construct a remote tracker error.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Construct a mapping error for one source entity.
    pub fn mapping(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Mapping {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// True if this error is the cancellation sentinel.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
