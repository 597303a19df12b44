//! Error taxonomy for drover operations.
//!
//! Errors fall into four classes that drive the requeue policy of the pool:
//! optimistic-concurrency conflicts (`Modified`), temporary conditions that are
//! retried with backoff, non-temporary errors that are never retried forever, and
//! plain lookups (`NotFound`).

use thiserror::Error;

/// Core error type for drover operations.
#[derive(Debug, Error)]
pub enum Error {
    // Store errors
    #[error("object '{id}' not found")]
    NotFound { id: String },

    #[error("object '{id}' was modified concurrently")]
    Modified { id: String },

    #[error("unknown object type '{kind}'")]
    UnknownType { kind: String },

    #[error("invalid object: {reason}")]
    InvalidObject { reason: String },

    // Parsing errors
    #[error("invalid id '{id}': {reason}")]
    InvalidId { id: String, reason: String },

    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("invalid metamodel: {reason}")]
    InvalidMetaModel { reason: String },

    // Processing conditions
    #[error("{target} is locked by run '{run}'")]
    Locked { target: String, run: String },

    #[error("{target} is busy")]
    Busy { target: String },

    #[error("temporary failure: {reason}")]
    Temporary { reason: String },

    #[error("{reason}")]
    NonTemporary { reason: String },

    #[error("configuration error: {reason}")]
    Config { reason: String },

    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    #[error("shutting down")]
    ShuttingDown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a not found error.
    pub fn not_found(id: impl ToString) -> Self {
        Self::NotFound { id: id.to_string() }
    }

    /// Create an optimistic-concurrency conflict error.
    pub fn modified(id: impl ToString) -> Self {
        Self::Modified { id: id.to_string() }
    }

    /// Create an unknown type error.
    pub fn unknown_type(kind: impl Into<String>) -> Self {
        Self::UnknownType { kind: kind.into() }
    }

    /// Create an invalid object error.
    pub fn invalid_object(reason: impl Into<String>) -> Self {
        Self::InvalidObject {
            reason: reason.into(),
        }
    }

    /// Create an invalid id error.
    pub fn invalid_id(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidId {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid key error.
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid metamodel error.
    pub fn invalid_metamodel(reason: impl Into<String>) -> Self {
        Self::InvalidMetaModel {
            reason: reason.into(),
        }
    }

    /// Create a locked error.
    pub fn locked(target: impl ToString, run: impl ToString) -> Self {
        Self::Locked {
            target: target.to_string(),
            run: run.to_string(),
        }
    }

    /// Create a busy error.
    pub fn busy(target: impl ToString) -> Self {
        Self::Busy {
            target: target.to_string(),
        }
    }

    /// Create a temporary error.
    pub fn temporary(reason: impl Into<String>) -> Self {
        Self::Temporary {
            reason: reason.into(),
        }
    }

    /// Create a non-temporary error.
    pub fn non_temporary(reason: impl Into<String>) -> Self {
        Self::NonTemporary {
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Whether this is an optimistic-concurrency conflict.
    #[must_use]
    pub const fn is_modified(&self) -> bool {
        matches!(self, Self::Modified { .. })
    }

    /// Whether the addressed object does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether retrying later may succeed without any change of input.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(
            self,
            Self::Modified { .. }
                | Self::Locked { .. }
                | Self::Busy { .. }
                | Self::Temporary { .. }
                | Self::Io(_)
        )
    }

    /// Whether the error reflects a structural problem that retrying cannot fix.
    #[must_use]
    pub const fn is_non_temporary(&self) -> bool {
        matches!(
            self,
            Self::NonTemporary { .. }
                | Self::InvalidMetaModel { .. }
                | Self::InvalidKey { .. }
                | Self::InvalidId { .. }
                | Self::UnknownType { .. }
                | Self::Config { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
