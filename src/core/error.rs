//! Error types shared by the storage engine and the etcd bridge.
//!
//! Compare-and-swap conflicts are not errors: the engine reports them as an
//! unsucceeded outcome carrying the current row. Everything in this module is
//! a genuine failure that ends the request.

use thiserror::Error;

/// Common statebase error conditions.
#[derive(Debug, Error)]
pub enum StatebaseError {
    /// Create found a live row for the key, or lost the insert race to
    /// another creator.
    #[error("key exists")]
    KeyExists,

    /// Requested revision is below the compaction watermark.
    #[error("revision {revision} has been compacted; compaction watermark is {compact_revision}")]
    Compacted {
        revision: i64,
        compact_revision: i64,
    },

    /// Requested revision has not been written yet.
    #[error("revision {revision} is in the future; current revision is {current_revision}")]
    FutureRevision {
        revision: i64,
        current_revision: i64,
    },

    /// Request shape or option outside the implemented subset.
    #[error("{what} is not supported")]
    Unsupported { what: String },

    /// Invalid request.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// SQL driver failure, passed through untranslated.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl StatebaseError {
    /// Create an Unsupported error.
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported { what: what.into() }
    }

    /// Create an InvalidRequest error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this is the canonical key-exists condition.
    pub fn is_key_exists(&self) -> bool {
        matches!(self, Self::KeyExists)
    }
}

/// Result type using StatebaseError.
pub type StatebaseResult<T> = Result<T, StatebaseError>;
