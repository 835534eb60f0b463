//! Error taxonomy for storage operations
//!
//! Every backend, the sync-state tracker and the reconciliation engine
//! report failures through [`Error`]. The variant tells the caller what
//! to do next: retry ([`Error::Transient`]), stop ([`Error::Integrity`],
//! [`Error::Unsupported`]), or investigate drift ([`Error::PartialFailure`]).

use std::path::PathBuf;

use thiserror::Error;

use crate::domain::{FileId, SyncState};

#[derive(Debug, Error)]
pub enum Error {
    /// A backend is missing a required attribute or has an invalid one
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Timeouts, refused connections, lock waits that ran out
    #[error("Transient I/O error: {0}")]
    Transient(String),

    /// Rename target exists, object key does not round-trip, fetched content absent
    #[error("Integrity violation: {0}")]
    Integrity(String),

    /// The backend does not support this operation
    #[error("Operation not permitted: {0}")]
    Unsupported(String),

    /// A transfer stopped midway; the destination holds partial content
    #[error("Partial transfer of {}: {reason}", path.display())]
    PartialFailure { path: PathBuf, reason: String },

    #[error("Backend '{0}' is offline")]
    Offline(String),

    #[error("Backend '{0}' is read-only")]
    ReadOnly(String),

    #[error("Cannot {operation} file {file_id} while it is {state}")]
    InvalidState {
        file_id: FileId,
        state: SyncState,
        operation: &'static str,
    },

    #[error("Illegal file name: '{0}'")]
    InvalidName(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("State store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if retrying the whole operation is safe
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Returns true for failures that left partial content behind
    pub fn is_partial(&self) -> bool {
        matches!(self, Error::PartialFailure { .. })
    }

    pub(crate) fn partial(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::PartialFailure {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
