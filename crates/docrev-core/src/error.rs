//! Error kinds surfaced by documents and stores.

use crate::rev_id::RevisionIdError;

/// Errors for document and store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Unknown document or revision
    #[error("not found: {0}")]
    NotFound(String),
    /// Expected parent revision is no longer a leaf
    #[error("conflict: {0}")]
    Conflict(String),
    /// Malformed or mismatched ID, or misuse of a reserved key
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Unclassified store failure
    #[error("store error: {0}")]
    Unknown(String),
}

impl Error {
    /// Check whether this is a `Conflict`.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Check whether this is a `NotFound`.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<RevisionIdError> for Error {
    fn from(err: RevisionIdError) -> Self {
        Error::Forbidden(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Unknown(err.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
