//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

/// Outcome of a compare-and-set update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition<T> {
    /// The precondition held; carries the updated record.
    Applied(T),
    /// The precondition did not hold; carries the record unchanged.
    Rejected(T),
}

impl<T> Transition<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// The record, whichever way the update went.
    pub fn into_inner(self) -> T {
        match self {
            Self::Applied(t) | Self::Rejected(t) => t,
        }
    }
}
