//! Error taxonomy for the ingestion service boundary.

use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced to callers of the ingestion/timeline core.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Bad, missing or oversized upload, or an invalid local path. No side
    /// effects have occurred and no external process was invoked.
    #[error("{0}")]
    Validation(String),

    #[error("Timeline not found")]
    TimelineNotFound,

    #[error("Event not found")]
    EventNotFound,

    /// Durable-backend ownership mismatch. Distinct from NotFound.
    #[error("Access denied")]
    Forbidden,

    /// Durable write failed after transcription succeeded. The artifact is
    /// retained on disk; the caller holds a draft result.
    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TimelineNotFound(_) => Self::TimelineNotFound,
            StoreError::EventNotFound(_) => Self::EventNotFound,
            StoreError::OwnerRequired => Self::Forbidden,
            StoreError::EventLimit { .. } => Self::Validation(err.to_string()),
            other => Self::Persistence(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
