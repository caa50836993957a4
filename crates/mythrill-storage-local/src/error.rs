use mythrill_storage_core::{Category, CollectError, DocumentRef, StoreError};
use thiserror::Error;

fn megabytes(bytes: &u64) -> f64 {
    *bytes as f64 / (1024.0 * 1024.0)
}

/// Why a write was refused by the quota enforcer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaReason {
    /// The tier carries no storage at all (guest).
    NoPersistence,
    /// The write would exceed the tier's byte total.
    TotalBytes,
    /// The category already holds its maximum number of documents.
    ItemLimit,
}

/// Errors surfaced by the sync engine.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(
        "Storage limit exceeded for {category}. Current usage: {:.2}MB, Limit: {:.2}MB, Requested: {:.2}MB",
        megabytes(.current_bytes),
        megabytes(.limit_bytes),
        megabytes(.requested_bytes)
    )]
    QuotaExceeded {
        category: Category,
        reason: QuotaReason,
        current_bytes: u64,
        limit_bytes: u64,
        requested_bytes: u64,
    },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Conflict on {0} must be resolved before it can be saved")]
    ConflictUnresolved(DocumentRef),

    #[error("No conflict pending on {0}")]
    NoConflict(DocumentRef),

    #[error("Domain {0} is not registered")]
    UnknownDomain(DocumentRef),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) | StoreError::Timeout(msg) => {
                SyncError::StoreUnavailable(msg)
            }
            StoreError::PermissionDenied(msg) => SyncError::PermissionDenied(msg),
            other => SyncError::Store(other),
        }
    }
}

impl From<CollectError> for SyncError {
    fn from(err: CollectError) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl SyncError {
    /// Whether the failed save keeps its edits in memory for the next cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::StoreUnavailable(_) | SyncError::ConflictUnresolved(_)
        )
    }
}
