use thiserror::Error;

/// Errors raised by document and account stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    /// Whether the error means the store cannot be reached right now.
    ///
    /// These are retried on the next save cycle instead of being reported as data loss.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

/// Errors raised by a domain's change collector.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectError {
    #[error("Snapshot serialization failed: {0}")]
    Serialization(String),

    #[error("Snapshot does not belong to this domain: {0}")]
    WrongDomain(String),

    #[error("Unsupported snapshot schema version {found} (max {supported})")]
    UnsupportedSchema { found: u32, supported: u32 },
}

impl From<serde_json::Error> for CollectError {
    fn from(err: serde_json::Error) -> Self {
        CollectError::Serialization(err.to_string())
    }
}
