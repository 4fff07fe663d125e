//! Error taxonomy shared by every layer of the memory engine.

use std::time::Duration;

use mneme_types::{InputKind, MetadataError};
use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can arise from memory operations.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Missing id. Recoverable; the caller decides what to do.
    #[error("memory not found: {0}")]
    NotFound(String),
    /// Id collision. Never expected given the id scheme.
    #[error("duplicate memory id: {0}")]
    DuplicateId(String),
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),
    /// The security middleware refused the input. Do not retry unmodified.
    #[error("{kind} input rejected: {reason}")]
    ValidationRejected { kind: InputKind, reason: String },
    #[error("storage quota exceeded: {used} of {limit} bytes")]
    QuotaExceeded { used: u64, limit: u64 },
    /// The backing store cannot be opened or written. Memory features are
    /// switched off for the rest of the process.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// Transient lock contention on the backing store.
    #[error("storage busy: {0}")]
    Busy(String),
    /// Record whose id does not match its kind, or similar structural fault.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("vector has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid metadata: {0}")]
    InvalidMetadata(#[from] MetadataError),
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("background task failed: {0}")]
    Task(String),
}

impl MemoryError {
    /// `true` for transient failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MemoryError::Timeout(_) | MemoryError::Busy(_))
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                MemoryError::Busy(err.to_string())
            }
            Some(
                ErrorCode::CannotOpen
                | ErrorCode::NotADatabase
                | ErrorCode::ReadOnly
                | ErrorCode::DiskFull
                | ErrorCode::SystemIoFailure
                | ErrorCode::DatabaseCorrupt,
            ) => MemoryError::StorageUnavailable(err.to_string()),
            _ => MemoryError::Sqlite(err),
        }
    }
}

impl From<tokio::task::JoinError> for MemoryError {
    fn from(err: tokio::task::JoinError) -> Self {
        MemoryError::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(MemoryError::Timeout(Duration::from_millis(5)).is_retryable());
        assert!(MemoryError::Busy("locked".into()).is_retryable());
        assert!(!MemoryError::NotFound("x".into()).is_retryable());
        assert!(!MemoryError::QuotaExceeded { used: 2, limit: 1 }.is_retryable());
    }

    #[test]
    fn sqlite_cannot_open_maps_to_storage_unavailable() {
        let err = rusqlite::Connection::open("/nonexistent-dir/definitely/missing.db").unwrap_err();
        assert!(matches!(MemoryError::from(err), MemoryError::StorageUnavailable(_)));
    }
}
