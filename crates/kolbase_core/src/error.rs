//! Error types for the storage and maintenance layer.
use thiserror::Error;

/// Top-level error type for store operations.
///
/// Read misses are not errors: lookup APIs return `Ok(None)` so callers can
/// tell "no data" apart from "couldn't reach the store".
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] redb::Error),

    #[error("Storage error: {0}")]
    StorageMessage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid natural key: {0}")]
    InvalidKey(String),

    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    #[error("Not found")]
    NotFound,

    #[error("Lock contention on '{scope}'")]
    LockContention { scope: String },

    #[error("Index write failed for '{index}': {reason}")]
    IndexWriteFailed { index: String, reason: String },

    #[error("Rebuild already in progress for '{index}'")]
    RebuildInProgress { index: String },

    #[error("Rebuild verification failed for '{index}': {reason}")]
    RebuildVerificationFailed { index: String, reason: String },
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    ///
    /// Caller errors (bad keys, schema violations) and definitive outcomes
    /// are not transient; storage-level failures are.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::StorageMessage(_) | Self::LockContention { .. }
        )
    }
}

impl From<redb::DatabaseError> for StoreError {
    fn from(value: redb::DatabaseError) -> Self {
        Self::Database(value.into())
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(value: redb::TransactionError) -> Self {
        Self::Database(value.into())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(value: redb::TableError) -> Self {
        Self::Database(value.into())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(value: redb::StorageError) -> Self {
        Self::Database(value.into())
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(value: redb::CommitError) -> Self {
        Self::Database(value.into())
    }
}
