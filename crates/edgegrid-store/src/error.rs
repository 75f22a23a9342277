//! Error types for the edgegrid store.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("key {0} already exists")]
    KeyExists(String),

    #[error("key {0} not found")]
    KeyNotFound(String),

    #[error("version mismatch on key {0}")]
    VersionMismatch(String),

    /// A compare in a transaction failed; the caller should retry.
    #[error("transaction conflict")]
    Conflict,

    #[error("transaction gave up after {0} attempts")]
    TooManyRetries(u32),

    #[error("lease {0} not found")]
    LeaseNotFound(u64),
}
