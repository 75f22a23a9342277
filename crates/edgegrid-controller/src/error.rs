//! Error types for the controller API.

use edgegrid_core::{CoreError, ObjKey, StoredObject};
use edgegrid_store::StoreError;
use edgegrid_sync::SyncError;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{kind} key {key} already exists")]
    KeyExists { kind: &'static str, key: String },

    #[error("{kind} key {key} not found")]
    NotFound { kind: &'static str, key: String },

    /// The object is mid-operation and the caller did not override.
    #[error("{0}")]
    Busy(String),

    #[error("{0}")]
    InUse(String),

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    ResourceExhausted(String),

    #[error("{0}")]
    CloudletNotReady(String),

    /// The agent reported an error state.
    #[error("{0}")]
    Agent(String),

    #[error("{0}")]
    Timeout(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    pub fn key_exists<T: StoredObject>(key: &T::Key) -> Self {
        ApiError::KeyExists {
            kind: T::TYPE_NAME,
            key: key.key_string(),
        }
    }

    pub fn not_found<T: StoredObject>(key: &T::Key) -> Self {
        ApiError::NotFound {
            kind: T::TYPE_NAME,
            key: key.key_string(),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Store(e) => ApiError::Store(e),
            SyncError::Timeout { .. } | SyncError::WaitTimeout(_) => ApiError::Timeout(e.to_string()),
            SyncError::Failed(_) | SyncError::UnknownFailure => ApiError::Agent(e.to_string()),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError::Invalid(e.to_string())
    }
}
