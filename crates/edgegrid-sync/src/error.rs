use edgegrid_core::TrackedState;
use edgegrid_store::StoreError;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Timed out; expected state {expected} but is {current}")]
    Timeout {
        expected: TrackedState,
        current: TrackedState,
    },

    /// The object reached its error state with these agent-reported errors.
    #[error("Encountered failures: [{}]", .0.join(", "))]
    Failed(Vec<String>),

    #[error("Unknown failure")]
    UnknownFailure,

    #[error("timed out waiting on {0}")]
    WaitTimeout(String),
}
