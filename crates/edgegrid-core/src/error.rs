use thiserror::Error;

/// Errors raised by key and field validation in the data model.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid {kind} name {name:?}")]
    InvalidName { kind: &'static str, name: String },

    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid access ports {ports:?}: {reason}")]
    InvalidPorts { ports: String, reason: String },

    #[error("key decode error: {0}")]
    KeyDecode(String),

    #[error("name pattern error: {0}")]
    Pattern(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
