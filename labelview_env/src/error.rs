//! Error types for the LabelView environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Filesystem or backend write/read failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Requested folder does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Payload could not be (de)serialized at the transport layer
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Creates a not-found error.
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }
}

impl From<std::io::Error> for EnvError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(err.to_string())
        } else {
            Self::Storage(err.to_string())
        }
    }
}
