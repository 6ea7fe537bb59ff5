//! Error types for the shared state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while talking to the shared store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl StateError {
    /// True when the store could not be reached at all.
    pub fn is_connection(&self) -> bool {
        matches!(self, StateError::Connection(_))
    }
}
