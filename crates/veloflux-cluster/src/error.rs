//! Cluster error types.

use thiserror::Error;
use veloflux_state::StateError;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("clustering is disabled")]
    Disabled,

    #[error("cluster already started")]
    AlreadyStarted,

    #[error("state not found: {state_type}/{key}")]
    StateNotFound { state_type: String, key: String },

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}
