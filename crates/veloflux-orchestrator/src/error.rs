//! Orchestrator error types.

use thiserror::Error;
use veloflux_state::StateError;

use crate::platform::PlatformError;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestration is disabled")]
    Disabled,

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    #[error("tenant {tenant_id} is not dedicated: can only {operation} dedicated instances")]
    NotDedicated { tenant_id: String, operation: String },

    #[error("deployment not found for tenant {0}")]
    DeploymentNotFound(String),

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    pub(crate) fn not_dedicated(tenant_id: &str, operation: &str) -> Self {
        Self::NotDedicated {
            tenant_id: tenant_id.to_string(),
            operation: operation.to_string(),
        }
    }
}
