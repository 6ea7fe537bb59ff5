//! veloflux-orchestrator: tenant deployment orchestration.
//!
//! A tenant runs either on the shared VeloFlux pool or in a dedicated
//! Kubernetes namespace with its own Deployment, Service and optional
//! Ingress and HorizontalPodAutoscaler. The [`Orchestrator`] keeps each
//! tenant's desired [`TenantOrchestratorConfig`] in the shared store and
//! reconciles it against the platform through background jobs, recording
//! progress as a pollable [`DeploymentStatus`].
//!
//! # Architecture
//!
//! ```text
//!   set_tenant_config ──► store ──► ReconcileQueue ──► Reconciler ──► PlatformClient
//!                                        │                                 │
//!   get_deployment_status ◄── store ◄────┘           drift watcher ◄───────┘
//! ```
//!
//! Mutations return as soon as the job is queued. Completion or failure is
//! only visible through the stored status.

pub mod config;
pub mod error;
pub mod jobs;
pub mod orchestrator;
pub mod platform;
pub mod reconcile;
pub mod resources;
pub mod tenant;
pub mod types;
pub mod watcher;

pub use config::OrchestrationConfig;
pub use error::{OrchestratorError, OrchestratorResult};
pub use jobs::ReconcileQueue;
pub use orchestrator::{ConfigChangeHook, Orchestrator};
pub use platform::{InMemoryPlatform, KubePlatform, PlatformClient, PlatformError};
pub use tenant::{InMemoryTenants, StoreTenantDirectory, Tenant, TenantDirectory};
pub use types::*;
pub use watcher::{DriftWatcher, LeaderGate};
