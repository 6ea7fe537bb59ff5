//! veloflux-api: REST control surface for VeloFlux.
//!
//! Exposes tenant orchestration and cluster state over HTTP. Handlers only
//! translate between JSON and the [`Orchestrator`] / [`ClusterCoordinator`]
//! calls; every response uses the `{success, data, error}` envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/health` | Liveness and node summary |
//! | GET | `/api/tenants/{tenant_id}/orchestration` | Tenant orchestration config |
//! | PUT | `/api/tenants/{tenant_id}/orchestration` | Replace the config |
//! | GET | `/api/tenants/{tenant_id}/orchestration/status` | Deployment status |
//! | GET | `/api/tenants/{tenant_id}/orchestration/detailed_status` | Status, pods, events, metrics |
//! | POST | `/api/tenants/{tenant_id}/orchestration/deploy` | Deploy the tenant instance |
//! | POST | `/api/tenants/{tenant_id}/orchestration/drain` | Roll every pod |
//! | POST | `/api/tenants/{tenant_id}/orchestration/scale` | Set the replica count |
//! | PUT | `/api/tenants/{tenant_id}/orchestration/autoscale` | Autoscaling policy |
//! | PUT | `/api/tenants/{tenant_id}/orchestration/resources` | Container resource limits |
//! | GET | `/api/cluster/status` | Cluster summary |
//! | GET | `/api/cluster/nodes` | Cluster members |
//! | GET | `/api/cluster/state/{state_type}` | All entries of a state type |
//! | GET | `/api/cluster/state/{state_type}/{*key}` | One state entry |
//! | PUT | `/api/cluster/state/{state_type}/{*key}` | Publish a state entry |

pub mod cluster;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use veloflux_cluster::ClusterCoordinator;
use veloflux_orchestrator::Orchestrator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub cluster: Arc<dyn ClusterCoordinator>,
    /// `None` when orchestration is disabled; those routes answer 503.
    pub orchestrator: Option<Orchestrator>,
}

impl ApiState {
    pub fn new(cluster: Arc<dyn ClusterCoordinator>) -> Self {
        Self {
            cluster,
            orchestrator: None,
        }
    }

    pub fn with_orchestrator(mut self, orchestrator: Orchestrator) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let orchestration = "/tenants/{tenant_id}/orchestration";
    let api_routes = Router::new()
        .route(
            orchestration,
            get(handlers::get_orchestration_config).put(handlers::set_orchestration_config),
        )
        .route(
            &format!("{orchestration}/status"),
            get(handlers::get_deployment_status),
        )
        .route(
            &format!("{orchestration}/detailed_status"),
            get(handlers::get_detailed_deployment_status),
        )
        .route(&format!("{orchestration}/deploy"), post(handlers::deploy_tenant))
        .route(&format!("{orchestration}/drain"), post(handlers::drain_tenant))
        .route(&format!("{orchestration}/scale"), post(handlers::scale_tenant))
        .route(&format!("{orchestration}/autoscale"), put(handlers::update_autoscaling))
        .route(&format!("{orchestration}/resources"), put(handlers::update_resources))
        .route("/cluster/status", get(cluster::cluster_status))
        .route("/cluster/nodes", get(cluster::list_nodes))
        .route("/cluster/state/{state_type}", get(cluster::list_state))
        .route(
            "/cluster/state/{state_type}/{*key}",
            get(cluster::get_state).put(cluster::publish_state),
        );

    Router::new()
        .nest("/api", api_routes)
        .route("/health", get(handlers::health))
        .with_state(state)
}
