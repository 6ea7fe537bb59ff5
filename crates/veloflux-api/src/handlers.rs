//! REST API handlers for tenant orchestration.
//!
//! Each handler calls into the [`Orchestrator`] and returns a JSON envelope.
//! Mutations that only queue work answer `202 Accepted`; clients poll the
//! status route for the outcome.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::warn;

use veloflux_orchestrator::{
    AutoscalingSettings, DEFAULT_TARGET_CPU_UTILIZATION, OrchestrationMode, Orchestrator,
    OrchestratorError, ResourceLimits, TenantOrchestratorConfig,
};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn orchestrator_error(e: OrchestratorError) -> Response {
    let status = match &e {
        OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::TenantNotFound(_) | OrchestratorError::DeploymentNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        OrchestratorError::NotDedicated { .. } => StatusCode::CONFLICT,
        OrchestratorError::Disabled | OrchestratorError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => {
            warn!(error = %e, "orchestration request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(&e.to_string(), status).into_response()
}

fn orchestrator(state: &ApiState) -> Result<&Orchestrator, Response> {
    state.orchestrator.as_ref().ok_or_else(|| {
        error_response("orchestration is disabled", StatusCode::SERVICE_UNAVAILABLE).into_response()
    })
}

// ── Health ─────────────────────────────────────────────────────

/// GET /health
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(serde_json::json!({
        "status": "ok",
        "node_id": state.cluster.node_id(),
        "leader": state.cluster.is_leader(),
        "orchestration": state.orchestrator.is_some(),
    }))
}

// ── Configuration ──────────────────────────────────────────────

/// Body of `PUT .../orchestration`. The tenant comes from the path.
#[derive(Debug, Deserialize)]
pub struct OrchestrationConfigRequest {
    #[serde(default)]
    pub mode: OrchestrationMode,
    #[serde(default = "ResourceLimits::unset")]
    pub resource_limits: ResourceLimits,
    #[serde(default)]
    pub autoscaling_enabled: bool,
    #[serde(default)]
    pub min_replicas: i32,
    #[serde(default)]
    pub max_replicas: i32,
    #[serde(default)]
    pub target_cpu_utilization: i32,
    #[serde(default)]
    pub custom_domains: Vec<String>,
}

impl OrchestrationConfigRequest {
    /// Fill unset fields the way a freshly created tenant would have them.
    pub fn into_config(self, tenant_id: &str) -> TenantOrchestratorConfig {
        let defaults = TenantOrchestratorConfig::default_for(tenant_id);
        let mut resource_limits = defaults.resource_limits.clone();
        resource_limits.merge(&self.resource_limits);

        let min_replicas = if self.min_replicas < 1 {
            defaults.min_replicas
        } else {
            self.min_replicas
        };
        let mut max_replicas = self.max_replicas;
        let mut target = self.target_cpu_utilization;
        if self.autoscaling_enabled {
            if max_replicas <= min_replicas {
                max_replicas = min_replicas.saturating_mul(2);
            }
            if target <= 0 {
                target = DEFAULT_TARGET_CPU_UTILIZATION;
            }
        } else if max_replicas < 1 {
            max_replicas = defaults.max_replicas.max(min_replicas);
        }

        TenantOrchestratorConfig {
            mode: self.mode,
            resource_limits,
            autoscaling_enabled: self.autoscaling_enabled,
            min_replicas,
            max_replicas,
            target_cpu_utilization: target,
            custom_domains: self.custom_domains,
            ..defaults
        }
    }
}

/// GET /api/tenants/:tenant_id/orchestration
pub async fn get_orchestration_config(
    State(state): State<ApiState>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    let orch = match orchestrator(&state) {
        Ok(orch) => orch,
        Err(resp) => return resp,
    };
    match orch.get_tenant_config(&tenant_id).await {
        Ok(config) => ApiResponse::ok(config).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

/// PUT /api/tenants/:tenant_id/orchestration
pub async fn set_orchestration_config(
    State(state): State<ApiState>,
    Path(tenant_id): Path<String>,
    Json(req): Json<OrchestrationConfigRequest>,
) -> impl IntoResponse {
    let orch = match orchestrator(&state) {
        Ok(orch) => orch,
        Err(resp) => return resp,
    };
    let config = req.into_config(&tenant_id);
    if let Err(e) = config.validate() {
        return orchestrator_error(e);
    }
    match orch.set_tenant_config(config).await {
        Ok(stored) => ApiResponse::ok(stored).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

// ── Status ─────────────────────────────────────────────────────

/// GET /api/tenants/:tenant_id/orchestration/status
pub async fn get_deployment_status(
    State(state): State<ApiState>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    let orch = match orchestrator(&state) {
        Ok(orch) => orch,
        Err(resp) => return resp,
    };
    match orch.get_deployment_status(&tenant_id).await {
        Ok(status) => ApiResponse::ok(status).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

/// GET /api/tenants/:tenant_id/orchestration/detailed_status
pub async fn get_detailed_deployment_status(
    State(state): State<ApiState>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    let orch = match orchestrator(&state) {
        Ok(orch) => orch,
        Err(resp) => return resp,
    };
    match orch.get_detailed_deployment_status(&tenant_id).await {
        Ok(detailed) => ApiResponse::ok(detailed).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

// ── Instance operations ────────────────────────────────────────

/// POST /api/tenants/:tenant_id/orchestration/deploy
pub async fn deploy_tenant(
    State(state): State<ApiState>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    let orch = match orchestrator(&state) {
        Ok(orch) => orch,
        Err(resp) => return resp,
    };
    match orch.deploy_tenant_instance(&tenant_id).await {
        Ok(status) => (StatusCode::ACCEPTED, ApiResponse::ok(status)).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

/// POST /api/tenants/:tenant_id/orchestration/drain
pub async fn drain_tenant(
    State(state): State<ApiState>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    let orch = match orchestrator(&state) {
        Ok(orch) => orch,
        Err(resp) => return resp,
    };
    match orch.drain_tenant_instance(&tenant_id).await {
        Ok(status) => (StatusCode::ACCEPTED, ApiResponse::ok(status)).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

/// Scale request body.
#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub replicas: i32,
}

/// POST /api/tenants/:tenant_id/orchestration/scale
pub async fn scale_tenant(
    State(state): State<ApiState>,
    Path(tenant_id): Path<String>,
    Json(req): Json<ScaleRequest>,
) -> impl IntoResponse {
    let orch = match orchestrator(&state) {
        Ok(orch) => orch,
        Err(resp) => return resp,
    };
    if req.replicas < 1 {
        return error_response("replicas must be at least 1", StatusCode::BAD_REQUEST)
            .into_response();
    }
    match orch.scale_tenant_instance(&tenant_id, req.replicas).await {
        Ok(status) => (StatusCode::ACCEPTED, ApiResponse::ok(status)).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

/// PUT /api/tenants/:tenant_id/orchestration/autoscale
pub async fn update_autoscaling(
    State(state): State<ApiState>,
    Path(tenant_id): Path<String>,
    Json(settings): Json<AutoscalingSettings>,
) -> impl IntoResponse {
    let orch = match orchestrator(&state) {
        Ok(orch) => orch,
        Err(resp) => return resp,
    };
    if let Err(msg) = check_autoscaling(&settings) {
        return error_response(msg, StatusCode::BAD_REQUEST).into_response();
    }
    match orch.update_autoscaling_config(&tenant_id, settings).await {
        Ok(config) => ApiResponse::ok(config).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

fn check_autoscaling(settings: &AutoscalingSettings) -> Result<(), &'static str> {
    if settings.min_replicas < 1 {
        return Err("min_replicas must be at least 1");
    }
    if settings.max_replicas < settings.min_replicas {
        return Err("max_replicas must be greater than or equal to min_replicas");
    }
    if settings.enabled && !(10..=100).contains(&settings.target_cpu_utilization) {
        return Err("target_cpu_utilization must be between 10 and 100");
    }
    Ok(())
}

/// PUT /api/tenants/:tenant_id/orchestration/resources
///
/// Only the fields present in the body are changed.
pub async fn update_resources(
    State(state): State<ApiState>,
    Path(tenant_id): Path<String>,
    Json(limits): Json<ResourceLimits>,
) -> impl IntoResponse {
    let orch = match orchestrator(&state) {
        Ok(orch) => orch,
        Err(resp) => return resp,
    };
    if limits.is_unset() {
        return error_response(
            "at least one resource limit must be specified",
            StatusCode::BAD_REQUEST,
        )
        .into_response();
    }
    match orch.update_resource_limits(&tenant_id, limits).await {
        Ok(config) => ApiResponse::ok(config).into_response(),
        Err(e) => orchestrator_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::to_bytes;
    use veloflux_cluster::NoopCoordinator;
    use veloflux_orchestrator::{
        DeploymentPhase, InMemoryPlatform, InMemoryTenants, OrchestrationConfig, Tenant,
    };
    use veloflux_state::InMemoryStore;

    fn test_state() -> ApiState {
        let tenants = InMemoryTenants::new();
        tenants.insert(Tenant::new("acme", "Acme Corp"));
        let orchestrator = Orchestrator::new(
            OrchestrationConfig::enabled().with_image("veloflux/veloflux:2.0.0"),
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryPlatform::new()),
            Arc::new(tenants),
        );
        ApiState::new(Arc::new(NoopCoordinator::new())).with_orchestrator(orchestrator)
    }

    fn dedicated_request() -> OrchestrationConfigRequest {
        OrchestrationConfigRequest {
            mode: OrchestrationMode::Dedicated,
            resource_limits: ResourceLimits::unset(),
            autoscaling_enabled: true,
            min_replicas: 2,
            max_replicas: 5,
            target_cpu_utilization: 70,
            custom_domains: vec![],
        }
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn go_dedicated(state: &ApiState) {
        let resp = set_orchestration_config(
            State(state.clone()),
            Path("acme".to_string()),
            Json(dedicated_request()),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        state.orchestrator.as_ref().unwrap().queue().wait_idle().await;
    }

    #[test]
    fn request_defaults_are_filled() {
        let req: OrchestrationConfigRequest = serde_json::from_value(serde_json::json!({
            "mode": "dedicated",
            "autoscaling_enabled": true,
            "min_replicas": 3,
            "resource_limits": { "cpu_limit": "1" }
        }))
        .unwrap();
        let config = req.into_config("acme");
        assert_eq!(config.tenant_id, "acme");
        assert_eq!(config.max_replicas, 6);
        assert_eq!(config.target_cpu_utilization, 70);
        assert_eq!(config.resource_limits.cpu_limit, "1");
        assert_eq!(config.resource_limits.memory_limit, "256Mi");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn huge_min_replicas_saturates_default_max() {
        let mut req = dedicated_request();
        req.min_replicas = 1_500_000_000;
        req.max_replicas = 0;
        let config = req.into_config("acme");
        assert_eq!(config.min_replicas, 1_500_000_000);
        assert_eq!(config.max_replicas, i32::MAX);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_request_is_the_shared_default() {
        let req: OrchestrationConfigRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(
            req.into_config("acme"),
            TenantOrchestratorConfig::default_for("acme")
        );
    }

    #[tokio::test]
    async fn get_config_returns_default() {
        let state = test_state();
        let resp = get_orchestration_config(State(state), Path("acme".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["mode"], "shared");
        assert_eq!(body["data"]["max_replicas"], 3);
    }

    #[tokio::test]
    async fn put_config_rejects_bad_domains() {
        let state = test_state();
        let mut req = dedicated_request();
        req.custom_domains = vec!["not a domain".into()];
        let resp = set_orchestration_config(State(state), Path("acme".to_string()), Json(req))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["success"], false);
    }

    #[tokio::test]
    async fn put_config_for_unknown_tenant_is_not_found() {
        let state = test_state();
        let resp = set_orchestration_config(
            State(state),
            Path("ghost".to_string()),
            Json(dedicated_request()),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dedicated_tenant_reaches_ready() {
        let state = test_state();
        go_dedicated(&state).await;

        let resp = get_deployment_status(State(state), Path("acme".to_string()))
            .await
            .into_response();
        let body = body_json(resp).await;
        assert_eq!(body["data"]["status"], "ready");
        assert_eq!(body["data"]["namespace"], "veloflux-acme");
        assert_eq!(body["data"]["version"], "2.0.0");
    }

    #[tokio::test]
    async fn deploy_is_accepted() {
        let state = test_state();
        go_dedicated(&state).await;

        let resp = deploy_tenant(State(state.clone()), Path("acme".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(resp).await["data"]["status"], "deploying");
    }

    #[tokio::test]
    async fn deploying_shared_tenant_records_ready() {
        let state = test_state();
        let resp = deploy_tenant(State(state), Path("acme".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["status"], "ready");
        assert_eq!(body["data"]["version"], "shared");
    }

    #[tokio::test]
    async fn scale_validates_and_requires_dedicated() {
        let state = test_state();
        let resp = scale_tenant(
            State(state.clone()),
            Path("acme".to_string()),
            Json(ScaleRequest { replicas: 0 }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = scale_tenant(
            State(state.clone()),
            Path("acme".to_string()),
            Json(ScaleRequest { replicas: 3 }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        go_dedicated(&state).await;
        let resp = scale_tenant(
            State(state),
            Path("acme".to_string()),
            Json(ScaleRequest { replicas: 3 }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["status"], "scaling");
        assert_eq!(body["data"]["message"], "Scaling to 3 replicas");
    }

    #[tokio::test]
    async fn autoscale_checks_bounds() {
        let state = test_state();
        go_dedicated(&state).await;

        let bad = AutoscalingSettings {
            enabled: true,
            min_replicas: 2,
            max_replicas: 4,
            target_cpu_utilization: 5,
        };
        let resp = update_autoscaling(State(state.clone()), Path("acme".to_string()), Json(bad))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(resp).await["error"],
            "target_cpu_utilization must be between 10 and 100"
        );

        let good = AutoscalingSettings {
            target_cpu_utilization: 50,
            ..bad
        };
        let resp = update_autoscaling(State(state), Path("acme".to_string()), Json(good))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["data"]["target_cpu_utilization"], 50);
    }

    #[tokio::test]
    async fn resources_patch_only_given_fields() {
        let state = test_state();
        go_dedicated(&state).await;

        let resp = update_resources(
            State(state.clone()),
            Path("acme".to_string()),
            Json(ResourceLimits::unset()),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let patch = ResourceLimits {
            memory_limit: "512Mi".into(),
            ..ResourceLimits::unset()
        };
        let resp = update_resources(State(state), Path("acme".to_string()), Json(patch))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["resource_limits"]["memory_limit"], "512Mi");
        assert_eq!(body["data"]["resource_limits"]["cpu_request"], "100m");
    }

    #[tokio::test]
    async fn drain_is_accepted_for_dedicated() {
        let state = test_state();
        go_dedicated(&state).await;
        let resp = drain_tenant(State(state.clone()), Path("acme".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let status = state
            .orchestrator
            .as_ref()
            .unwrap()
            .get_deployment_status("acme")
            .await
            .unwrap();
        assert_eq!(status.status, DeploymentPhase::Draining);
    }

    #[tokio::test]
    async fn disabled_orchestration_is_unavailable() {
        let state = ApiState::new(Arc::new(NoopCoordinator::new()));
        let resp = get_deployment_status(State(state), Path("acme".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn health_reports_node() {
        let resp = health(State(test_state())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["node_id"], "standalone");
        assert_eq!(body["data"]["leader"], true);
    }
}
