//! API regression tests.
//!
//! Drives the full router the daemon serves: tenant orchestration from
//! config to scaling, replicated cluster state, and standalone behaviour.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;
use veloflux_api::{ApiState, build_router};
use veloflux_cluster::{Cluster, ClusterConfig, NoopCoordinator};
use veloflux_orchestrator::{InMemoryPlatform, OrchestrationConfig, Orchestrator, Tenant};
use veloflux_state::{InMemoryStore, KvStore, json, keys};

async fn test_orchestrator(store: &InMemoryStore) -> Orchestrator {
    json::set_json(store, &keys::tenant("acme"), &Tenant::new("acme", "Acme Corp"))
        .await
        .unwrap();
    let store: Arc<dyn KvStore> = Arc::new(store.clone());
    Orchestrator::new(
        OrchestrationConfig::enabled().with_image("veloflux/veloflux:1.4.2"),
        Arc::clone(&store),
        Arc::new(InMemoryPlatform::new()),
        Arc::new(veloflux_orchestrator::StoreTenantDirectory::new(store)),
    )
}

async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&value).unwrap())
        }
        None => Body::empty(),
    };
    let resp = router.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn acme_goes_dedicated_and_scales_over_http() {
    let store = InMemoryStore::new();
    let orchestrator = test_orchestrator(&store).await;
    let router = build_router(
        ApiState::new(Arc::new(NoopCoordinator::new())).with_orchestrator(orchestrator.clone()),
    );

    let (status, body) = send(&router, "GET", "/api/tenants/acme/orchestration", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["mode"], "shared");
    assert_eq!(body["data"]["resource_limits"]["cpu_request"], "100m");

    let config = serde_json::json!({
        "mode": "dedicated",
        "autoscaling_enabled": true,
        "min_replicas": 2,
        "max_replicas": 5,
        "target_cpu_utilization": 70
    });
    let (status, body) = send(&router, "PUT", "/api/tenants/acme/orchestration", Some(config)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["dedicated_namespace"], "veloflux-acme");

    orchestrator.queue().wait_idle().await;
    let (_, body) = send(&router, "GET", "/api/tenants/acme/orchestration/status", None).await;
    assert_eq!(body["data"]["status"], "ready");
    assert_eq!(body["data"]["namespace"], "veloflux-acme");
    assert_eq!(body["data"]["version"], "1.4.2");

    let (status, body) = send(
        &router,
        "POST",
        "/api/tenants/acme/orchestration/scale",
        Some(serde_json::json!({ "replicas": 3 })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["status"], "scaling");
    assert_eq!(body["data"]["message"], "Scaling to 3 replicas");

    let (status, body) =
        send(&router, "GET", "/api/tenants/acme/orchestration/detailed_status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["tenant_id"], "acme");
}

#[tokio::test]
async fn shared_tenant_operations_conflict() {
    let store = InMemoryStore::new();
    let orchestrator = test_orchestrator(&store).await;
    let router = build_router(
        ApiState::new(Arc::new(NoopCoordinator::new())).with_orchestrator(orchestrator),
    );

    let (status, body) = send(
        &router,
        "POST",
        "/api/tenants/acme/orchestration/scale",
        Some(serde_json::json!({ "replicas": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);

    let (status, _) = send(&router, "POST", "/api/tenants/acme/orchestration/drain", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(&router, "GET", "/api/tenants/acme/orchestration/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["version"], "shared");
}

#[tokio::test]
async fn invalid_bodies_are_rejected() {
    let store = InMemoryStore::new();
    let orchestrator = test_orchestrator(&store).await;
    let router = build_router(
        ApiState::new(Arc::new(NoopCoordinator::new())).with_orchestrator(orchestrator),
    );

    let (status, body) = send(
        &router,
        "PUT",
        "/api/tenants/acme/orchestration",
        Some(serde_json::json!({
            "mode": "dedicated",
            "resource_limits": { "memory_limit": "a lot" }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("memory_limit"));

    let (status, _) = send(
        &router,
        "POST",
        "/api/tenants/acme/orchestration/scale",
        Some(serde_json::json!({ "replicas": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn state_published_on_one_node_is_read_on_another() {
    let store = InMemoryStore::new();
    let node = |id: &str| {
        let config = ClusterConfig::enabled()
            .with_node_id(id)
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_leader_timeout(Duration::from_millis(200));
        build_router(ApiState::new(Arc::new(Cluster::new(config, Arc::new(store.clone())))))
    };
    let a = node("node-a");
    let b = node("node-b");

    let route = serde_json::json!({ "path": "/v1", "pool": "api" });
    let (status, _) = send(&a, "PUT", "/api/cluster/state/route/api/v1", Some(route)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&b, "GET", "/api/cluster/state/route/api/v1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["key"], "api/v1");
    assert_eq!(body["data"]["value"]["pool"], "api");
}

#[tokio::test]
async fn standalone_without_orchestration() {
    let router = build_router(ApiState::new(Arc::new(NoopCoordinator::new())));

    let (status, body) = send(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["orchestration"], false);

    let (status, body) = send(&router, "GET", "/api/cluster/nodes", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["role"], "leader");

    let (status, _) = send(&router, "GET", "/api/tenants/acme/orchestration", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
