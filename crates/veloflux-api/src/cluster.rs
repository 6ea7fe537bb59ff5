//! REST API handlers for cluster membership and replicated state.

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

use veloflux_cluster::{ClusterError, StateType};

use crate::ApiState;
use crate::handlers::{ApiResponse, error_response};

fn cluster_error(e: ClusterError) -> Response {
    let status = match &e {
        ClusterError::Disabled => StatusCode::SERVICE_UNAVAILABLE,
        ClusterError::StateNotFound { .. } => StatusCode::NOT_FOUND,
        _ => {
            warn!(error = %e, "cluster request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(&e.to_string(), status).into_response()
}

fn parse_state_type(raw: &str) -> Result<StateType, Response> {
    raw.parse()
        .map_err(|e: String| error_response(&e, StatusCode::BAD_REQUEST).into_response())
}

/// JSON values are returned as-is, anything else as a string.
fn state_value(bytes: &[u8]) -> serde_json::Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// GET /api/cluster/status
pub async fn cluster_status(State(state): State<ApiState>) -> impl IntoResponse {
    match state.cluster.status().await {
        Ok(status) => ApiResponse::ok(status).into_response(),
        Err(e) => cluster_error(e),
    }
}

/// GET /api/cluster/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.cluster.nodes())
}

/// GET /api/cluster/state/:state_type
pub async fn list_state(
    State(state): State<ApiState>,
    Path(state_type): Path<String>,
) -> impl IntoResponse {
    let state_type = match parse_state_type(&state_type) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.cluster.get_all_state(state_type).await {
        Ok(entries) => {
            let entries: BTreeMap<String, serde_json::Value> = entries
                .into_iter()
                .map(|(key, value)| (key, state_value(&value)))
                .collect();
            ApiResponse::ok(entries).into_response()
        }
        Err(e) => cluster_error(e),
    }
}

/// GET /api/cluster/state/:state_type/*key
pub async fn get_state(
    State(state): State<ApiState>,
    Path((state_type, key)): Path<(String, String)>,
) -> impl IntoResponse {
    let state_type = match parse_state_type(&state_type) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.cluster.get_state(state_type, &key).await {
        Ok(value) => ApiResponse::ok(serde_json::json!({
            "state_type": state_type,
            "key": key,
            "value": state_value(&value),
        }))
        .into_response(),
        Err(e) => cluster_error(e),
    }
}

/// PUT /api/cluster/state/:state_type/*key
///
/// The raw request body becomes the value.
pub async fn publish_state(
    State(state): State<ApiState>,
    Path((state_type, key)): Path<(String, String)>,
    body: Bytes,
) -> impl IntoResponse {
    let state_type = match parse_state_type(&state_type) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.cluster.publish_state(state_type, &key, &body).await {
        Ok(()) => {
            info!(%state_type, %key, bytes = body.len(), "state published via api");
            ApiResponse::ok(serde_json::json!({
                "state_type": state_type,
                "key": key,
            }))
            .into_response()
        }
        Err(e) => cluster_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::to_bytes;
    use veloflux_cluster::{Cluster, ClusterConfig, NoopCoordinator};
    use veloflux_state::InMemoryStore;

    fn clustered() -> ApiState {
        let config = ClusterConfig::enabled()
            .with_node_id("node-a")
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_leader_timeout(Duration::from_millis(200));
        let cluster = Cluster::new(config, Arc::new(InMemoryStore::new()));
        ApiState::new(Arc::new(cluster))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn key_path(state_type: &str, key: &str) -> Path<(String, String)> {
        Path((state_type.to_string(), key.to_string()))
    }

    #[tokio::test]
    async fn publish_then_read_back() {
        let state = clustered();
        let resp = publish_state(
            State(state.clone()),
            key_path("backend", "pool-a/10.0.0.1:80"),
            Bytes::from_static(br#"{"weight":3}"#),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = get_state(State(state.clone()), key_path("backend", "pool-a/10.0.0.1:80"))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["data"]["value"]["weight"], 3);

        let resp = list_state(State(state), Path("backend".to_string()))
            .await
            .into_response();
        let body = body_json(resp).await;
        assert_eq!(body["data"]["pool-a/10.0.0.1:80"]["weight"], 3);
    }

    #[tokio::test]
    async fn non_json_values_come_back_as_strings() {
        let state = clustered();
        publish_state(
            State(state.clone()),
            key_path("config", "banner"),
            Bytes::from_static(b"hello"),
        )
        .await;
        let resp = get_state(State(state), key_path("config", "banner"))
            .await
            .into_response();
        assert_eq!(body_json(resp).await["data"]["value"], "hello");
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let resp = get_state(State(clustered()), key_path("route", "nope"))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_state_type_is_bad_request() {
        let resp = list_state(State(clustered()), Path("pools".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn standalone_reads_are_unavailable() {
        let state = ApiState::new(Arc::new(NoopCoordinator::new()));
        let resp = get_state(State(state.clone()), key_path("backend", "x"))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = list_nodes(State(state.clone())).await.into_response();
        let body = body_json(resp).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"][0]["id"], "standalone");

        let resp = cluster_status(State(state)).await.into_response();
        let body = body_json(resp).await;
        assert_eq!(body["data"]["enabled"], false);
        assert_eq!(body["data"]["role"], "leader");
    }
}
