//! Process wiring: store, cluster, orchestrator, watcher and API server.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use veloflux_api::{ApiState, build_router};
use veloflux_cluster::coordinator::BoxFuture;
use veloflux_cluster::{ClusterCoordinator, StateListener, StateType};
use veloflux_orchestrator::{
    DriftWatcher, InMemoryPlatform, KubePlatform, Orchestrator, PlatformClient,
    StoreTenantDirectory, TenantOrchestratorConfig,
};
use veloflux_state::{InMemoryStore, KvStore, RedisStore};

use crate::config::{DaemonConfig, PlatformKind, StoreBackend, StoreConfig};

/// Cluster `config` state keys carrying tenant orchestration configs.
pub const ORCHESTRATION_KEY_PREFIX: &str = "orchestration/";

pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!("VeloFlux daemon starting");
    let listen = config.listen_addr()?;

    // ── Initialize subsystems ──────────────────────────────────

    let store = open_store(&config.store).await?;
    store.ping().await.context("state store unreachable")?;
    info!(backend = ?config.store.backend, "state store ready");

    let cluster = veloflux_cluster::coordinator(config.cluster_config(), Arc::clone(&store));
    cluster
        .start()
        .await
        .context("failed to start cluster coordinator")?;
    info!(node_id = %cluster.node_id(), clustered = cluster.is_enabled(), "cluster coordinator started");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut api_state = ApiState::new(Arc::clone(&cluster));
    let mut watcher_handle = None;

    let orchestrator = if config.orchestration.enabled {
        let orchestrator = build_orchestrator(&config, Arc::clone(&store)).await?;
        connect_to_cluster(&orchestrator, &cluster);

        let leader = Arc::clone(&cluster);
        let watcher = DriftWatcher::new(orchestrator.clone())
            .with_gate(Arc::new(move || leader.is_leader()));
        watcher_handle = Some(tokio::spawn(watcher.run(shutdown_rx.clone())));

        api_state = api_state.with_orchestrator(orchestrator.clone());
        info!(platform = ?config.orchestration.platform, "tenant orchestrator initialized");
        Some(orchestrator)
    } else {
        info!("tenant orchestration disabled");
        None
    };

    // ── Start API server ───────────────────────────────────────

    let router = build_router(api_state);
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(addr = %listen, "API server starting");

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
    server.await.context("API server failed")?;

    // ── Shutdown ───────────────────────────────────────────────

    if let Some(handle) = watcher_handle {
        let _ = handle.await;
    }
    if let Some(orchestrator) = &orchestrator {
        orchestrator.shutdown();
    }
    if let Err(e) = cluster.stop().await {
        warn!(error = %e, "cluster stop failed");
    }

    info!("VeloFlux daemon stopped");
    Ok(())
}

async fn open_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn KvStore>> {
    let store: Arc<dyn KvStore> = match config.backend {
        StoreBackend::Redis => Arc::new(
            RedisStore::connect(&config.address)
                .await
                .with_context(|| format!("failed to connect to store at {}", config.address))?,
        ),
        StoreBackend::Memory => {
            warn!("using in-memory store; state is lost on exit and not shared between nodes");
            Arc::new(InMemoryStore::new())
        }
    };
    Ok(store)
}

async fn build_orchestrator(
    config: &DaemonConfig,
    store: Arc<dyn KvStore>,
) -> anyhow::Result<Orchestrator> {
    let settings = config.orchestration_config();
    let platform: Arc<dyn PlatformClient> = match config.orchestration.platform {
        PlatformKind::Kubernetes => Arc::new(
            KubePlatform::connect(&settings)
                .await
                .context("failed to connect to kubernetes")?,
        ),
        PlatformKind::Memory => {
            warn!("using in-memory platform; tenant instances are simulated");
            Arc::new(InMemoryPlatform::new())
        }
    };
    let tenants = Arc::new(StoreTenantDirectory::new(Arc::clone(&store)));
    Ok(Orchestrator::new(settings, store, platform, tenants))
}

/// Publish stored configs through the cluster and drop cached configs
/// when another node publishes one.
pub fn connect_to_cluster(orchestrator: &Orchestrator, cluster: &Arc<dyn ClusterCoordinator>) {
    let publisher = Arc::clone(cluster);
    orchestrator.on_config_change(Arc::new(move |config: &TenantOrchestratorConfig| {
        let key = format!("{ORCHESTRATION_KEY_PREFIX}{}", config.tenant_id);
        let value = match serde_json::to_vec(config) {
            Ok(value) => value,
            Err(e) => {
                warn!(tenant_id = %config.tenant_id, error = %e, "failed to encode config for publishing");
                return;
            }
        };
        let cluster = Arc::clone(&publisher);
        tokio::spawn(async move {
            if let Err(e) = cluster.publish_state(StateType::Config, &key, &value).await {
                warn!(%key, error = %e, "failed to publish tenant config");
            }
        });
    }));

    let cache = orchestrator.clone();
    let listener: StateListener = Arc::new(
        move |_state_type: StateType, key: String, _value: Vec<u8>| -> BoxFuture {
            if let Some(tenant_id) = key.strip_prefix(ORCHESTRATION_KEY_PREFIX) {
                debug!(tenant_id = %tenant_id, "tenant config changed on another node");
                cache.invalidate_cached_config(tenant_id);
            }
            Box::pin(async {})
        },
    );
    cluster.register_state_listener(StateType::Config, listener);
}
