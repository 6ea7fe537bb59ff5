//! Periodic drift correction.
//!
//! Every `watch_interval` the watcher compares each active dedicated
//! tenant's live Deployment with its recorded status and rewrites the
//! status from what it sees. Tenants with a job in flight are left to
//! that job.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::orchestrator::Orchestrator;
use crate::resources;
use crate::types::{DeploymentPhase, DeploymentStatus, OrchestrationMode};

/// Decides whether this process should correct drift right now; the
/// daemon passes "is cluster leader".
pub type LeaderGate = Arc<dyn Fn() -> bool + Send + Sync>;

pub struct DriftWatcher {
    orchestrator: Orchestrator,
    gate: Option<LeaderGate>,
}

impl DriftWatcher {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            gate: None,
        }
    }

    /// Only run passes while `gate` returns true.
    pub fn with_gate(mut self, gate: LeaderGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.orchestrator.settings().watch_interval;
        info!(interval_secs = interval.as_secs(), "deployment watcher started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.watch_once().await;
                }
                _ = shutdown.changed() => {
                    debug!("deployment watcher shutting down");
                    break;
                }
            }
        }
    }

    /// One pass over all tenants. Returns how many statuses were rewritten.
    pub async fn watch_once(&self) -> usize {
        if let Some(gate) = &self.gate {
            if !gate() {
                debug!("not leader, skipping drift pass");
                return 0;
            }
        }

        let tenants = match self.orchestrator.tenants().list_tenants().await {
            Ok(tenants) => tenants,
            Err(e) => {
                warn!(error = %e, "failed to list tenants");
                return 0;
            }
        };

        let mut updated = 0;
        for tenant in tenants.iter().filter(|t| t.active) {
            if self.check_tenant(&tenant.id).await {
                updated += 1;
            }
        }
        debug!(tenants = tenants.len(), updated, "drift pass complete");
        updated
    }

    async fn check_tenant(&self, tenant_id: &str) -> bool {
        let orch = &self.orchestrator;
        let config = match orch.get_tenant_config(tenant_id).await {
            Ok(config) => config,
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "failed to read orchestration config");
                return false;
            }
        };
        if !config.is_dedicated() || orch.queue().is_active(tenant_id) {
            return false;
        }
        let previous = match orch.stored_status(tenant_id).await {
            Ok(previous) => previous,
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "failed to read deployment status");
                return false;
            }
        };
        if previous
            .as_ref()
            .is_some_and(|s| s.status == DeploymentPhase::Removed)
        {
            return false;
        }

        let namespace = resources::namespace_name(tenant_id);
        let status = match orch.reconciler().replicas(tenant_id).await {
            Ok((replicas, ready)) => {
                let version = previous
                    .map(|s| s.version)
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| orch.image_version());
                DeploymentStatus::new(
                    tenant_id,
                    OrchestrationMode::Dedicated,
                    DeploymentPhase::from_replicas(replicas, ready),
                )
                .with_namespace(namespace)
                .with_version(version)
                .with_replicas(replicas, ready)
            }
            Err(e) => {
                warn!(tenant_id = %tenant_id, namespace = %namespace, error = %e, "failed to get deployment");
                DeploymentStatus::new(tenant_id, OrchestrationMode::Dedicated, DeploymentPhase::Error)
                    .with_namespace(namespace)
                    .with_message(format!("Failed to get deployment: {e}"))
            }
        };

        match orch.write_status(&status).await {
            Ok(()) => true,
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "failed to update deployment status");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use veloflux_state::InMemoryStore;

    use super::*;
    use crate::config::OrchestrationConfig;
    use crate::platform::{InMemoryPlatform, PlatformClient};
    use crate::tenant::{InMemoryTenants, Tenant};
    use crate::types::TenantOrchestratorConfig;

    async fn deployed() -> (Orchestrator, InMemoryPlatform, InMemoryTenants) {
        let platform = InMemoryPlatform::new();
        let tenants = InMemoryTenants::new();
        tenants.insert(Tenant::new("acme", "Acme Corp"));
        tenants.insert(Tenant::new("beta", "Beta Inc"));
        let orch = Orchestrator::new(
            OrchestrationConfig::enabled().with_watch_interval(Duration::from_millis(50)),
            Arc::new(InMemoryStore::new()),
            Arc::new(platform.clone()),
            Arc::new(tenants.clone()),
        );
        let config = TenantOrchestratorConfig {
            mode: OrchestrationMode::Dedicated,
            min_replicas: 3,
            max_replicas: 3,
            ..TenantOrchestratorConfig::default_for("acme")
        };
        orch.set_tenant_config(config).await.unwrap();
        orch.queue().wait_idle().await;
        (orch, platform, tenants)
    }

    #[tokio::test]
    async fn status_follows_live_replicas() {
        let (orch, platform, _) = deployed().await;
        let watcher = DriftWatcher::new(orch.clone());

        platform.set_deployment_status("veloflux-acme", "veloflux-acme", 3, 1);
        assert_eq!(watcher.watch_once().await, 1);
        let status = orch.get_deployment_status("acme").await.unwrap();
        assert_eq!(status.status, DeploymentPhase::Scaling);
        assert_eq!(status.ready_replicas, 1);

        platform.set_deployment_status("veloflux-acme", "veloflux-acme", 3, 3);
        watcher.watch_once().await;
        let status = orch.get_deployment_status("acme").await.unwrap();
        assert_eq!(status.status, DeploymentPhase::Ready);
    }

    #[tokio::test]
    async fn missing_deployment_becomes_error() {
        let (orch, platform, _) = deployed().await;
        platform.delete_namespace("veloflux-acme").await.unwrap();

        DriftWatcher::new(orch.clone()).watch_once().await;
        let status = orch.get_deployment_status("acme").await.unwrap();
        assert_eq!(status.status, DeploymentPhase::Error);
        assert!(status.message.starts_with("Failed to get deployment:"));
    }

    #[tokio::test]
    async fn inactive_and_shared_tenants_are_skipped() {
        let (orch, platform, tenants) = deployed().await;
        platform.set_deployment_status("veloflux-acme", "veloflux-acme", 3, 0);
        tenants.set_active("acme", false);

        // beta is active but shared.
        assert_eq!(DriftWatcher::new(orch.clone()).watch_once().await, 0);
    }

    #[tokio::test]
    async fn gate_blocks_followers() {
        let (orch, _, _) = deployed().await;
        let leader = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&leader);
        let watcher = DriftWatcher::new(orch).with_gate(Arc::new(move || flag.load(Ordering::SeqCst)));

        assert_eq!(watcher.watch_once().await, 0);
        leader.store(true, Ordering::SeqCst);
        assert_eq!(watcher.watch_once().await, 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (orch, platform, _) = deployed().await;
        platform.set_deployment_status("veloflux-acme", "veloflux-acme", 3, 2);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(DriftWatcher::new(orch.clone()).run(rx));

        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let status = orch.get_deployment_status("acme").await.unwrap();
        assert_eq!(status.status, DeploymentPhase::Scaling);
    }
}
