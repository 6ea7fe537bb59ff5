//! Converges the platform onto a tenant's desired configuration.
//!
//! Every call is an idempotent upsert: create, and on "already exists"
//! replace. Deleting something that is already gone is not an error.
//! Each platform call is bounded by the configured operation timeout.

use std::future::Future;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{Event, Pod};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::OrchestrationConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::platform::{ManagedObject, ObjectKind, PlatformClient, PlatformResult};
use crate::resources;
use crate::types::{ResourceLimits, TenantOrchestratorConfig};

#[derive(Clone)]
pub struct Reconciler {
    platform: Arc<dyn PlatformClient>,
    settings: Arc<OrchestrationConfig>,
}

impl Reconciler {
    pub fn new(platform: Arc<dyn PlatformClient>, settings: Arc<OrchestrationConfig>) -> Self {
        Self { platform, settings }
    }

    /// Bring every tenant object in line with `config`. Returns the namespace.
    pub async fn apply(&self, config: &TenantOrchestratorConfig) -> OrchestratorResult<String> {
        let tenant_id = &config.tenant_id;
        let namespace = self.ensure_namespace(tenant_id).await?;

        self.upsert(&namespace, &resources::config_map(config, &namespace))
            .await?;
        self.upsert_deployment(config, &namespace).await?;
        self.upsert(&namespace, &resources::service(config, &namespace))
            .await?;

        match resources::ingress(config, &self.settings, &namespace) {
            Some(ingress) => self.upsert(&namespace, &ingress).await?,
            None => {
                self.remove(&namespace, ObjectKind::Ingress, &resources::resource_name(tenant_id))
                    .await?
            }
        }
        self.sync_autoscaler(config).await?;

        info!(tenant_id = %tenant_id, namespace = %namespace, "tenant resources reconciled");
        Ok(namespace)
    }

    /// Create, update or delete the HPA so that it exists exactly when
    /// autoscaling is enabled.
    pub async fn sync_autoscaler(&self, config: &TenantOrchestratorConfig) -> OrchestratorResult<()> {
        let namespace = resources::namespace_name(&config.tenant_id);
        match resources::autoscaler(config, &namespace) {
            Some(hpa) => self.upsert(&namespace, &hpa).await,
            None => {
                let name = resources::resource_name(&config.tenant_id);
                self.remove(&namespace, ObjectKind::HorizontalPodAutoscaler, &name)
                    .await
            }
        }
    }

    /// Delete the tenant namespace, cascading to everything in it.
    pub async fn teardown(&self, tenant_id: &str) -> OrchestratorResult<()> {
        let namespace = resources::namespace_name(tenant_id);
        match self
            .bounded("delete namespace", self.platform.delete_namespace(&namespace))
            .await
        {
            Ok(()) => {
                info!(tenant_id = %tenant_id, namespace = %namespace, "tenant namespace deleted");
                Ok(())
            }
            Err(OrchestratorError::Platform(e)) if e.is_not_found() => {
                debug!(namespace = %namespace, "namespace already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ── Live deployment ────────────────────────────────────────

    pub async fn deployment(&self, tenant_id: &str) -> OrchestratorResult<Deployment> {
        let namespace = resources::namespace_name(tenant_id);
        let name = resources::resource_name(tenant_id);
        match self
            .bounded("get deployment", self.platform.get_deployment(&namespace, &name))
            .await
        {
            Err(OrchestratorError::Platform(e)) if e.is_not_found() => {
                Err(OrchestratorError::DeploymentNotFound(tenant_id.to_string()))
            }
            other => other,
        }
    }

    /// Desired and ready replica counts of the live deployment.
    pub async fn replicas(&self, tenant_id: &str) -> OrchestratorResult<(i32, i32)> {
        let deployment = self.deployment(tenant_id).await?;
        let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        let ready = deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        Ok((desired, ready))
    }

    pub async fn scale(&self, tenant_id: &str, replicas: i32) -> OrchestratorResult<()> {
        self.modify_deployment(tenant_id, |d| resources::set_replicas(d, replicas))
            .await
    }

    pub async fn drain(&self, tenant_id: &str) -> OrchestratorResult<()> {
        self.modify_deployment(tenant_id, resources::stamp_drain).await
    }

    pub async fn set_resource_limits(
        &self,
        tenant_id: &str,
        limits: &ResourceLimits,
    ) -> OrchestratorResult<()> {
        self.modify_deployment(tenant_id, |d| {
            resources::apply_resource_limits(d, limits);
        })
        .await
    }

    // ── Observation ────────────────────────────────────────────

    pub async fn pods(&self, tenant_id: &str) -> OrchestratorResult<Vec<Pod>> {
        let namespace = resources::namespace_name(tenant_id);
        let selector = resources::pod_selector(tenant_id);
        self.bounded("list pods", self.platform.list_pods(&namespace, &selector))
            .await
    }

    pub async fn events(&self, tenant_id: &str) -> OrchestratorResult<Vec<Event>> {
        let namespace = resources::namespace_name(tenant_id);
        let name = resources::resource_name(tenant_id);
        self.bounded("list events", self.platform.list_events(&namespace, &name))
            .await
    }

    /// The tenant's autoscaler, if one exists.
    pub async fn autoscaler(
        &self,
        tenant_id: &str,
    ) -> OrchestratorResult<Option<HorizontalPodAutoscaler>> {
        let namespace = resources::namespace_name(tenant_id);
        let name = resources::resource_name(tenant_id);
        match self
            .bounded("get autoscaler", self.platform.get_autoscaler(&namespace, &name))
            .await
        {
            Ok(hpa) => Ok(Some(hpa)),
            Err(OrchestratorError::Platform(e)) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ── Primitives ─────────────────────────────────────────────

    async fn ensure_namespace(&self, tenant_id: &str) -> OrchestratorResult<String> {
        let namespace = resources::namespace_name(tenant_id);
        let exists = self
            .bounded("check namespace", self.platform.namespace_exists(&namespace))
            .await?;
        if exists {
            return Ok(namespace);
        }
        match self
            .bounded(
                "create namespace",
                self.platform.create_namespace(&resources::namespace(tenant_id)),
            )
            .await
        {
            Ok(()) => {
                info!(tenant_id = %tenant_id, namespace = %namespace, "tenant namespace created");
                Ok(namespace)
            }
            Err(OrchestratorError::Platform(e)) if e.is_already_exists() => Ok(namespace),
            Err(e) => Err(e),
        }
    }

    async fn upsert(&self, namespace: &str, object: &ManagedObject) -> OrchestratorResult<()> {
        match self
            .bounded("create", self.platform.create(namespace, object))
            .await
        {
            Ok(()) => {
                debug!(namespace = %namespace, object = %object.describe(), "created");
                Ok(())
            }
            Err(OrchestratorError::Platform(e)) if e.is_already_exists() => {
                self.bounded("replace", self.platform.replace(namespace, object))
                    .await?;
                debug!(namespace = %namespace, object = %object.describe(), "updated");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`Self::upsert`], but an autoscaled deployment keeps the
    /// replica count the autoscaler chose.
    async fn upsert_deployment(
        &self,
        config: &TenantOrchestratorConfig,
        namespace: &str,
    ) -> OrchestratorResult<()> {
        let mut desired = resources::deployment(config, &self.settings, namespace);
        if config.autoscaling_enabled {
            let live_replicas = match self.deployment(&config.tenant_id).await {
                Ok(live) => live.spec.and_then(|s| s.replicas),
                Err(OrchestratorError::DeploymentNotFound(_)) => None,
                Err(e) => return Err(e),
            };
            if let (ManagedObject::Deployment(d), Some(n)) = (&mut desired, live_replicas) {
                resources::set_replicas(d, n);
            }
        }
        self.upsert(namespace, &desired).await
    }

    async fn remove(&self, namespace: &str, kind: ObjectKind, name: &str) -> OrchestratorResult<()> {
        match self
            .bounded("delete", self.platform.delete(namespace, kind, name))
            .await
        {
            Ok(()) => {
                debug!(namespace = %namespace, object = %format!("{kind}/{name}"), "deleted");
                Ok(())
            }
            Err(OrchestratorError::Platform(e)) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn modify_deployment(
        &self,
        tenant_id: &str,
        change: impl FnOnce(&mut Deployment),
    ) -> OrchestratorResult<()> {
        let mut deployment = self.deployment(tenant_id).await?;
        change(&mut deployment);
        // Server-owned fields are refreshed by the replace.
        deployment.status = None;
        let namespace = resources::namespace_name(tenant_id);
        self.bounded(
            "update deployment",
            self.platform
                .replace(&namespace, &ManagedObject::Deployment(deployment)),
        )
        .await
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = PlatformResult<T>>,
    ) -> OrchestratorResult<T> {
        let limit = self.settings.operation_timeout;
        match timeout(limit, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(OrchestratorError::Timeout {
                operation: operation.to_string(),
                seconds: limit.as_secs(),
            }),
        }
    }
}
