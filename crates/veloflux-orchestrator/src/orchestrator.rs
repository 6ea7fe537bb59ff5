//! Tenant orchestrator: desired config, reconciliation jobs and status.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{Event, Pod};
use tracing::{debug, info, warn};
use veloflux_state::{KvStore, json, keys};

use crate::config::OrchestrationConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::jobs::ReconcileQueue;
use crate::platform::PlatformClient;
use crate::reconcile::Reconciler;
use crate::resources;
use crate::tenant::TenantDirectory;
use crate::types::{
    AutoscalingSettings, ContainerStatus, DeploymentEvent, DeploymentMetrics, DeploymentPhase,
    DeploymentStatus, DetailedDeploymentStatus, OrchestrationMode, PodStatus, ResourceLimits,
    TenantOrchestratorConfig,
};

/// Called after a tenant config was stored.
pub type ConfigChangeHook = Arc<dyn Fn(&TenantOrchestratorConfig) + Send + Sync>;

/// Version reported for tenants served by the shared pool.
const SHARED_VERSION: &str = "shared";

struct Inner {
    settings: Arc<OrchestrationConfig>,
    store: Arc<dyn KvStore>,
    tenants: Arc<dyn TenantDirectory>,
    reconciler: Reconciler,
    queue: ReconcileQueue,
    cache: RwLock<HashMap<String, TenantOrchestratorConfig>>,
    hooks: RwLock<Vec<ConfigChangeHook>>,
}

/// Keeps tenant orchestration configs and drives the platform towards them.
///
/// Cheap to clone; clones share the cache, the job queue and the hooks.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestrationConfig,
        store: Arc<dyn KvStore>,
        platform: Arc<dyn PlatformClient>,
        tenants: Arc<dyn TenantDirectory>,
    ) -> Self {
        let settings = Arc::new(settings);
        let queue = ReconcileQueue::new(
            settings.max_concurrent_reconciliations,
            settings.operation_timeout,
        );
        let reconciler = Reconciler::new(platform, Arc::clone(&settings));
        Self {
            inner: Arc::new(Inner {
                settings,
                store,
                tenants,
                reconciler,
                queue,
                cache: RwLock::new(HashMap::new()),
                hooks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn settings(&self) -> &OrchestrationConfig {
        &self.inner.settings
    }

    pub fn queue(&self) -> &ReconcileQueue {
        &self.inner.queue
    }

    pub(crate) fn reconciler(&self) -> &Reconciler {
        &self.inner.reconciler
    }

    pub(crate) fn tenants(&self) -> &Arc<dyn TenantDirectory> {
        &self.inner.tenants
    }

    /// Register a hook run after every stored config change: whole configs,
    /// resource limits and autoscaling settings.
    pub fn on_config_change(&self, hook: ConfigChangeHook) {
        self.inner.hooks.write().expect("hooks lock").push(hook);
    }

    /// Abort running jobs and refuse new ones.
    pub fn shutdown(&self) {
        self.inner.queue.shutdown();
    }

    // ── Configuration ──────────────────────────────────────────

    /// The tenant's config: cached, stored, or the shared-mode default.
    ///
    /// The default is not persisted.
    pub async fn get_tenant_config(
        &self,
        tenant_id: &str,
    ) -> OrchestratorResult<TenantOrchestratorConfig> {
        if let Some(config) = self.cached(tenant_id) {
            return Ok(config);
        }
        match self.stored_config(tenant_id).await? {
            Some(config) => {
                self.cache_config(&config);
                Ok(config)
            }
            None => Ok(TenantOrchestratorConfig::default_for(tenant_id)),
        }
    }

    /// Validate and store `config`, then queue whatever the mode change
    /// requires. Returns the stored config.
    ///
    /// Shared → dedicated queues a deploy, dedicated → dedicated an update,
    /// dedicated → shared a teardown. The call returns before the platform
    /// is touched; progress is visible through [`Self::get_deployment_status`].
    pub async fn set_tenant_config(
        &self,
        mut config: TenantOrchestratorConfig,
    ) -> OrchestratorResult<TenantOrchestratorConfig> {
        config.validate()?;
        config.normalize_domains();
        let tenant_id = config.tenant_id.clone();
        let was_dedicated = self
            .stored_config(&tenant_id)
            .await?
            .is_some_and(|c| c.is_dedicated());

        if config.is_dedicated() {
            if !was_dedicated {
                self.require_tenant(&tenant_id).await?;
            }
            config.dedicated_namespace = resources::namespace_name(&tenant_id);
        } else {
            config.dedicated_namespace.clear();
        }

        self.persist_config(&config).await?;
        info!(
            tenant_id = %tenant_id,
            mode = %config.mode,
            previous = if was_dedicated { "dedicated" } else { "shared" },
            "tenant orchestration config stored"
        );
        self.notify_change(&config);

        match (was_dedicated, config.is_dedicated()) {
            (false, true) => {
                self.start_deploy(&config).await?;
            }
            (true, true) => {
                self.start_update(&config).await?;
            }
            (true, false) => {
                self.start_remove(&tenant_id, true).await?;
            }
            (false, false) => {}
        }
        Ok(config)
    }

    /// Drop the cached config so the next read goes to the store.
    pub fn invalidate_cached_config(&self, tenant_id: &str) {
        if self
            .inner
            .cache
            .write()
            .expect("config cache lock")
            .remove(tenant_id)
            .is_some()
        {
            debug!(tenant_id = %tenant_id, "cached config invalidated");
        }
    }

    // ── Instance lifecycle ─────────────────────────────────────

    /// Queue a full stand-up of the tenant's dedicated instance. A shared
    /// tenant is simply recorded as ready on the shared pool.
    pub async fn deploy_tenant_instance(
        &self,
        tenant_id: &str,
    ) -> OrchestratorResult<DeploymentStatus> {
        let config = self.get_tenant_config(tenant_id).await?;
        if !config.is_dedicated() {
            let status = self.shared_status(tenant_id);
            self.write_status(&status).await?;
            return Ok(status);
        }
        self.require_tenant(tenant_id).await?;
        self.start_deploy(&config).await
    }

    /// Queue an in-place update of the tenant's dedicated instance.
    pub async fn update_tenant_instance(
        &self,
        tenant_id: &str,
    ) -> OrchestratorResult<DeploymentStatus> {
        let config = self.dedicated_config(tenant_id, "update").await?;
        self.start_update(&config).await
    }

    /// Queue removal of the tenant's dedicated namespace. Ends in `removed`.
    pub async fn remove_tenant_instance(
        &self,
        tenant_id: &str,
    ) -> OrchestratorResult<DeploymentStatus> {
        self.dedicated_config(tenant_id, "remove").await?;
        self.start_remove(tenant_id, false).await
    }

    /// Set the replica count of a dedicated instance.
    ///
    /// Does not wait for the replicas; the status reads `scaling` until the
    /// drift watcher observes them.
    pub async fn scale_tenant_instance(
        &self,
        tenant_id: &str,
        replicas: i32,
    ) -> OrchestratorResult<DeploymentStatus> {
        if replicas < 1 {
            return Err(OrchestratorError::Validation(
                "replicas must be at least 1".into(),
            ));
        }
        let config = self.dedicated_config(tenant_id, "scale").await?;
        self.inner.reconciler.scale(tenant_id, replicas).await?;

        let status = self
            .base_status(&config, DeploymentPhase::Scaling)
            .await?
            .with_message(format!("Scaling to {replicas} replicas"));
        self.write_status(&status).await?;
        info!(tenant_id = %tenant_id, replicas, "scaled tenant instance");
        Ok(status)
    }

    /// Roll every pod of a dedicated instance.
    pub async fn drain_tenant_instance(
        &self,
        tenant_id: &str,
    ) -> OrchestratorResult<DeploymentStatus> {
        let config = self.dedicated_config(tenant_id, "drain").await?;
        let status = self
            .base_status(&config, DeploymentPhase::Draining)
            .await?
            .with_message("Instance is being drained");
        self.write_status(&status).await?;

        if let Err(e) = self.inner.reconciler.drain(tenant_id).await {
            self.record_failure(tenant_id, OrchestrationMode::Dedicated, &e)
                .await;
            return Err(e);
        }
        info!(tenant_id = %tenant_id, namespace = %status.namespace, "drain initiated");
        Ok(status)
    }

    /// Patch the set fields of `limits` onto the running instance and
    /// store the merged limits.
    pub async fn update_resource_limits(
        &self,
        tenant_id: &str,
        limits: ResourceLimits,
    ) -> OrchestratorResult<TenantOrchestratorConfig> {
        limits.validate()?;
        let mut config = self
            .stored_dedicated_config(tenant_id, "update resource limits for")
            .await?;
        self.inner
            .reconciler
            .set_resource_limits(tenant_id, &limits)
            .await?;

        config.resource_limits.merge(&limits);
        self.persist_config(&config).await?;
        self.notify_change(&config);
        info!(tenant_id = %tenant_id, limits = ?config.resource_limits, "resource limits updated");
        Ok(config)
    }

    /// Apply new autoscaling settings; the HPA exists exactly when enabled.
    pub async fn update_autoscaling_config(
        &self,
        tenant_id: &str,
        settings: AutoscalingSettings,
    ) -> OrchestratorResult<TenantOrchestratorConfig> {
        let mut config = self
            .stored_dedicated_config(tenant_id, "update autoscaling for")
            .await?;
        config.apply_autoscaling(&settings);
        config.validate()?;

        self.inner.reconciler.sync_autoscaler(&config).await?;
        self.persist_config(&config).await?;
        self.notify_change(&config);
        info!(
            tenant_id = %tenant_id,
            enabled = settings.enabled,
            min_replicas = settings.min_replicas,
            max_replicas = settings.max_replicas,
            "autoscaling config updated"
        );
        Ok(config)
    }

    // ── Status ─────────────────────────────────────────────────

    /// The tenant's last recorded deployment status.
    ///
    /// Tenants that never had a status are reported as `ready` on the shared
    /// pool or `unknown` when dedicated. A `ready` dedicated status carries
    /// live replica counts when the platform can be reached.
    pub async fn get_deployment_status(
        &self,
        tenant_id: &str,
    ) -> OrchestratorResult<DeploymentStatus> {
        if let Some(mut status) = self.stored_status(tenant_id).await? {
            if status.status == DeploymentPhase::Ready && status.mode == OrchestrationMode::Dedicated
            {
                match self.inner.reconciler.replicas(tenant_id).await {
                    Ok((replicas, ready)) => status = status.with_replicas(replicas, ready),
                    Err(e) => debug!(tenant_id = %tenant_id, error = %e, "live replica refresh failed"),
                }
            }
            return Ok(status);
        }

        let config = self.get_tenant_config(tenant_id).await?;
        let status = if config.is_dedicated() {
            DeploymentStatus::new(tenant_id, config.mode, DeploymentPhase::Unknown)
                .with_namespace(resources::namespace_name(tenant_id))
        } else {
            self.shared_status(tenant_id)
        };
        Ok(status)
    }

    /// Status plus platform events, pods and autoscaler metrics.
    pub async fn get_detailed_deployment_status(
        &self,
        tenant_id: &str,
    ) -> OrchestratorResult<DetailedDeploymentStatus> {
        let status = self.get_deployment_status(tenant_id).await?;
        let mut detailed = DetailedDeploymentStatus {
            status,
            events: Vec::new(),
            metrics: DeploymentMetrics::default(),
            pods: Vec::new(),
        };
        if detailed.status.mode != OrchestrationMode::Dedicated {
            return Ok(detailed);
        }

        let reconciler = &self.inner.reconciler;
        match reconciler.events(tenant_id).await {
            Ok(events) => detailed.events = events.into_iter().map(deployment_event).collect(),
            Err(e) => warn!(tenant_id = %tenant_id, error = %e, "failed to list deployment events"),
        }
        match reconciler.pods(tenant_id).await {
            Ok(pods) => detailed.pods = pods.into_iter().map(pod_status).collect(),
            Err(e) => warn!(tenant_id = %tenant_id, error = %e, "failed to list pods"),
        }
        match reconciler.autoscaler(tenant_id).await {
            Ok(Some(hpa)) => detailed.metrics = autoscaler_metrics(&hpa),
            Ok(None) => {}
            Err(e) => warn!(tenant_id = %tenant_id, error = %e, "failed to read autoscaler"),
        }
        Ok(detailed)
    }

    // ── Jobs ───────────────────────────────────────────────────

    async fn start_deploy(
        &self,
        config: &TenantOrchestratorConfig,
    ) -> OrchestratorResult<DeploymentStatus> {
        self.start_apply(config, "deploy", DeploymentPhase::Deploying)
            .await
    }

    async fn start_update(
        &self,
        config: &TenantOrchestratorConfig,
    ) -> OrchestratorResult<DeploymentStatus> {
        self.start_apply(config, "update", DeploymentPhase::Updating)
            .await
    }

    async fn start_apply(
        &self,
        config: &TenantOrchestratorConfig,
        operation: &'static str,
        phase: DeploymentPhase,
    ) -> OrchestratorResult<DeploymentStatus> {
        let status = self.pending_status(config, phase);
        self.write_status(&status).await?;
        let this = self.clone();
        let config = config.clone();
        self.submit(&status.tenant_id, operation, OrchestrationMode::Dedicated, async move {
            this.apply_and_record(&config).await
        })?;
        Ok(status)
    }

    /// Tear down the dedicated namespace. With `to_shared` the tenant ends
    /// up `ready` on the shared pool, otherwise `removed`.
    async fn start_remove(
        &self,
        tenant_id: &str,
        to_shared: bool,
    ) -> OrchestratorResult<DeploymentStatus> {
        let status = DeploymentStatus::new(
            tenant_id,
            OrchestrationMode::Dedicated,
            DeploymentPhase::Removing,
        )
        .with_namespace(resources::namespace_name(tenant_id));
        self.write_status(&status).await?;
        let this = self.clone();
        let tenant = tenant_id.to_string();
        self.submit(tenant_id, "remove", OrchestrationMode::Dedicated, async move {
            this.inner.reconciler.teardown(&tenant).await?;
            let done = if to_shared {
                this.shared_status(&tenant)
            } else {
                DeploymentStatus::new(&tenant, OrchestrationMode::Dedicated, DeploymentPhase::Removed)
                    .with_namespace(resources::namespace_name(&tenant))
            };
            this.write_status(&done).await
        })?;
        Ok(status)
    }

    fn submit<W>(
        &self,
        tenant_id: &str,
        operation: &'static str,
        mode: OrchestrationMode,
        work: W,
    ) -> OrchestratorResult<()>
    where
        W: std::future::Future<Output = OrchestratorResult<()>> + Send + 'static,
    {
        let this = self.clone();
        let tenant = tenant_id.to_string();
        self.inner
            .queue
            .submit(tenant_id, operation, work, move |outcome| async move {
                if let Err(e) = outcome {
                    this.record_failure(&tenant, mode, &e).await;
                }
            })
    }

    async fn apply_and_record(&self, config: &TenantOrchestratorConfig) -> OrchestratorResult<()> {
        let reconciler = &self.inner.reconciler;
        let namespace = reconciler.apply(config).await?;
        let (replicas, ready) = reconciler.replicas(&config.tenant_id).await?;
        let status = DeploymentStatus::new(
            &config.tenant_id,
            OrchestrationMode::Dedicated,
            DeploymentPhase::from_replicas(replicas, ready),
        )
        .with_namespace(namespace)
        .with_version(self.image_version())
        .with_replicas(replicas, ready);
        self.write_status(&status).await
    }

    /// Store an `error` status; failures here are only logged.
    pub(crate) async fn record_failure(
        &self,
        tenant_id: &str,
        mode: OrchestrationMode,
        error: &OrchestratorError,
    ) {
        let status = DeploymentStatus::new(tenant_id, mode, DeploymentPhase::Error)
            .with_namespace(resources::namespace_name(tenant_id))
            .with_message(error.to_string());
        if let Err(e) = self.write_status(&status).await {
            warn!(tenant_id = %tenant_id, error = %e, "failed to record deployment error");
        }
    }

    // ── Helpers ────────────────────────────────────────────────

    pub(crate) async fn write_status(&self, status: &DeploymentStatus) -> OrchestratorResult<()> {
        let key = keys::tenant_deployment(&status.tenant_id);
        json::set_json(self.inner.store.as_ref(), &key, status).await?;
        debug!(tenant_id = %status.tenant_id, status = %status.status, "deployment status recorded");
        Ok(())
    }

    pub(crate) async fn stored_status(
        &self,
        tenant_id: &str,
    ) -> OrchestratorResult<Option<DeploymentStatus>> {
        let store = self.inner.store.as_ref();
        if let Some(status) = json::get_json(store, &keys::tenant_deployment(tenant_id)).await? {
            return Ok(Some(status));
        }
        Ok(json::get_json(store, &keys::tenant_deployment_legacy(tenant_id)).await?)
    }

    async fn stored_config(
        &self,
        tenant_id: &str,
    ) -> OrchestratorResult<Option<TenantOrchestratorConfig>> {
        let key = keys::tenant_orchestration(tenant_id);
        Ok(json::get_json(self.inner.store.as_ref(), &key).await?)
    }

    /// Write to the store first; the cache only follows a durable write.
    async fn persist_config(&self, config: &TenantOrchestratorConfig) -> OrchestratorResult<()> {
        let key = keys::tenant_orchestration(&config.tenant_id);
        json::set_json(self.inner.store.as_ref(), &key, config).await?;
        self.cache_config(config);
        Ok(())
    }

    fn cached(&self, tenant_id: &str) -> Option<TenantOrchestratorConfig> {
        self.inner
            .cache
            .read()
            .expect("config cache lock")
            .get(tenant_id)
            .cloned()
    }

    fn cache_config(&self, config: &TenantOrchestratorConfig) {
        self.inner
            .cache
            .write()
            .expect("config cache lock")
            .insert(config.tenant_id.clone(), config.clone());
    }

    fn notify_change(&self, config: &TenantOrchestratorConfig) {
        let hooks = self.inner.hooks.read().expect("hooks lock").clone();
        for hook in hooks {
            hook(config);
        }
    }

    async fn dedicated_config(
        &self,
        tenant_id: &str,
        operation: &str,
    ) -> OrchestratorResult<TenantOrchestratorConfig> {
        let config = self.get_tenant_config(tenant_id).await?;
        if !config.is_dedicated() {
            return Err(OrchestratorError::not_dedicated(tenant_id, operation));
        }
        Ok(config)
    }

    /// Like [`Self::dedicated_config`] but bypasses the cache, for paths that
    /// write a merged config back.
    async fn stored_dedicated_config(
        &self,
        tenant_id: &str,
        operation: &str,
    ) -> OrchestratorResult<TenantOrchestratorConfig> {
        match self.stored_config(tenant_id).await? {
            Some(config) if config.is_dedicated() => {
                self.cache_config(&config);
                Ok(config)
            }
            _ => Err(OrchestratorError::not_dedicated(tenant_id, operation)),
        }
    }

    async fn require_tenant(&self, tenant_id: &str) -> OrchestratorResult<()> {
        match self.inner.tenants.get_tenant(tenant_id).await? {
            Some(_) => Ok(()),
            None => Err(OrchestratorError::TenantNotFound(tenant_id.to_string())),
        }
    }

    /// The last known status for a dedicated tenant, moved to `phase`.
    async fn base_status(
        &self,
        config: &TenantOrchestratorConfig,
        phase: DeploymentPhase,
    ) -> OrchestratorResult<DeploymentStatus> {
        let mut status = self
            .stored_status(&config.tenant_id)
            .await?
            .unwrap_or_else(|| self.pending_status(config, phase));
        status.mode = OrchestrationMode::Dedicated;
        status.status = phase;
        status.message.clear();
        status.last_updated = chrono::Utc::now();
        if status.namespace.is_empty() {
            status.namespace = resources::namespace_name(&config.tenant_id);
        }
        Ok(status)
    }

    fn pending_status(
        &self,
        config: &TenantOrchestratorConfig,
        phase: DeploymentPhase,
    ) -> DeploymentStatus {
        DeploymentStatus::new(&config.tenant_id, OrchestrationMode::Dedicated, phase)
            .with_namespace(resources::namespace_name(&config.tenant_id))
            .with_version(self.image_version())
    }

    fn shared_status(&self, tenant_id: &str) -> DeploymentStatus {
        DeploymentStatus::new(tenant_id, OrchestrationMode::Shared, DeploymentPhase::Ready)
            .with_namespace(self.inner.settings.namespace.clone())
            .with_version(SHARED_VERSION)
    }

    /// Tag of the instance image, `latest` when untagged.
    pub(crate) fn image_version(&self) -> String {
        let image = &self.inner.settings.image;
        let name = image.rsplit('/').next().unwrap_or(image);
        match name.split_once(':') {
            Some((_, tag)) if !tag.is_empty() => tag.to_string(),
            _ => "latest".to_string(),
        }
    }
}

// ── Platform object conversion ─────────────────────────────────

fn deployment_event(event: Event) -> DeploymentEvent {
    DeploymentEvent {
        kind: event.type_.unwrap_or_default(),
        reason: event.reason.unwrap_or_default(),
        message: event.message.unwrap_or_default(),
        count: event.count.unwrap_or(1),
        first_seen: event.first_timestamp.map(|t| t.0),
        last_seen: event.last_timestamp.map(|t| t.0),
    }
}

fn pod_status(pod: Pod) -> PodStatus {
    let spec = pod.spec.unwrap_or_default();
    let status = pod.status.unwrap_or_default();
    PodStatus {
        name: pod.metadata.name.unwrap_or_default(),
        status: status.phase.unwrap_or_else(|| "Unknown".to_string()),
        creation_time: pod.metadata.creation_timestamp.map(|t| t.0),
        containers: status
            .container_statuses
            .unwrap_or_default()
            .into_iter()
            .map(|c| ContainerStatus {
                name: c.name,
                ready: c.ready,
                restart_count: c.restart_count,
                started: c.started.unwrap_or(false),
            })
            .collect(),
        node_name: spec.node_name.unwrap_or_default(),
        ip: status.pod_ip.unwrap_or_default(),
        restart_policy: spec.restart_policy.unwrap_or_default(),
    }
}

fn autoscaler_metrics(hpa: &HorizontalPodAutoscaler) -> DeploymentMetrics {
    let mut metrics = DeploymentMetrics::default();
    if let Some(spec) = &hpa.spec {
        metrics.target_cpu_utilization = spec
            .metrics
            .iter()
            .flatten()
            .filter_map(|m| m.resource.as_ref())
            .find(|r| r.name == "cpu")
            .and_then(|r| r.target.average_utilization)
            .unwrap_or_default();
    }
    if let Some(status) = &hpa.status {
        metrics.current_replicas = status.current_replicas.unwrap_or_default();
        metrics.desired_replicas = status.desired_replicas;
        for current in status.current_metrics.iter().flatten() {
            let Some(resource) = &current.resource else {
                continue;
            };
            let Some(utilization) = resource.current.average_utilization else {
                continue;
            };
            match resource.name.as_str() {
                "cpu" => metrics.cpu_utilization = utilization,
                "memory" => metrics.memory_utilization = utilization,
                _ => {}
            }
        }
    }
    metrics
}
