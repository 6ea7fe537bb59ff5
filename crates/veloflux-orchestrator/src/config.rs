//! Orchestrator settings.

use std::path::PathBuf;
use std::time::Duration;

/// How the orchestrator talks to the platform and what it deploys.
#[derive(Debug, Clone)]
pub struct OrchestrationConfig {
    pub enabled: bool,
    /// Use the service account of the pod we run in.
    pub in_cluster: bool,
    /// Explicit kubeconfig; otherwise the usual inference applies.
    pub kubeconfig_path: Option<PathBuf>,
    /// Namespace of the shared pool.
    pub namespace: String,
    /// Image run by dedicated tenant instances.
    pub image: String,
    /// Store address handed to dedicated instances.
    pub store_address: String,
    /// Secret holding the store password (key `redis-password`).
    pub store_password_secret: String,
    pub ingress_class: String,
    pub cluster_issuer: String,
    /// Drift watcher period.
    pub watch_interval: Duration,
    /// Upper bound for one reconciliation or platform operation.
    pub operation_timeout: Duration,
    /// Reconciliation jobs allowed to run at once.
    pub max_concurrent_reconciliations: usize,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            in_cluster: false,
            kubeconfig_path: None,
            namespace: "veloflux".to_string(),
            image: "veloflux/veloflux:latest".to_string(),
            store_address: "redis-master.redis.svc.cluster.local:6379".to_string(),
            store_password_secret: "veloflux-redis".to_string(),
            ingress_class: "nginx".to_string(),
            cluster_issuer: "letsencrypt-prod".to_string(),
            watch_interval: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(60),
            max_concurrent_reconciliations: 4,
        }
    }
}

impl OrchestrationConfig {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_reconciliations(mut self, max: usize) -> Self {
        self.max_concurrent_reconciliations = max;
        self
    }
}
