//! velofluxd.toml configuration.
//!
//! Every section and field has a default, so an empty file (or no file)
//! yields a standalone node with orchestration off.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use veloflux_cluster::ClusterConfig;
use veloflux_orchestrator::OrchestrationConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub cluster: ClusterSection,
    pub orchestration: OrchestrationSection,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub address: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            address: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub enabled: bool,
    pub node_id: String,
    /// Advertised address; the listen address when empty.
    pub node_address: String,
    pub heartbeat_interval_secs: u64,
    pub leader_timeout_secs: u64,
    pub resync_interval_secs: u64,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: String::new(),
            node_address: String::new(),
            heartbeat_interval_secs: 5,
            leader_timeout_secs: 15,
            resync_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    #[default]
    Kubernetes,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationSection {
    pub enabled: bool,
    pub platform: PlatformKind,
    pub in_cluster: bool,
    pub kubeconfig_path: Option<PathBuf>,
    pub namespace: String,
    pub image: String,
    pub store_address: String,
    pub store_password_secret: String,
    pub ingress_class: String,
    pub cluster_issuer: String,
    pub watch_interval_secs: u64,
    pub operation_timeout_secs: u64,
    pub max_concurrent_reconciliations: usize,
}

impl Default for OrchestrationSection {
    fn default() -> Self {
        let defaults = OrchestrationConfig::default();
        Self {
            enabled: false,
            platform: PlatformKind::Kubernetes,
            in_cluster: defaults.in_cluster,
            kubeconfig_path: None,
            namespace: defaults.namespace,
            image: defaults.image,
            store_address: defaults.store_address,
            store_password_secret: defaults.store_password_secret,
            ingress_class: defaults.ingress_class,
            cluster_issuer: defaults.cluster_issuer,
            watch_interval_secs: defaults.watch_interval.as_secs(),
            operation_timeout_secs: defaults.operation_timeout.as_secs(),
            max_concurrent_reconciliations: defaults.max_concurrent_reconciliations,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// `EnvFilter` directives; `RUST_LOG` takes precedence.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            filter: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: DaemonConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Load `path` when given, otherwise use the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen_addr()?;

        let cluster = &self.cluster;
        if cluster.heartbeat_interval_secs == 0 {
            bail!("cluster.heartbeat_interval_secs must be greater than zero");
        }
        if cluster.resync_interval_secs == 0 {
            bail!("cluster.resync_interval_secs must be greater than zero");
        }
        if cluster.leader_timeout_secs <= cluster.heartbeat_interval_secs {
            bail!(
                "cluster.leader_timeout_secs ({}) must exceed heartbeat_interval_secs ({})",
                cluster.leader_timeout_secs,
                cluster.heartbeat_interval_secs
            );
        }

        let orch = &self.orchestration;
        if orch.watch_interval_secs == 0 {
            bail!("orchestration.watch_interval_secs must be greater than zero");
        }
        if orch.operation_timeout_secs == 0 {
            bail!("orchestration.operation_timeout_secs must be greater than zero");
        }
        if orch.max_concurrent_reconciliations == 0 {
            bail!("orchestration.max_concurrent_reconciliations must be greater than zero");
        }
        if orch.image.trim().is_empty() {
            bail!("orchestration.image must not be empty");
        }
        if self.store.backend == StoreBackend::Redis && self.store.address.trim().is_empty() {
            bail!("store.address is required for the redis backend");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .listen
            .parse()
            .with_context(|| format!("invalid server.listen address {:?}", self.server.listen))
    }

    pub fn cluster_config(&self) -> ClusterConfig {
        let section = &self.cluster;
        let address = if section.node_address.is_empty() {
            self.server.listen.clone()
        } else {
            section.node_address.clone()
        };
        ClusterConfig {
            enabled: section.enabled,
            ..ClusterConfig::default()
        }
        .with_node_id(section.node_id.clone())
        .with_node_address(address)
        .with_heartbeat_interval(Duration::from_secs(section.heartbeat_interval_secs))
        .with_leader_timeout(Duration::from_secs(section.leader_timeout_secs))
        .with_resync_interval(Duration::from_secs(section.resync_interval_secs))
    }

    pub fn orchestration_config(&self) -> OrchestrationConfig {
        let section = &self.orchestration;
        OrchestrationConfig {
            enabled: section.enabled,
            in_cluster: section.in_cluster,
            kubeconfig_path: section.kubeconfig_path.clone(),
            namespace: section.namespace.clone(),
            image: section.image.clone(),
            store_address: section.store_address.clone(),
            store_password_secret: section.store_password_secret.clone(),
            ingress_class: section.ingress_class.clone(),
            cluster_issuer: section.cluster_issuer.clone(),
            watch_interval: Duration::from_secs(section.watch_interval_secs),
            operation_timeout: Duration::from_secs(section.operation_timeout_secs),
            max_concurrent_reconciliations: section.max_concurrent_reconciliations,
        }
    }
}
