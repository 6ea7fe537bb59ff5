//! Tenant orchestration domain types.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, OrchestratorResult};

/// Default CPU target for autoscaling when none is given.
pub const DEFAULT_TARGET_CPU_UTILIZATION: i32 = 70;

static QUANTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]+(\.[0-9]+)?(m|k|Ki|Mi|Gi|Ti|Pi|Ei|M|G|T|P|E)?$").expect("quantity regex")
});

static DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\*\.)?([a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}$").expect("domain regex")
});

/// Where a tenant's traffic is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationMode {
    #[default]
    Shared,
    Dedicated,
}

impl fmt::Display for OrchestrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestrationMode::Shared => write!(f, "shared"),
            OrchestrationMode::Dedicated => write!(f, "dedicated"),
        }
    }
}

/// Container resource requests and limits as Kubernetes quantity strings.
///
/// An empty field means "not set".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub cpu_request: String,
    #[serde(default)]
    pub cpu_limit: String,
    #[serde(default)]
    pub memory_request: String,
    #[serde(default)]
    pub memory_limit: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_request: "100m".to_string(),
            cpu_limit: "200m".to_string(),
            memory_request: "128Mi".to_string(),
            memory_limit: "256Mi".to_string(),
        }
    }
}

impl ResourceLimits {
    /// Limits with no field set.
    pub fn unset() -> Self {
        Self {
            cpu_request: String::new(),
            cpu_limit: String::new(),
            memory_request: String::new(),
            memory_limit: String::new(),
        }
    }

    pub fn is_unset(&self) -> bool {
        self.fields().iter().all(|(_, v)| v.is_empty())
    }

    /// Overwrite each field that is set in `other`.
    pub fn merge(&mut self, other: &ResourceLimits) {
        let pairs = [
            (&mut self.cpu_request, &other.cpu_request),
            (&mut self.cpu_limit, &other.cpu_limit),
            (&mut self.memory_request, &other.memory_request),
            (&mut self.memory_limit, &other.memory_limit),
        ];
        for (mine, theirs) in pairs {
            if !theirs.is_empty() {
                mine.clone_from(theirs);
            }
        }
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        for (name, value) in self.fields() {
            if !value.is_empty() && !QUANTITY.is_match(value) {
                return Err(OrchestratorError::Validation(format!(
                    "{name} {value:?} is not a valid resource quantity"
                )));
            }
        }
        Ok(())
    }

    fn fields(&self) -> [(&'static str, &str); 4] {
        [
            ("cpu_request", &self.cpu_request),
            ("cpu_limit", &self.cpu_limit),
            ("memory_request", &self.memory_request),
            ("memory_limit", &self.memory_limit),
        ]
    }
}

/// Desired orchestration for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantOrchestratorConfig {
    pub tenant_id: String,
    pub mode: OrchestrationMode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dedicated_namespace: String,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    #[serde(default)]
    pub autoscaling_enabled: bool,
    pub min_replicas: i32,
    pub max_replicas: i32,
    #[serde(default)]
    pub target_cpu_utilization: i32,
    #[serde(default)]
    pub custom_domains: Vec<String>,
}

impl TenantOrchestratorConfig {
    /// The configuration a tenant has before anything was stored.
    pub fn default_for(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            mode: OrchestrationMode::Shared,
            dedicated_namespace: String::new(),
            resource_limits: ResourceLimits::default(),
            autoscaling_enabled: false,
            min_replicas: 1,
            max_replicas: 3,
            target_cpu_utilization: 0,
            custom_domains: Vec::new(),
        }
    }

    pub fn is_dedicated(&self) -> bool {
        self.mode == OrchestrationMode::Dedicated
    }

    /// Lowercase custom domains; ingress hosts must be lowercase.
    pub fn normalize_domains(&mut self) {
        for domain in &mut self.custom_domains {
            domain.make_ascii_lowercase();
        }
    }

    /// Check the replica, utilization, quantity and domain invariants.
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(OrchestratorError::Validation("tenant_id is required".into()));
        }
        if self.min_replicas < 1 {
            return Err(OrchestratorError::Validation(
                "min_replicas must be at least 1".into(),
            ));
        }
        if self.max_replicas < self.min_replicas {
            return Err(OrchestratorError::Validation(format!(
                "max_replicas ({}) must be >= min_replicas ({})",
                self.max_replicas, self.min_replicas
            )));
        }
        if self.autoscaling_enabled && !(10..=100).contains(&self.target_cpu_utilization) {
            return Err(OrchestratorError::Validation(format!(
                "target_cpu_utilization must be between 10 and 100, got {}",
                self.target_cpu_utilization
            )));
        }
        self.resource_limits.validate()?;
        for domain in &self.custom_domains {
            if !DOMAIN.is_match(domain) {
                return Err(OrchestratorError::Validation(format!(
                    "invalid custom domain {domain:?}"
                )));
            }
        }
        Ok(())
    }

    /// The autoscaling part of this config.
    pub fn autoscaling(&self) -> AutoscalingSettings {
        AutoscalingSettings {
            enabled: self.autoscaling_enabled,
            min_replicas: self.min_replicas,
            max_replicas: self.max_replicas,
            target_cpu_utilization: self.target_cpu_utilization,
        }
    }

    pub fn apply_autoscaling(&mut self, settings: &AutoscalingSettings) {
        self.autoscaling_enabled = settings.enabled;
        self.min_replicas = settings.min_replicas;
        self.max_replicas = settings.max_replicas;
        self.target_cpu_utilization = settings.target_cpu_utilization;
    }
}

/// Autoscaling policy for a dedicated tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalingSettings {
    pub enabled: bool,
    pub min_replicas: i32,
    pub max_replicas: i32,
    #[serde(default)]
    pub target_cpu_utilization: i32,
}

/// Progress of a tenant deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentPhase {
    Deploying,
    Updating,
    Scaling,
    Draining,
    Ready,
    Error,
    Removing,
    Removed,
    Unknown,
}

impl DeploymentPhase {
    /// Phase implied by a deployment's desired and ready replica counts.
    pub fn from_replicas(desired: i32, ready: i32) -> Self {
        if desired > 0 && ready >= desired {
            DeploymentPhase::Ready
        } else if ready == 0 {
            DeploymentPhase::Deploying
        } else {
            DeploymentPhase::Scaling
        }
    }
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentPhase::Deploying => "deploying",
            DeploymentPhase::Updating => "updating",
            DeploymentPhase::Scaling => "scaling",
            DeploymentPhase::Draining => "draining",
            DeploymentPhase::Ready => "ready",
            DeploymentPhase::Error => "error",
            DeploymentPhase::Removing => "removing",
            DeploymentPhase::Removed => "removed",
            DeploymentPhase::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Last recorded state of a tenant deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub tenant_id: String,
    pub mode: OrchestrationMode,
    pub status: DeploymentPhase,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_updated: DateTime<Utc>,
}

impl DeploymentStatus {
    pub fn new(tenant_id: &str, mode: OrchestrationMode, status: DeploymentPhase) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            mode,
            status,
            namespace: String::new(),
            version: String::new(),
            replicas: 0,
            ready_replicas: 0,
            message: String::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_replicas(mut self, replicas: i32, ready: i32) -> Self {
        self.replicas = replicas;
        self.ready_replicas = ready;
        self
    }
}

/// Status plus what the platform can tell about the running pods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedDeploymentStatus {
    #[serde(flatten)]
    pub status: DeploymentStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<DeploymentEvent>,
    #[serde(default)]
    pub metrics: DeploymentMetrics,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods: Vec<PodStatus>,
}

/// A platform event about the tenant deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub reason: String,
    pub message: String,
    pub count: i32,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Utilization reported by the tenant's autoscaler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentMetrics {
    pub cpu_utilization: i32,
    pub memory_utilization: i32,
    #[serde(default)]
    pub target_cpu_utilization: i32,
    #[serde(default)]
    pub current_replicas: i32,
    #[serde(default)]
    pub desired_replicas: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodStatus {
    pub name: String,
    pub status: String,
    pub creation_time: Option<DateTime<Utc>>,
    pub containers: Vec<ContainerStatus>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    pub restart_policy: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub ready: bool,
    pub restart_count: i32,
    pub started: bool,
}
