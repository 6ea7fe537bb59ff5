//! Container-orchestration platform seam.
//!
//! The orchestrator never talks to Kubernetes directly. It goes through
//! [`PlatformClient`], implemented by [`KubePlatform`] for real clusters
//! and [`InMemoryPlatform`] for tests and dev runs.

mod kubernetes;
mod memory;

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Namespace, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

pub use self::kubernetes::KubePlatform;
pub use self::memory::InMemoryPlatform;

pub type PlatformResult<T> = Result<T, PlatformError>;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("platform API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("platform unreachable: {0}")]
    Connection(String),

    #[error("invalid platform configuration: {0}")]
    Config(String),
}

impl PlatformError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, PlatformError::AlreadyExists(_))
    }
}

/// Kinds of namespaced objects managed per tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    ConfigMap,
    Deployment,
    Service,
    Ingress,
    HorizontalPodAutoscaler,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectKind::ConfigMap => "configmap",
            ObjectKind::Deployment => "deployment",
            ObjectKind::Service => "service",
            ObjectKind::Ingress => "ingress",
            ObjectKind::HorizontalPodAutoscaler => "horizontalpodautoscaler",
        };
        f.write_str(s)
    }
}

/// A desired tenant object.
#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::large_enum_variant)]
pub enum ManagedObject {
    ConfigMap(ConfigMap),
    Deployment(Deployment),
    Service(Service),
    Ingress(Ingress),
    HorizontalPodAutoscaler(HorizontalPodAutoscaler),
}

impl ManagedObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ManagedObject::ConfigMap(_) => ObjectKind::ConfigMap,
            ManagedObject::Deployment(_) => ObjectKind::Deployment,
            ManagedObject::Service(_) => ObjectKind::Service,
            ManagedObject::Ingress(_) => ObjectKind::Ingress,
            ManagedObject::HorizontalPodAutoscaler(_) => ObjectKind::HorizontalPodAutoscaler,
        }
    }

    pub fn name(&self) -> &str {
        let name = match self {
            ManagedObject::ConfigMap(o) => &o.metadata.name,
            ManagedObject::Deployment(o) => &o.metadata.name,
            ManagedObject::Service(o) => &o.metadata.name,
            ManagedObject::Ingress(o) => &o.metadata.name,
            ManagedObject::HorizontalPodAutoscaler(o) => &o.metadata.name,
        };
        name.as_deref().unwrap_or_default()
    }

    /// `kind/name`, for logs and error messages.
    pub fn describe(&self) -> String {
        format!("{}/{}", self.kind(), self.name())
    }
}

/// Operations the orchestrator needs from the platform.
///
/// `create` reports an existing object as [`PlatformError::AlreadyExists`];
/// `replace`, `delete` and the getters report a missing one as
/// [`PlatformError::NotFound`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn namespace_exists(&self, name: &str) -> PlatformResult<bool>;

    async fn create_namespace(&self, namespace: &Namespace) -> PlatformResult<()>;

    /// Delete a namespace and, with it, everything inside.
    async fn delete_namespace(&self, name: &str) -> PlatformResult<()>;

    async fn create(&self, namespace: &str, object: &ManagedObject) -> PlatformResult<()>;

    /// Replace an existing object with `object`, keeping server-owned fields.
    async fn replace(&self, namespace: &str, object: &ManagedObject) -> PlatformResult<()>;

    async fn delete(&self, namespace: &str, kind: ObjectKind, name: &str) -> PlatformResult<()>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> PlatformResult<Deployment>;

    async fn get_autoscaler(
        &self,
        namespace: &str,
        name: &str,
    ) -> PlatformResult<HorizontalPodAutoscaler>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> PlatformResult<Vec<Pod>>;

    /// Events whose involved object is `object_name` in `namespace`.
    async fn list_events(&self, namespace: &str, object_name: &str) -> PlatformResult<Vec<Event>>;
}
