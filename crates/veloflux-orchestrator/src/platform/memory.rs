//! In-memory platform used by tests and `platform = "memory"` dev runs.
//!
//! Behaves like a tiny API server: namespaces must exist before objects are
//! created in them, deleting a namespace deletes its contents, and
//! deployments report themselves fully ready unless told otherwise.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus as K8sDeploymentStatus};
use k8s_openapi::api::autoscaling::v2::{HorizontalPodAutoscaler, HorizontalPodAutoscalerStatus};
use k8s_openapi::api::core::v1::{Event, Namespace, Pod};

use super::{ManagedObject, ObjectKind, PlatformClient, PlatformError, PlatformResult};

#[derive(Default)]
struct NamespaceContents {
    objects: BTreeMap<(ObjectKind, String), ManagedObject>,
    pods: Vec<Pod>,
    events: Vec<Event>,
}

#[derive(Default)]
struct Inner {
    namespaces: HashMap<String, NamespaceContents>,
}

/// A platform that lives entirely in memory. Clones share state.
#[derive(Clone)]
pub struct InMemoryPlatform {
    inner: Arc<RwLock<Inner>>,
    auto_ready: Arc<AtomicBool>,
    unreachable: Arc<AtomicBool>,
    mutations: Arc<AtomicUsize>,
}

impl Default for InMemoryPlatform {
    fn default() -> Self {
        Self {
            inner: Arc::default(),
            auto_ready: Arc::new(AtomicBool::new(true)),
            unreachable: Arc::new(AtomicBool::new(false)),
            mutations: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether newly written deployments immediately report all replicas ready.
    pub fn set_auto_ready(&self, ready: bool) {
        self.auto_ready.store(ready, Ordering::SeqCst);
    }

    /// Make every call fail as if the API server were down.
    pub fn set_unreachable(&self, down: bool) {
        self.unreachable.store(down, Ordering::SeqCst);
    }

    /// Number of create/replace/delete calls that succeeded.
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.read().namespaces.contains_key(namespace)
    }

    pub fn get(&self, namespace: &str, kind: ObjectKind, name: &str) -> Option<ManagedObject> {
        self.read()
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.objects.get(&(kind, name.to_string())))
            .cloned()
    }

    pub fn count(&self, namespace: &str, kind: ObjectKind) -> usize {
        self.read()
            .namespaces
            .get(namespace)
            .map(|ns| ns.objects.keys().filter(|(k, _)| *k == kind).count())
            .unwrap_or(0)
    }

    /// Overwrite the observed replica counts of a deployment.
    pub fn set_deployment_status(&self, namespace: &str, name: &str, replicas: i32, ready: i32) {
        let mut inner = self.write();
        let Some(ns) = inner.namespaces.get_mut(namespace) else {
            return;
        };
        if let Some(ManagedObject::Deployment(d)) =
            ns.objects.get_mut(&(ObjectKind::Deployment, name.to_string()))
        {
            d.status = Some(K8sDeploymentStatus {
                replicas: Some(replicas),
                ready_replicas: Some(ready),
                ..Default::default()
            });
        }
    }

    pub fn set_autoscaler_status(
        &self,
        namespace: &str,
        name: &str,
        status: HorizontalPodAutoscalerStatus,
    ) {
        let mut inner = self.write();
        let Some(ns) = inner.namespaces.get_mut(namespace) else {
            return;
        };
        if let Some(ManagedObject::HorizontalPodAutoscaler(h)) =
            ns.objects.get_mut(&(ObjectKind::HorizontalPodAutoscaler, name.to_string()))
        {
            h.status = Some(status);
        }
    }

    pub fn add_pod(&self, namespace: &str, pod: Pod) {
        if let Some(ns) = self.write().namespaces.get_mut(namespace) {
            ns.pods.push(pod);
        }
    }

    pub fn add_event(&self, namespace: &str, event: Event) {
        if let Some(ns) = self.write().namespaces.get_mut(namespace) {
            ns.events.push(event);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("platform lock")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("platform lock")
    }

    fn check_reachable(&self) -> PlatformResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(PlatformError::Connection("connection refused".to_string()))
        } else {
            Ok(())
        }
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    /// Fill in what the server would: observed status for deployments.
    fn observe(&self, object: &ManagedObject) -> ManagedObject {
        let mut object = object.clone();
        if let ManagedObject::Deployment(d) = &mut object {
            let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            let ready = if self.auto_ready.load(Ordering::SeqCst) { desired } else { 0 };
            d.status = Some(K8sDeploymentStatus {
                replicas: Some(desired),
                ready_replicas: Some(ready),
                ..Default::default()
            });
        }
        object
    }
}

#[async_trait]
impl PlatformClient for InMemoryPlatform {
    async fn namespace_exists(&self, name: &str) -> PlatformResult<bool> {
        self.check_reachable()?;
        Ok(self.has_namespace(name))
    }

    async fn create_namespace(&self, namespace: &Namespace) -> PlatformResult<()> {
        self.check_reachable()?;
        let name = namespace.metadata.name.clone().unwrap_or_default();
        let mut inner = self.write();
        if inner.namespaces.contains_key(&name) {
            return Err(PlatformError::AlreadyExists(name));
        }
        inner.namespaces.insert(name, NamespaceContents::default());
        drop(inner);
        self.mutated();
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> PlatformResult<()> {
        self.check_reachable()?;
        if self.write().namespaces.remove(name).is_none() {
            return Err(PlatformError::NotFound(name.to_string()));
        }
        self.mutated();
        Ok(())
    }

    async fn create(&self, namespace: &str, object: &ManagedObject) -> PlatformResult<()> {
        self.check_reachable()?;
        let observed = self.observe(object);
        let mut inner = self.write();
        let ns = inner
            .namespaces
            .get_mut(namespace)
            .ok_or_else(|| PlatformError::NotFound(format!("namespace {namespace}")))?;
        let key = (object.kind(), object.name().to_string());
        if ns.objects.contains_key(&key) {
            return Err(PlatformError::AlreadyExists(object.describe()));
        }
        ns.objects.insert(key, observed);
        drop(inner);
        self.mutated();
        Ok(())
    }

    async fn replace(&self, namespace: &str, object: &ManagedObject) -> PlatformResult<()> {
        self.check_reachable()?;
        let observed = self.observe(object);
        let mut inner = self.write();
        let slot = inner
            .namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.objects.get_mut(&(object.kind(), object.name().to_string())))
            .ok_or_else(|| PlatformError::NotFound(object.describe()))?;
        *slot = observed;
        drop(inner);
        self.mutated();
        Ok(())
    }

    async fn delete(&self, namespace: &str, kind: ObjectKind, name: &str) -> PlatformResult<()> {
        self.check_reachable()?;
        let removed = self
            .write()
            .namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.objects.remove(&(kind, name.to_string())));
        match removed {
            Some(_) => {
                self.mutated();
                Ok(())
            }
            None => Err(PlatformError::NotFound(format!("{kind}/{name}"))),
        }
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> PlatformResult<Deployment> {
        self.check_reachable()?;
        match self.get(namespace, ObjectKind::Deployment, name) {
            Some(ManagedObject::Deployment(d)) => Ok(d),
            _ => Err(PlatformError::NotFound(format!("deployment/{name}"))),
        }
    }

    async fn get_autoscaler(
        &self,
        namespace: &str,
        name: &str,
    ) -> PlatformResult<HorizontalPodAutoscaler> {
        self.check_reachable()?;
        match self.get(namespace, ObjectKind::HorizontalPodAutoscaler, name) {
            Some(ManagedObject::HorizontalPodAutoscaler(h)) => Ok(h),
            _ => Err(PlatformError::NotFound(format!("horizontalpodautoscaler/{name}"))),
        }
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> PlatformResult<Vec<Pod>> {
        self.check_reachable()?;
        let wanted: Vec<(&str, &str)> = label_selector
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        let inner = self.read();
        let Some(ns) = inner.namespaces.get(namespace) else {
            return Ok(Vec::new());
        };
        Ok(ns
            .pods
            .iter()
            .filter(|pod| {
                let labels = pod.metadata.labels.as_ref();
                wanted.iter().all(|(k, v)| {
                    labels.and_then(|l| l.get(*k)).is_some_and(|actual| actual == v)
                })
            })
            .cloned()
            .collect())
    }

    async fn list_events(&self, namespace: &str, object_name: &str) -> PlatformResult<Vec<Event>> {
        self.check_reachable()?;
        let inner = self.read();
        let Some(ns) = inner.namespaces.get(namespace) else {
            return Ok(Vec::new());
        };
        Ok(ns
            .events
            .iter()
            .filter(|e| e.involved_object.name.as_deref() == Some(object_name))
            .cloned()
            .collect())
    }
}
