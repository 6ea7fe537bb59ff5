//! Kubernetes implementation of [`PlatformClient`].

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Namespace, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::{ManagedObject, ObjectKind, PlatformClient, PlatformError, PlatformResult};
use crate::config::OrchestrationConfig;

/// Map a kube error onto the platform taxonomy.
fn platform_err(e: kube::Error, what: &str) -> PlatformError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => PlatformError::AlreadyExists(what.to_string()),
        kube::Error::Api(ae) if ae.code == 404 => PlatformError::NotFound(what.to_string()),
        kube::Error::Api(ae) => PlatformError::Api {
            code: ae.code,
            message: ae.message,
        },
        other => PlatformError::Connection(other.to_string()),
    }
}

/// Talks to a Kubernetes API server through a typed kube client.
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
}

impl KubePlatform {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from in-cluster credentials, an explicit kubeconfig,
    /// or the default inference chain, in that order of preference.
    pub async fn connect(config: &OrchestrationConfig) -> PlatformResult<Self> {
        let kube_config = if config.in_cluster {
            kube::Config::incluster().map_err(|e| PlatformError::Config(e.to_string()))?
        } else if let Some(path) = &config.kubeconfig_path {
            let kubeconfig =
                Kubeconfig::read_from(path).map_err(|e| PlatformError::Config(e.to_string()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| PlatformError::Config(e.to_string()))?
        } else {
            kube::Config::infer()
                .await
                .map_err(|e| PlatformError::Config(e.to_string()))?
        };
        let cluster_url = kube_config.cluster_url.to_string();
        let client =
            Client::try_from(kube_config).map_err(|e| PlatformError::Config(e.to_string()))?;
        info!(%cluster_url, in_cluster = config.in_cluster, "kubernetes client ready");
        Ok(Self::new(client))
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn create_in<K>(&self, namespace: &str, object: &K) -> PlatformResult<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned,
        <K as Resource>::DynamicType: Default,
    {
        let what = format!("{namespace}/{}", object.name_any());
        self.api::<K>(namespace)
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| platform_err(e, &what))?;
        debug!(%what, "created");
        Ok(())
    }

    /// Replace `object`, carrying over the live resourceVersion and
    /// whatever `keep` copies from the live object.
    async fn replace_in<K>(
        &self,
        namespace: &str,
        object: &K,
        keep: impl FnOnce(&K, &mut K) + Send,
    ) -> PlatformResult<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned,
        <K as Resource>::DynamicType: Default,
    {
        let name = object.name_any();
        let what = format!("{namespace}/{name}");
        let api = self.api::<K>(namespace);
        let live = api.get(&name).await.map_err(|e| platform_err(e, &what))?;

        let mut desired = object.clone();
        desired.meta_mut().resource_version = live.resource_version();
        keep(&live, &mut desired);

        api.replace(&name, &PostParams::default(), &desired)
            .await
            .map_err(|e| platform_err(e, &what))?;
        debug!(%what, "replaced");
        Ok(())
    }

    async fn delete_in<K>(&self, namespace: &str, name: &str) -> PlatformResult<()>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + Debug + DeserializeOwned,
        <K as Resource>::DynamicType: Default,
    {
        let what = format!("{namespace}/{name}");
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| platform_err(e, &what))?;
        debug!(%what, "deleted");
        Ok(())
    }
}

#[async_trait]
impl PlatformClient for KubePlatform {
    async fn namespace_exists(&self, name: &str) -> PlatformResult<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let found = api
            .get_opt(name)
            .await
            .map_err(|e| platform_err(e, name))?;
        Ok(found.is_some())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> PlatformResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let name = namespace.name_any();
        api.create(&PostParams::default(), namespace)
            .await
            .map_err(|e| platform_err(e, &name))?;
        info!(namespace = %name, "namespace created");
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> PlatformResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| platform_err(e, name))?;
        info!(namespace = %name, "namespace deletion requested");
        Ok(())
    }

    async fn create(&self, namespace: &str, object: &ManagedObject) -> PlatformResult<()> {
        match object {
            ManagedObject::ConfigMap(o) => self.create_in(namespace, o).await,
            ManagedObject::Deployment(o) => self.create_in(namespace, o).await,
            ManagedObject::Service(o) => self.create_in(namespace, o).await,
            ManagedObject::Ingress(o) => self.create_in(namespace, o).await,
            ManagedObject::HorizontalPodAutoscaler(o) => self.create_in(namespace, o).await,
        }
    }

    async fn replace(&self, namespace: &str, object: &ManagedObject) -> PlatformResult<()> {
        match object {
            ManagedObject::ConfigMap(o) => self.replace_in(namespace, o, |_, _| {}).await,
            ManagedObject::Deployment(o) => self.replace_in(namespace, o, |_, _| {}).await,
            ManagedObject::Service(o) => {
                // clusterIP is immutable once allocated.
                self.replace_in(namespace, o, |live: &Service, desired: &mut Service| {
                    if let (Some(live_spec), Some(spec)) = (&live.spec, desired.spec.as_mut()) {
                        spec.cluster_ip.clone_from(&live_spec.cluster_ip);
                        spec.cluster_ips.clone_from(&live_spec.cluster_ips);
                    }
                })
                .await
            }
            ManagedObject::Ingress(o) => self.replace_in(namespace, o, |_, _| {}).await,
            ManagedObject::HorizontalPodAutoscaler(o) => {
                self.replace_in(namespace, o, |_, _| {}).await
            }
        }
    }

    async fn delete(&self, namespace: &str, kind: ObjectKind, name: &str) -> PlatformResult<()> {
        match kind {
            ObjectKind::ConfigMap => self.delete_in::<ConfigMap>(namespace, name).await,
            ObjectKind::Deployment => self.delete_in::<Deployment>(namespace, name).await,
            ObjectKind::Service => self.delete_in::<Service>(namespace, name).await,
            ObjectKind::Ingress => self.delete_in::<Ingress>(namespace, name).await,
            ObjectKind::HorizontalPodAutoscaler => {
                self.delete_in::<HorizontalPodAutoscaler>(namespace, name).await
            }
        }
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> PlatformResult<Deployment> {
        self.api::<Deployment>(namespace)
            .get(name)
            .await
            .map_err(|e| platform_err(e, &format!("{namespace}/{name}")))
    }

    async fn get_autoscaler(
        &self,
        namespace: &str,
        name: &str,
    ) -> PlatformResult<HorizontalPodAutoscaler> {
        self.api::<HorizontalPodAutoscaler>(namespace)
            .get(name)
            .await
            .map_err(|e| platform_err(e, &format!("{namespace}/{name}")))
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> PlatformResult<Vec<Pod>> {
        let pods = self
            .api::<Pod>(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| platform_err(e, namespace))?;
        Ok(pods.items)
    }

    async fn list_events(&self, namespace: &str, object_name: &str) -> PlatformResult<Vec<Event>> {
        let selector =
            format!("involvedObject.name={object_name},involvedObject.namespace={namespace}");
        let events = self
            .api::<Event>(namespace)
            .list(&ListParams::default().fields(&selector))
            .await
            .map_err(|e| platform_err(e, namespace))?;
        Ok(events.items)
    }
}
