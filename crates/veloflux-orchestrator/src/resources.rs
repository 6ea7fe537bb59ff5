//! Naming and construction of the Kubernetes objects owned by a tenant.
//!
//! Every name is derived from the tenant id, so reconciling the same
//! config twice always targets the same objects.

use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec, MetricSpec,
    MetricTarget, ResourceMetricSource,
};
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::config::OrchestrationConfig;
use crate::platform::ManagedObject;
use crate::types::{ResourceLimits, TenantOrchestratorConfig};

pub const CONTAINER_NAME: &str = "veloflux";
pub const DRAIN_ANNOTATION: &str = "veloflux.io/drain-timestamp";

const CONFIG_MOUNT_PATH: &str = "/app/config";
const CONFIG_FILE: &str = "config.yaml";
const ADMIN_PORT: i32 = 9000;

/// (name, port) pairs exposed by every dedicated instance.
const PORTS: [(&str, i32); 4] = [("http", 80), ("https", 443), ("admin", ADMIN_PORT), ("metrics", 8080)];

// ── Names ──────────────────────────────────────────────────────

/// Lowercase the tenant id and replace anything outside `[a-z0-9-]`.
pub fn sanitize(tenant_id: &str) -> String {
    let cleaned: String = tenant_id
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    cleaned.trim_matches('-').to_string()
}

pub fn namespace_name(tenant_id: &str) -> String {
    format!("veloflux-{}", sanitize(tenant_id))
}

/// Name of the Deployment, Service, Ingress and HPA.
pub fn resource_name(tenant_id: &str) -> String {
    format!("veloflux-{}", sanitize(tenant_id))
}

pub fn config_map_name(tenant_id: &str) -> String {
    format!("{}-config", resource_name(tenant_id))
}

pub fn tls_secret_name(tenant_id: &str) -> String {
    format!("{}-tls", resource_name(tenant_id))
}

pub fn labels(tenant_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "veloflux".to_string()),
        ("tenant_id".to_string(), tenant_id.to_string()),
    ])
}

pub fn pod_selector(tenant_id: &str) -> String {
    format!("app=veloflux,tenant_id={tenant_id}")
}

fn meta(name: String, namespace: Option<&str>, tenant_id: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: namespace.map(str::to_string),
        labels: Some(labels(tenant_id)),
        ..Default::default()
    }
}

// ── Objects ────────────────────────────────────────────────────

pub fn namespace(tenant_id: &str) -> corev1::Namespace {
    corev1::Namespace {
        metadata: meta(namespace_name(tenant_id), None, tenant_id),
        ..Default::default()
    }
}

pub fn config_map(config: &TenantOrchestratorConfig, namespace: &str) -> ManagedObject {
    let tenant_id = &config.tenant_id;
    let contents = format!("tenant_id: {tenant_id}\nmode: {}\n", config.mode);
    ManagedObject::ConfigMap(corev1::ConfigMap {
        metadata: meta(config_map_name(tenant_id), Some(namespace), tenant_id),
        data: Some(BTreeMap::from([(CONFIG_FILE.to_string(), contents)])),
        ..Default::default()
    })
}

pub fn deployment(
    config: &TenantOrchestratorConfig,
    settings: &OrchestrationConfig,
    namespace: &str,
) -> ManagedObject {
    let tenant_id = &config.tenant_id;
    let pod_labels = labels(tenant_id);

    let env = vec![
        env_value("REDIS_ADDRESS", &settings.store_address),
        corev1::EnvVar {
            name: "REDIS_PASSWORD".to_string(),
            value_from: Some(corev1::EnvVarSource {
                secret_key_ref: Some(corev1::SecretKeySelector {
                    name: settings.store_password_secret.clone(),
                    key: "redis-password".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        env_value("TENANT_ID", tenant_id),
        env_value("TENANT_MODE", "dedicated"),
        env_value("CONFIG_PATH", &format!("{CONFIG_MOUNT_PATH}/{CONFIG_FILE}")),
    ];

    let container = corev1::Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(settings.image.clone()),
        ports: Some(
            PORTS
                .iter()
                .map(|(name, port)| corev1::ContainerPort {
                    name: Some(name.to_string()),
                    container_port: *port,
                    ..Default::default()
                })
                .collect(),
        ),
        env: Some(env),
        resources: Some(requirements(&config.resource_limits)),
        volume_mounts: Some(vec![corev1::VolumeMount {
            name: "config".to_string(),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        liveness_probe: Some(http_probe("/health", 30, 10)),
        readiness_probe: Some(http_probe("/ready", 5, 5)),
        ..Default::default()
    };

    ManagedObject::Deployment(Deployment {
        metadata: meta(resource_name(tenant_id), Some(namespace), tenant_id),
        spec: Some(DeploymentSpec {
            replicas: Some(config.min_replicas),
            selector: LabelSelector {
                match_labels: Some(pod_labels.clone()),
                ..Default::default()
            },
            template: corev1::PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(corev1::PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![corev1::Volume {
                        name: "config".to_string(),
                        config_map: Some(corev1::ConfigMapVolumeSource {
                            name: config_map_name(tenant_id),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

pub fn service(config: &TenantOrchestratorConfig, namespace: &str) -> ManagedObject {
    let tenant_id = &config.tenant_id;
    ManagedObject::Service(corev1::Service {
        metadata: meta(resource_name(tenant_id), Some(namespace), tenant_id),
        spec: Some(corev1::ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(labels(tenant_id)),
            ports: Some(
                PORTS
                    .iter()
                    .map(|(name, port)| corev1::ServicePort {
                        name: Some(name.to_string()),
                        port: *port,
                        target_port: Some(IntOrString::Int(*port)),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Ingress for the tenant's custom domains; `None` when there are none.
pub fn ingress(
    config: &TenantOrchestratorConfig,
    settings: &OrchestrationConfig,
    namespace: &str,
) -> Option<ManagedObject> {
    if config.custom_domains.is_empty() {
        return None;
    }
    let tenant_id = &config.tenant_id;
    let mut metadata = meta(resource_name(tenant_id), Some(namespace), tenant_id);
    metadata.annotations = Some(BTreeMap::from([
        ("kubernetes.io/ingress.class".to_string(), settings.ingress_class.clone()),
        ("cert-manager.io/cluster-issuer".to_string(), settings.cluster_issuer.clone()),
    ]));

    let rules = config
        .custom_domains
        .iter()
        .map(|domain| IngressRule {
            host: Some(domain.clone()),
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some("/".to_string()),
                    path_type: "Prefix".to_string(),
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: resource_name(tenant_id),
                            port: Some(ServiceBackendPort {
                                number: Some(80),
                                ..Default::default()
                            }),
                        }),
                        ..Default::default()
                    },
                }],
            }),
        })
        .collect();

    Some(ManagedObject::Ingress(Ingress {
        metadata,
        spec: Some(IngressSpec {
            tls: Some(vec![IngressTLS {
                hosts: Some(config.custom_domains.clone()),
                secret_name: Some(tls_secret_name(tenant_id)),
            }]),
            rules: Some(rules),
            ..Default::default()
        }),
        ..Default::default()
    }))
}

/// Autoscaler on CPU utilization; `None` when autoscaling is off.
pub fn autoscaler(config: &TenantOrchestratorConfig, namespace: &str) -> Option<ManagedObject> {
    if !config.autoscaling_enabled {
        return None;
    }
    let tenant_id = &config.tenant_id;
    Some(ManagedObject::HorizontalPodAutoscaler(HorizontalPodAutoscaler {
        metadata: meta(resource_name(tenant_id), Some(namespace), tenant_id),
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: resource_name(tenant_id),
            },
            min_replicas: Some(config.min_replicas),
            max_replicas: config.max_replicas,
            metrics: Some(vec![MetricSpec {
                type_: "Resource".to_string(),
                resource: Some(ResourceMetricSource {
                    name: "cpu".to_string(),
                    target: MetricTarget {
                        type_: "Utilization".to_string(),
                        average_utilization: Some(config.target_cpu_utilization),
                        ..Default::default()
                    },
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }))
}

// ── Mutations of live objects ──────────────────────────────────

/// Point the `veloflux` container at new limits, leaving unset fields as they are.
pub fn apply_resource_limits(deployment: &mut Deployment, limits: &ResourceLimits) -> bool {
    let Some(container) = deployment
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .and_then(|p| p.containers.iter_mut().find(|c| c.name == CONTAINER_NAME))
    else {
        return false;
    };
    let resources = container.resources.get_or_insert_with(Default::default);
    let requests = resources.requests.get_or_insert_with(BTreeMap::new);
    set_quantity(requests, "cpu", &limits.cpu_request);
    set_quantity(requests, "memory", &limits.memory_request);
    let caps = resources.limits.get_or_insert_with(BTreeMap::new);
    set_quantity(caps, "cpu", &limits.cpu_limit);
    set_quantity(caps, "memory", &limits.memory_limit);
    true
}

/// Stamp the pod template so the platform rolls every pod.
pub fn stamp_drain(deployment: &mut Deployment) {
    let Some(spec) = deployment.spec.as_mut() else {
        return;
    };
    let metadata = spec.template.metadata.get_or_insert_with(Default::default);
    metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(DRAIN_ANNOTATION.to_string(), Utc::now().to_rfc3339());
}

pub fn set_replicas(deployment: &mut Deployment, replicas: i32) {
    deployment.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
}

fn requirements(limits: &ResourceLimits) -> corev1::ResourceRequirements {
    let mut requests = BTreeMap::new();
    set_quantity(&mut requests, "cpu", &limits.cpu_request);
    set_quantity(&mut requests, "memory", &limits.memory_request);
    let mut caps = BTreeMap::new();
    set_quantity(&mut caps, "cpu", &limits.cpu_limit);
    set_quantity(&mut caps, "memory", &limits.memory_limit);
    corev1::ResourceRequirements {
        requests: (!requests.is_empty()).then_some(requests),
        limits: (!caps.is_empty()).then_some(caps),
        ..Default::default()
    }
}

fn set_quantity(map: &mut BTreeMap<String, Quantity>, resource: &str, value: &str) {
    if !value.is_empty() {
        map.insert(resource.to_string(), Quantity(value.to_string()));
    }
}

fn env_value(name: &str, value: &str) -> corev1::EnvVar {
    corev1::EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn http_probe(path: &str, initial_delay: i32, period: i32) -> corev1::Probe {
    corev1::Probe {
        http_get: Some(corev1::HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(ADMIN_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrchestrationMode;

    fn config(tenant: &str) -> TenantOrchestratorConfig {
        TenantOrchestratorConfig {
            mode: OrchestrationMode::Dedicated,
            min_replicas: 2,
            max_replicas: 5,
            ..TenantOrchestratorConfig::default_for(tenant)
        }
    }

    fn container(obj: &ManagedObject) -> corev1::Container {
        let ManagedObject::Deployment(d) = obj else { panic!("not a deployment") };
        d.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0].clone()
    }

    #[test]
    fn names_derive_from_tenant() {
        assert_eq!(namespace_name("Acme"), "veloflux-acme");
        assert_eq!(namespace_name("acme_corp.eu"), "veloflux-acme-corp-eu");
        assert_eq!(resource_name("acme"), "veloflux-acme");
        assert_eq!(config_map_name("acme"), "veloflux-acme-config");
        assert_eq!(tls_secret_name("acme"), "veloflux-acme-tls");
        assert_eq!(pod_selector("acme"), "app=veloflux,tenant_id=acme");
    }

    #[test]
    fn deployment_shape() {
        let obj = deployment(&config("acme"), &OrchestrationConfig::default(), "veloflux-acme");
        let ManagedObject::Deployment(d) = &obj else { panic!() };
        assert_eq!(d.metadata.name.as_deref(), Some("veloflux-acme"));
        assert_eq!(d.spec.as_ref().unwrap().replicas, Some(2));

        let c = container(&obj);
        assert_eq!(c.name, "veloflux");
        assert_eq!(c.image.as_deref(), Some("veloflux/veloflux:latest"));
        let ports: Vec<i32> = c.ports.unwrap().iter().map(|p| p.container_port).collect();
        assert_eq!(ports, vec![80, 443, 9000, 8080]);

        let env = c.env.unwrap();
        let tenant = env.iter().find(|e| e.name == "TENANT_ID").unwrap();
        assert_eq!(tenant.value.as_deref(), Some("acme"));
        let password = env.iter().find(|e| e.name == "REDIS_PASSWORD").unwrap();
        let secret = password.value_from.as_ref().unwrap().secret_key_ref.as_ref().unwrap();
        assert_eq!(secret.name, "veloflux-redis");

        let limits = c.resources.unwrap().limits.unwrap();
        assert_eq!(limits["cpu"], Quantity("200m".into()));
        assert_eq!(limits["memory"], Quantity("256Mi".into()));
    }

    #[test]
    fn optional_objects_follow_config() {
        let settings = OrchestrationConfig::default();
        let mut cfg = config("acme");
        assert!(ingress(&cfg, &settings, "ns").is_none());
        assert!(autoscaler(&cfg, "ns").is_none());

        cfg.custom_domains = vec!["acme.example.com".into()];
        cfg.autoscaling_enabled = true;
        cfg.target_cpu_utilization = 70;

        let Some(ManagedObject::Ingress(ing)) = ingress(&cfg, &settings, "ns") else { panic!() };
        let annotations = ing.metadata.annotations.unwrap();
        assert_eq!(annotations["cert-manager.io/cluster-issuer"], "letsencrypt-prod");
        let spec = ing.spec.unwrap();
        assert_eq!(spec.tls.unwrap()[0].secret_name.as_deref(), Some("veloflux-acme-tls"));
        assert_eq!(spec.rules.unwrap()[0].host.as_deref(), Some("acme.example.com"));

        let Some(ManagedObject::HorizontalPodAutoscaler(hpa)) = autoscaler(&cfg, "ns") else {
            panic!()
        };
        let spec = hpa.spec.unwrap();
        assert_eq!(spec.min_replicas, Some(2));
        assert_eq!(spec.max_replicas, 5);
        assert_eq!(spec.scale_target_ref.name, "veloflux-acme");
        let metrics = spec.metrics.unwrap();
        assert_eq!(metrics[0].resource.as_ref().unwrap().target.average_utilization, Some(70));
    }

    #[test]
    fn resource_patch_keeps_unset_fields() {
        let obj = deployment(&config("acme"), &OrchestrationConfig::default(), "ns");
        let ManagedObject::Deployment(mut d) = obj else { panic!() };

        let patch = ResourceLimits {
            cpu_limit: "500m".into(),
            ..ResourceLimits::unset()
        };
        assert!(apply_resource_limits(&mut d, &patch));

        let c = &d.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0];
        let res = c.resources.as_ref().unwrap();
        assert_eq!(res.limits.as_ref().unwrap()["cpu"], Quantity("500m".into()));
        assert_eq!(res.limits.as_ref().unwrap()["memory"], Quantity("256Mi".into()));
        assert_eq!(res.requests.as_ref().unwrap()["cpu"], Quantity("100m".into()));
    }

    #[test]
    fn drain_stamps_pod_template() {
        let obj = deployment(&config("acme"), &OrchestrationConfig::default(), "ns");
        let ManagedObject::Deployment(mut d) = obj else { panic!() };
        stamp_drain(&mut d);
        let annotations = d.spec.unwrap().template.metadata.unwrap().annotations.unwrap();
        assert!(annotations.contains_key(DRAIN_ANNOTATION));
    }
}
