//! Tenant lookup.
//!
//! Tenants are owned by the tenant management service; the orchestrator
//! only reads them to skip inactive tenants and to refuse dedicated
//! deployments for tenants that do not exist.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use veloflux_state::{KvStore, StateResult, json, keys};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub plan: String,
    pub active: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_domain: Option<String>,
}

impl Tenant {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            plan: "free".to_string(),
            active: true,
            created_at: Some(Utc::now()),
            custom_domain: None,
        }
    }
}

/// Read access to the tenant registry.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn get_tenant(&self, tenant_id: &str) -> StateResult<Option<Tenant>>;

    async fn list_tenants(&self) -> StateResult<Vec<Tenant>>;
}

/// Tenants stored as `vf:tenant:<id>` JSON records.
#[derive(Clone)]
pub struct StoreTenantDirectory {
    store: Arc<dyn KvStore>,
}

impl StoreTenantDirectory {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TenantDirectory for StoreTenantDirectory {
    async fn get_tenant(&self, tenant_id: &str) -> StateResult<Option<Tenant>> {
        json::get_json(self.store.as_ref(), &keys::tenant(tenant_id)).await
    }

    async fn list_tenants(&self) -> StateResult<Vec<Tenant>> {
        let mut tenants = Vec::new();
        for key in self.store.keys(keys::TENANT_PREFIX).await? {
            let Some(id) = keys::tenant_id_from_key(&key) else {
                continue;
            };
            match json::get_json::<Tenant>(self.store.as_ref(), &key).await {
                Ok(Some(tenant)) => tenants.push(tenant),
                Ok(None) => {}
                Err(e) => warn!(tenant_id = %id, error = %e, "skipping unreadable tenant record"),
            }
        }
        Ok(tenants)
    }
}

/// Fixed tenant set for tests and dev runs.
#[derive(Clone, Default)]
pub struct InMemoryTenants {
    tenants: Arc<RwLock<BTreeMap<String, Tenant>>>,
}

impl InMemoryTenants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant: Tenant) {
        self.tenants
            .write()
            .expect("tenants lock")
            .insert(tenant.id.clone(), tenant);
    }

    pub fn set_active(&self, tenant_id: &str, active: bool) {
        if let Some(t) = self.tenants.write().expect("tenants lock").get_mut(tenant_id) {
            t.active = active;
        }
    }
}

#[async_trait]
impl TenantDirectory for InMemoryTenants {
    async fn get_tenant(&self, tenant_id: &str) -> StateResult<Option<Tenant>> {
        Ok(self.tenants.read().expect("tenants lock").get(tenant_id).cloned())
    }

    async fn list_tenants(&self) -> StateResult<Vec<Tenant>> {
        Ok(self.tenants.read().expect("tenants lock").values().cloned().collect())
    }
}
