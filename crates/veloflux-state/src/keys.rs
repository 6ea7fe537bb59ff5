//! Key and channel naming for everything VeloFlux keeps in the store.
//!
//! Cluster data lives under `veloflux:`; tenant data under `vf:tenant:`.

/// Hash of node id → `ClusterNode` JSON.
pub const NODES: &str = "veloflux:nodes";

/// Leadership token holding the leader's node id, with a TTL.
pub const LEADER: &str = "veloflux:leader";

/// Pub/sub channel carrying cluster events.
pub const EVENTS_CHANNEL: &str = "veloflux:events";

/// Prefix shared by every tenant key.
pub const TENANT_PREFIX: &str = "vf:tenant:";

/// Hash holding replicated state for one state type.
pub fn state_hash(state_type: &str) -> String {
    format!("veloflux:state:{state_type}")
}

/// Tenant record JSON.
pub fn tenant(tenant_id: &str) -> String {
    format!("{TENANT_PREFIX}{tenant_id}")
}

/// Tenant orchestration config JSON.
pub fn tenant_orchestration(tenant_id: &str) -> String {
    format!("{TENANT_PREFIX}{tenant_id}:orchestration")
}

/// Tenant deployment status JSON.
pub fn tenant_deployment(tenant_id: &str) -> String {
    format!("{TENANT_PREFIX}{tenant_id}:deployment")
}

/// Older name for the deployment status key, still read as a fallback.
pub fn tenant_deployment_legacy(tenant_id: &str) -> String {
    format!("{TENANT_PREFIX}{tenant_id}:deployment_status")
}

/// Extract the tenant id from a bare tenant record key.
///
/// Returns `None` for sub-keys such as `vf:tenant:acme:orchestration`.
pub fn tenant_id_from_key(key: &str) -> Option<&str> {
    let id = key.strip_prefix(TENANT_PREFIX)?;
    if id.is_empty() || id.contains(':') {
        None
    } else {
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_keys() {
        assert_eq!(tenant("acme"), "vf:tenant:acme");
        assert_eq!(tenant_orchestration("acme"), "vf:tenant:acme:orchestration");
        assert_eq!(tenant_deployment("acme"), "vf:tenant:acme:deployment");
        assert_eq!(tenant_deployment_legacy("acme"), "vf:tenant:acme:deployment_status");
    }

    #[test]
    fn state_hash_key() {
        assert_eq!(state_hash("backend"), "veloflux:state:backend");
    }

    #[test]
    fn tenant_id_only_from_record_keys() {
        assert_eq!(tenant_id_from_key("vf:tenant:acme"), Some("acme"));
        assert_eq!(tenant_id_from_key("vf:tenant:acme:orchestration"), None);
        assert_eq!(tenant_id_from_key("vf:tenant:"), None);
        assert_eq!(tenant_id_from_key("veloflux:nodes"), None);
    }
}
