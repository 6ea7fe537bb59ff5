//! Cluster configuration.

use std::hash::{Hash, Hasher};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Settings for one cluster participant.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// When false, a [`NoopCoordinator`](crate::NoopCoordinator) is used.
    pub enabled: bool,
    /// Node identity. Generated from the hostname when empty.
    pub node_id: String,
    /// Address other nodes can reach this node on.
    pub node_address: String,
    /// How often to heartbeat and run an election round.
    pub heartbeat_interval: Duration,
    /// A node unseen for this long is unhealthy.
    pub leader_timeout: Duration,
    /// How often listened-to state is re-read from the store.
    pub resync_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: String::new(),
            node_address: String::new(),
            heartbeat_interval: Duration::from_secs(5),
            leader_timeout: Duration::from_secs(15),
            resync_interval: Duration::from_secs(60),
        }
    }
}

impl ClusterConfig {
    /// An enabled configuration with default timings.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn with_node_address(mut self, address: impl Into<String>) -> Self {
        self.node_address = address.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_leader_timeout(mut self, timeout: Duration) -> Self {
        self.leader_timeout = timeout;
        self
    }

    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// TTL of the leadership key: twice the leader timeout.
    pub fn lease_ttl(&self) -> Duration {
        self.leader_timeout * 2
    }

    /// The configured node id, or a generated `<hostname>-<8 hex>` one.
    pub fn resolved_node_id(&self) -> String {
        if self.node_id.is_empty() {
            generate_node_id(&hostname())
        } else {
            self.node_id.clone()
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "veloflux".to_string())
}

fn generate_node_id(host: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    host.hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    format!("{host}-{:08x}", hasher.finish() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClusterConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.leader_timeout, Duration::from_secs(15));
        assert_eq!(config.lease_ttl(), Duration::from_secs(30));
    }

    #[test]
    fn explicit_node_id_wins() {
        let config = ClusterConfig::enabled().with_node_id("n1");
        assert_eq!(config.resolved_node_id(), "n1");
    }

    #[test]
    fn generated_node_id_has_hostname_and_suffix() {
        let id = generate_node_id("lb-0");
        assert!(id.starts_with("lb-0-"));
        assert_eq!(id.len(), "lb-0-".len() + 8);
    }
}
