//! The coordination capability handed to the rest of the control plane.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use veloflux_state::KvStore;

use crate::cluster::Cluster;
use crate::config::ClusterConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::types::{ClusterNode, ClusterRole, ClusterStatus, StateType};

/// Boxed future returned by state listeners.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Callback invoked with `(state_type, key, value)` when replicated state
/// changes on another node.
pub type StateListener = Arc<dyn Fn(StateType, String, Vec<u8>) -> BoxFuture + Send + Sync>;

/// Leadership, membership and replicated state, clustered or not.
#[async_trait]
pub trait ClusterCoordinator: Send + Sync {
    fn node_id(&self) -> String;

    fn is_enabled(&self) -> bool;

    /// Whether this node currently holds the leadership lease.
    fn is_leader(&self) -> bool;

    async fn start(&self) -> ClusterResult<()>;

    /// Leave the cluster. Safe to call more than once.
    async fn stop(&self) -> ClusterResult<()>;

    /// Write `value` for `(state_type, key)` and notify the other nodes.
    async fn publish_state(&self, state_type: StateType, key: &str, value: &[u8])
    -> ClusterResult<()>;

    async fn get_state(&self, state_type: StateType, key: &str) -> ClusterResult<Vec<u8>>;

    async fn get_all_state(&self, state_type: StateType) -> ClusterResult<HashMap<String, Vec<u8>>>;

    /// Known nodes, sorted by id.
    fn nodes(&self) -> Vec<ClusterNode>;

    async fn status(&self) -> ClusterResult<ClusterStatus>;

    /// Add a listener for remote changes to `state_type`. Listeners stack.
    fn register_state_listener(&self, state_type: StateType, listener: StateListener);

    fn set_node_address(&self, address: &str);
}

/// Coordinator used when clustering is disabled.
///
/// This node is always the leader, publishing is accepted and dropped,
/// and the membership is a single synthetic `standalone` node.
#[derive(Debug, Default)]
pub struct NoopCoordinator {
    address: std::sync::RwLock<String>,
}

impl NoopCoordinator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterCoordinator for NoopCoordinator {
    fn node_id(&self) -> String {
        "standalone".to_string()
    }

    fn is_enabled(&self) -> bool {
        false
    }

    fn is_leader(&self) -> bool {
        true
    }

    async fn start(&self) -> ClusterResult<()> {
        Ok(())
    }

    async fn stop(&self) -> ClusterResult<()> {
        Ok(())
    }

    async fn publish_state(&self, _: StateType, _: &str, _: &[u8]) -> ClusterResult<()> {
        Ok(())
    }

    async fn get_state(&self, _: StateType, _: &str) -> ClusterResult<Vec<u8>> {
        Err(ClusterError::Disabled)
    }

    async fn get_all_state(&self, _: StateType) -> ClusterResult<HashMap<String, Vec<u8>>> {
        Err(ClusterError::Disabled)
    }

    fn nodes(&self) -> Vec<ClusterNode> {
        let address = self.address.read().expect("address lock").clone();
        vec![ClusterNode::standalone(address)]
    }

    async fn status(&self) -> ClusterResult<ClusterStatus> {
        Ok(ClusterStatus {
            enabled: false,
            node_id: self.node_id(),
            role: ClusterRole::Leader,
            leader_id: Some(self.node_id()),
            node_count: 1,
            healthy_nodes: 1,
        })
    }

    fn register_state_listener(&self, _: StateType, _: StateListener) {}

    fn set_node_address(&self, address: &str) {
        *self.address.write().expect("address lock") = address.to_string();
    }
}

/// Build the coordinator for `config`: a [`Cluster`] when enabled,
/// otherwise a [`NoopCoordinator`].
pub fn coordinator(config: ClusterConfig, store: Arc<dyn KvStore>) -> Arc<dyn ClusterCoordinator> {
    if !config.enabled {
        info!("clustering disabled, running standalone");
        return Arc::new(NoopCoordinator::new());
    }
    Arc::new(Cluster::new(config, store))
}
