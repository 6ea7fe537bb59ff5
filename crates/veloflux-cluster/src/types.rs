//! Cluster domain types.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role a node currently believes it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterRole {
    Leader,
    Follower,
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterRole::Leader => write!(f, "leader"),
            ClusterRole::Follower => write!(f, "follower"),
        }
    }
}

/// A cluster member as recorded in the `veloflux:nodes` hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: String,
    pub address: String,
    pub role: ClusterRole,
    pub last_seen: DateTime<Utc>,
    pub is_healthy: bool,
}

impl ClusterNode {
    /// The synthetic node reported when clustering is disabled.
    pub fn standalone(address: impl Into<String>) -> Self {
        Self {
            id: "standalone".to_string(),
            address: address.into(),
            role: ClusterRole::Leader,
            last_seen: Utc::now(),
            is_healthy: true,
        }
    }

    /// Whether the node has been seen within `timeout` of `now`.
    pub fn seen_within(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match (now - self.last_seen).to_std() {
            Ok(age) => age <= timeout,
            // last_seen in the future: clock skew, treat as fresh.
            Err(_) => true,
        }
    }
}

/// Partition of the replicated key/value namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateType {
    Backend,
    Route,
    Config,
}

impl StateType {
    pub const ALL: [StateType; 3] = [StateType::Backend, StateType::Route, StateType::Config];

    pub fn as_str(&self) -> &'static str {
        match self {
            StateType::Backend => "backend",
            StateType::Route => "route",
            StateType::Config => "config",
        }
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backend" => Ok(StateType::Backend),
            "route" => Ok(StateType::Route),
            "config" => Ok(StateType::Config),
            other => Err(format!("unknown state type: {other}")),
        }
    }
}

/// Summary of the cluster as seen from one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub enabled: bool,
    pub node_id: String,
    pub role: ClusterRole,
    pub leader_id: Option<String>,
    pub node_count: usize,
    pub healthy_nodes: usize,
}
