//! Cluster events and their wire encoding.
//!
//! On the wire an event is JSON `{type, timestamp, node_id, payload}`.
//! Consumers only ever see the decoded [`ClusterEvent`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{ClusterError, ClusterResult};
use crate::types::StateType;

#[derive(Debug, Clone, PartialEq)]
pub enum ClusterEvent {
    Heartbeat { node_id: String, timestamp: DateTime<Utc> },
    NodeJoin { node_id: String, address: String, timestamp: DateTime<Utc> },
    NodeLeave { node_id: String, timestamp: DateTime<Utc> },
    LeaderElected { node_id: String, timestamp: DateTime<Utc> },
    StateChange {
        node_id: String,
        timestamp: DateTime<Utc>,
        state_type: StateType,
        key: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    timestamp: DateTime<Utc>,
    node_id: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateChangePayload {
    state_type: StateType,
    key: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeJoinPayload {
    #[serde(default)]
    address: String,
}

impl ClusterEvent {
    /// The node that emitted the event.
    pub fn node_id(&self) -> &str {
        match self {
            ClusterEvent::Heartbeat { node_id, .. }
            | ClusterEvent::NodeJoin { node_id, .. }
            | ClusterEvent::NodeLeave { node_id, .. }
            | ClusterEvent::LeaderElected { node_id, .. }
            | ClusterEvent::StateChange { node_id, .. } => node_id,
        }
    }

    pub fn encode(&self) -> ClusterResult<Vec<u8>> {
        let (kind, node_id, timestamp, payload) = match self {
            ClusterEvent::Heartbeat { node_id, timestamp } => {
                ("heartbeat", node_id, timestamp, Value::Null)
            }
            ClusterEvent::NodeJoin { node_id, address, timestamp } => {
                ("node_join", node_id, timestamp, json!({ "address": address }))
            }
            ClusterEvent::NodeLeave { node_id, timestamp } => {
                ("node_leave", node_id, timestamp, Value::Null)
            }
            ClusterEvent::LeaderElected { node_id, timestamp } => {
                ("leader_elected", node_id, timestamp, Value::Null)
            }
            ClusterEvent::StateChange { node_id, timestamp, state_type, key } => (
                "state_change",
                node_id,
                timestamp,
                json!({ "state_type": state_type, "key": key }),
            ),
        };
        let wire = WireEvent {
            kind: kind.to_string(),
            timestamp: *timestamp,
            node_id: node_id.clone(),
            payload,
        };
        serde_json::to_vec(&wire).map_err(|e| ClusterError::InvalidEvent(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> ClusterResult<Self> {
        let wire: WireEvent =
            serde_json::from_slice(bytes).map_err(|e| ClusterError::InvalidEvent(e.to_string()))?;
        let WireEvent { kind, timestamp, node_id, payload } = wire;

        let event = match kind.as_str() {
            "heartbeat" => ClusterEvent::Heartbeat { node_id, timestamp },
            "node_join" => {
                let p: NodeJoinPayload = serde_json::from_value(payload)
                    .unwrap_or(NodeJoinPayload { address: String::new() });
                ClusterEvent::NodeJoin { node_id, address: p.address, timestamp }
            }
            "node_leave" => ClusterEvent::NodeLeave { node_id, timestamp },
            "leader_elected" => ClusterEvent::LeaderElected { node_id, timestamp },
            "state_change" => {
                let p: StateChangePayload = serde_json::from_value(payload)
                    .map_err(|e| ClusterError::InvalidEvent(format!("state_change payload: {e}")))?;
                ClusterEvent::StateChange {
                    node_id,
                    timestamp,
                    state_type: p.state_type,
                    key: p.key,
                }
            }
            other => {
                return Err(ClusterError::InvalidEvent(format!("unknown event type: {other}")));
            }
        };
        Ok(event)
    }
}
