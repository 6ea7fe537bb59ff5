//! veloflux-cluster: membership, leader election and replicated state.
//!
//! Each VeloFlux process registers itself in the shared store, heartbeats,
//! and competes for a single leadership lease. State that must be
//! identical on every node (backends, routes, config) is written through
//! [`ClusterCoordinator::publish_state`]; other nodes are told which key
//! changed and re-read the value from the store.
//!
//! # Architecture
//!
//! ```text
//!              ┌──────────── Cluster ────────────┐
//!              │ heartbeat loop   election loop  │
//!   store ◄────┤ event loop       resync loop    ├────► state listeners
//!              └─────────────────────────────────┘
//!                      ▲ veloflux:events (pub/sub)
//! ```
//!
//! When clustering is disabled, [`coordinator`] hands out a
//! [`NoopCoordinator`] so callers never branch on single-node vs
//! clustered deployments.

pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod types;

pub use cluster::Cluster;
pub use config::ClusterConfig;
pub use coordinator::{ClusterCoordinator, NoopCoordinator, StateListener, coordinator};
pub use error::{ClusterError, ClusterResult};
pub use event::ClusterEvent;
pub use types::{ClusterNode, ClusterRole, ClusterStatus, StateType};
