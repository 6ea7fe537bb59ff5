//! veloflux-state: shared key/value store for the VeloFlux control plane.
//!
//! Every node of a VeloFlux deployment talks to the same Redis-like store.
//! Cluster membership, leadership, replicated state and tenant
//! orchestration records all live there, and cluster events travel over
//! its pub/sub channel.
//!
//! # Architecture
//!
//! ```text
//!   veloflux-cluster ─┐
//!                     ├──► Arc<dyn KvStore> ──┬──► RedisStore    (production)
//!   veloflux-orch ────┘                       └──► InMemoryStore (tests, dev)
//! ```
//!
//! Values are opaque bytes. Callers that store typed records use the
//! JSON helpers in [`json`]. Key and channel names are centralised in
//! [`keys`].

pub mod error;
pub mod json;
pub mod keys;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use error::{StateError, StateResult};
pub use memory::InMemoryStore;
pub use redis_store::RedisStore;
pub use store::{KvStore, Subscription};
