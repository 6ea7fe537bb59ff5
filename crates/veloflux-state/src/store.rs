//! The `KvStore` capability consumed by the cluster and orchestrator.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::StateResult;

/// Redis-like key/value store with hashes, TTLs and pub/sub.
///
/// Every operation is a single atomic store command. Nothing here
/// composes multiple commands into a transaction.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Round-trip to the store; used to fail fast at startup.
    async fn ping(&self) -> StateResult<()>;

    async fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>>;

    /// Set a string key, optionally with a TTL.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StateResult<()>;

    /// Set only if absent. Returns `true` when this call created the key.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> StateResult<bool>;

    /// Extend the TTL of `key` only if it currently holds `expected`.
    async fn expire_if_eq(&self, key: &str, expected: &[u8], ttl: Duration) -> StateResult<bool>;

    /// Delete `key` only if it currently holds `expected`.
    async fn del_if_eq(&self, key: &str, expected: &[u8]) -> StateResult<bool>;

    /// Delete a key of any kind. Returns whether it existed.
    async fn del(&self, key: &str) -> StateResult<bool>;

    async fn exists(&self, key: &str) -> StateResult<bool>;

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> StateResult<()>;

    async fn hget(&self, key: &str, field: &str) -> StateResult<Option<Vec<u8>>>;

    async fn hgetall(&self, key: &str) -> StateResult<HashMap<String, Vec<u8>>>;

    async fn hdel(&self, key: &str, field: &str) -> StateResult<bool>;

    /// All keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> StateResult<Vec<String>>;

    /// Publish a message. Returns the number of receivers reached.
    async fn publish(&self, channel: &str, payload: &[u8]) -> StateResult<usize>;

    async fn subscribe(&self, channel: &str) -> StateResult<Subscription>;
}

/// A live channel subscription.
///
/// Messages are forwarded by a background task which is aborted when the
/// subscription is dropped or closed.
pub struct Subscription {
    rx: mpsc::Receiver<Vec<u8>>,
    forwarder: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<Vec<u8>>, forwarder: JoinHandle<()>) -> Self {
        Self { rx, forwarder }
    }

    /// Wait for the next message. `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Stop receiving.
    pub fn close(&mut self) {
        self.forwarder.abort();
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}
