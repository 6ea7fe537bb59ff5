//! In-process `KvStore` used by tests and single-binary dev runs.
//!
//! Expiry is measured on the tokio clock, so tests can drive it with
//! `tokio::time::pause`/`advance`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::debug;

use crate::error::StateResult;
use crate::store::{KvStore, Subscription};

const CHANNEL_CAPACITY: usize = 1024;

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, Entry>,
    hashes: HashMap<String, HashMap<String, Vec<u8>>>,
    channels: HashMap<String, broadcast::Sender<Vec<u8>>>,
}

impl Inner {
    /// Fetch a live string entry, dropping it if it has expired.
    fn live_entry(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.strings.get(key).is_some_and(|e| !e.live(now)) {
            self.strings.remove(key);
        }
        self.strings.get_mut(key)
    }
}

/// Shared in-memory store. Clones share the same data.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store lock")
    }
}

fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|d| Instant::now() + d)
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn ping(&self) -> StateResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        Ok(self.lock().live_entry(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StateResult<()> {
        self.lock().strings.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: deadline(ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> StateResult<bool> {
        let mut inner = self.lock();
        if inner.live_entry(key).is_some() {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: deadline(Some(ttl)),
            },
        );
        Ok(true)
    }

    async fn expire_if_eq(&self, key: &str, expected: &[u8], ttl: Duration) -> StateResult<bool> {
        let mut inner = self.lock();
        match inner.live_entry(key) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = deadline(Some(ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn del_if_eq(&self, key: &str, expected: &[u8]) -> StateResult<bool> {
        let mut inner = self.lock();
        let owned = inner.live_entry(key).is_some_and(|e| e.value == expected);
        if owned {
            inner.strings.remove(key);
        }
        Ok(owned)
    }

    async fn del(&self, key: &str) -> StateResult<bool> {
        let mut inner = self.lock();
        let was_string = inner.live_entry(key).is_some();
        inner.strings.remove(key);
        let was_hash = inner.hashes.remove(key).is_some();
        Ok(was_string || was_hash)
    }

    async fn exists(&self, key: &str) -> StateResult<bool> {
        let mut inner = self.lock();
        Ok(inner.live_entry(key).is_some() || inner.hashes.contains_key(key))
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> StateResult<()> {
        self.lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_vec());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StateResult<Option<Vec<u8>>> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hgetall(&self, key: &str) -> StateResult<HashMap<String, Vec<u8>>> {
        Ok(self.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> StateResult<bool> {
        let mut inner = self.lock();
        let Some(hash) = inner.hashes.get_mut(key) else {
            return Ok(false);
        };
        let removed = hash.remove(field).is_some();
        if hash.is_empty() {
            inner.hashes.remove(key);
        }
        Ok(removed)
    }

    async fn keys(&self, prefix: &str) -> StateResult<Vec<String>> {
        let inner = self.lock();
        let now = Instant::now();
        let mut keys: Vec<String> = inner
            .strings
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.live(now))
            .map(|(k, _)| k.clone())
            .chain(inner.hashes.keys().filter(|k| k.starts_with(prefix)).cloned())
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> StateResult<usize> {
        let inner = self.lock();
        let delivered = inner
            .channels
            .get(channel)
            .and_then(|tx| tx.send(payload.to_vec()).ok())
            .unwrap_or(0);
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> StateResult<Subscription> {
        let mut source = {
            let mut inner = self.lock();
            inner
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let channel = channel.to_string();
        let forwarder = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(%channel, skipped, "subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(rx, forwarder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_del() {
        let store = InMemoryStore::new();
        store.set("k", b"v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(store.exists("k").await.unwrap());

        assert!(store.del("k").await.unwrap());
        assert!(!store.del("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_keys() {
        let store = InMemoryStore::new();
        store
            .set("lease", b"n1", Some(Duration::from_secs(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.exists("lease").await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!store.exists("lease").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn set_nx_single_winner_until_expiry() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(30);

        assert!(store.set_nx("leader", b"a", ttl).await.unwrap());
        assert!(!store.set_nx("leader", b"b", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.set_nx("leader", b"b", ttl).await.unwrap());
        assert_eq!(store.get("leader").await.unwrap(), Some(b"b".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn expire_if_eq_only_extends_owned_key() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(10);
        store.set_nx("leader", b"a", ttl).await.unwrap();

        assert!(!store.expire_if_eq("leader", b"b", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.expire_if_eq("leader", b"a", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.exists("leader").await.unwrap());
    }

    #[tokio::test]
    async fn del_if_eq_respects_owner() {
        let store = InMemoryStore::new();
        store.set("leader", b"a", None).await.unwrap();

        assert!(!store.del_if_eq("leader", b"b").await.unwrap());
        assert!(store.del_if_eq("leader", b"a").await.unwrap());
        assert!(!store.exists("leader").await.unwrap());
    }

    #[tokio::test]
    async fn hash_operations() {
        let store = InMemoryStore::new();
        store.hset("h", "a", b"1").await.unwrap();
        store.hset("h", "b", b"2").await.unwrap();

        assert_eq!(store.hget("h", "a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.hgetall("h").await.unwrap().len(), 2);

        assert!(store.hdel("h", "a").await.unwrap());
        assert!(!store.hdel("h", "a").await.unwrap());
        assert!(store.hdel("h", "b").await.unwrap());
        assert!(!store.exists("h").await.unwrap());
    }

    #[tokio::test]
    async fn keys_by_prefix() {
        let store = InMemoryStore::new();
        store.set("vf:tenant:a", b"{}", None).await.unwrap();
        store.set("vf:tenant:b", b"{}", None).await.unwrap();
        store.hset("veloflux:nodes", "n1", b"{}").await.unwrap();

        let keys = store.keys("vf:tenant:").await.unwrap();
        assert_eq!(keys, vec!["vf:tenant:a".to_string(), "vf:tenant:b".to_string()]);
    }

    #[tokio::test]
    async fn pubsub_delivers_to_every_subscriber() {
        let store = InMemoryStore::new();
        let mut s1 = store.subscribe("events").await.unwrap();
        let mut s2 = store.subscribe("events").await.unwrap();

        let reached = store.publish("events", b"hello").await.unwrap();
        assert_eq!(reached, 2);

        assert_eq!(s1.next().await, Some(b"hello".to_vec()));
        assert_eq!(s2.next().await, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn publish_without_subscribers_reaches_nobody() {
        let store = InMemoryStore::new();
        assert_eq!(store.publish("quiet", b"x").await.unwrap(), 0);
    }
}
