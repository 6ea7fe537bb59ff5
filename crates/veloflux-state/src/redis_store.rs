//! Redis-backed `KvStore`.
//!
//! Commands go through a `ConnectionManager`, which reconnects on its own
//! after the server drops. Every subscription opens a dedicated pub/sub
//! connection whose messages are forwarded into a [`Subscription`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::store::{KvStore, Subscription};

const CHANNEL_CAPACITY: usize = 1024;

/// Extend the TTL only when the key still holds the caller's value.
const EXPIRE_IF_EQ: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

/// Delete the key only when it still holds the caller's value.
const DEL_IF_EQ: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

fn store_err(e: RedisError) -> StateError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        StateError::Connection(e.to_string())
    } else {
        StateError::Command(e.to_string())
    }
}

fn millis(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}

/// Shared store backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> StateResult<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(store_err)?;
        info!(%url, "connected to redis");
        Ok(Self { client, conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn ping(&self) -> StateResult<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        let mut conn = self.conn();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(store_err)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StateResult<()> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(store_err)?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> StateResult<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(reply.is_some())
    }

    async fn expire_if_eq(&self, key: &str, expected: &[u8], ttl: Duration) -> StateResult<bool> {
        let mut conn = self.conn();
        let extended: i64 = Script::new(EXPIRE_IF_EQ)
            .key(key)
            .arg(expected)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(extended == 1)
    }

    async fn del_if_eq(&self, key: &str, expected: &[u8]) -> StateResult<bool> {
        let mut conn = self.conn();
        let deleted: i64 = Script::new(DEL_IF_EQ)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(deleted == 1)
    }

    async fn del(&self, key: &str) -> StateResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.del(key).await.map_err(store_err)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> StateResult<bool> {
        let mut conn = self.conn();
        let exists: bool = conn.exists(key).await.map_err(store_err)?;
        Ok(exists)
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> StateResult<()> {
        let mut conn = self.conn();
        let _: i64 = conn.hset(key, field, value).await.map_err(store_err)?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StateResult<Option<Vec<u8>>> {
        let mut conn = self.conn();
        let value: Option<Vec<u8>> = conn.hget(key, field).await.map_err(store_err)?;
        Ok(value)
    }

    async fn hgetall(&self, key: &str) -> StateResult<HashMap<String, Vec<u8>>> {
        let mut conn = self.conn();
        let all: HashMap<String, Vec<u8>> = conn.hgetall(key).await.map_err(store_err)?;
        Ok(all)
    }

    async fn hdel(&self, key: &str, field: &str) -> StateResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.hdel(key, field).await.map_err(store_err)?;
        Ok(removed > 0)
    }

    async fn keys(&self, prefix: &str) -> StateResult<Vec<String>> {
        let mut conn = self.conn();
        let mut keys: Vec<String> = conn.keys(format!("{prefix}*")).await.map_err(store_err)?;
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> StateResult<usize> {
        let mut conn = self.conn();
        let receivers: i64 = conn.publish(channel, payload).await.map_err(store_err)?;
        Ok(receivers.max(0) as usize)
    }

    async fn subscribe(&self, channel: &str) -> StateResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(store_err)?;
        pubsub.subscribe(channel).await.map_err(store_err)?;
        debug!(%channel, "subscribed");

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let channel = channel.to_string();
        let forwarder = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(%channel, error = %e, "undecodable pub/sub payload");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            debug!(%channel, "subscription ended");
        });

        Ok(Subscription::new(rx, forwarder))
    }
}
