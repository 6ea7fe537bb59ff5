//! Store-backed cluster participant.
//!
//! Four background loops run per node once [`Cluster::start`] succeeds:
//!
//! - heartbeat: persist this node's record, announce it, refresh the
//!   local view of every node and its health.
//! - election: extend the leadership lease when held, otherwise try to
//!   take it with `SET NX`.
//! - events: consume `veloflux:events` and dispatch state changes.
//! - resync: re-read listened-to state so a lost notification is
//!   eventually delivered anyway.
//!
//! Store failures inside the loops are logged and retried on the next tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use veloflux_state::{KvStore, Subscription, json, keys};

use crate::config::ClusterConfig;
use crate::coordinator::{ClusterCoordinator, StateListener};
use crate::error::{ClusterError, ClusterResult};
use crate::event::ClusterEvent;
use crate::types::{ClusterNode, ClusterRole, ClusterStatus, StateType};

/// A node participating in a store-backed cluster.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClusterConfig,
    node_id: String,
    address: RwLock<String>,
    store: Arc<dyn KvStore>,
    leader: AtomicBool,
    /// When the lease we last wrote runs out.
    lease_deadline: Mutex<Option<Instant>>,
    nodes: RwLock<HashMap<String, ClusterNode>>,
    listeners: RwLock<HashMap<StateType, Vec<StateListener>>>,
    /// Last value handed to listeners (or written locally) per state key.
    delivered: Mutex<HashMap<(StateType, String), Vec<u8>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Cluster {
    pub fn new(config: ClusterConfig, store: Arc<dyn KvStore>) -> Self {
        let node_id = config.resolved_node_id();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                address: RwLock::new(config.node_address.clone()),
                config,
                node_id,
                store,
                leader: AtomicBool::new(false),
                lease_deadline: Mutex::new(None),
                nodes: RwLock::new(HashMap::new()),
                listeners: RwLock::new(HashMap::new()),
                delivered: Mutex::new(HashMap::new()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Signal every loop to exit and abort them.
    fn halt_tasks(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let handles: Vec<_> = self.inner.tasks.lock().expect("tasks lock").drain(..).collect();
        for handle in handles {
            handle.abort();
        }
    }

    fn spawn_loops(&self, subscription: Subscription) {
        let mut tasks = self.inner.tasks.lock().expect("tasks lock");

        let inner = self.inner.clone();
        let shutdown = self.inner.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { inner.run_heartbeat(shutdown).await }));

        let inner = self.inner.clone();
        let shutdown = self.inner.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { inner.run_election(shutdown).await }));

        let inner = self.inner.clone();
        let shutdown = self.inner.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            inner.run_events(subscription, shutdown).await
        }));

        let inner = self.inner.clone();
        let shutdown = self.inner.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move { inner.run_resync(shutdown).await }));
    }
}

#[async_trait]
impl ClusterCoordinator for Cluster {
    fn node_id(&self) -> String {
        self.inner.node_id.clone()
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn is_leader(&self) -> bool {
        self.inner.holds_lease()
    }

    async fn start(&self) -> ClusterResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(ClusterError::AlreadyStarted);
        }
        let inner = &self.inner;

        if let Err(e) = inner.store.ping().await {
            inner.started.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        let subscription = match inner.store.subscribe(keys::EVENTS_CHANNEL).await {
            Ok(s) => s,
            Err(e) => {
                inner.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        inner.write_own_record().await?;
        let address = inner.address.read().expect("address lock").clone();
        inner
            .broadcast(ClusterEvent::NodeJoin {
                node_id: inner.node_id.clone(),
                address: address.clone(),
                timestamp: Utc::now(),
            })
            .await;

        self.spawn_loops(subscription);

        info!(
            node_id = %inner.node_id,
            %address,
            heartbeat = ?inner.config.heartbeat_interval,
            leader_timeout = ?inner.config.leader_timeout,
            "cluster node started"
        );
        Ok(())
    }

    async fn stop(&self) -> ClusterResult<()> {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.inner.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.halt_tasks();

        let inner = &self.inner;
        let node_id = inner.node_id.as_str();

        if inner.leader.swap(false, Ordering::SeqCst) {
            match inner.store.del_if_eq(keys::LEADER, node_id.as_bytes()).await {
                Ok(true) => info!(%node_id, "leadership released"),
                Ok(false) => debug!(%node_id, "leadership already gone"),
                Err(e) => warn!(%node_id, error = %e, "failed to release leadership"),
            }
        }
        if let Err(e) = inner.store.hdel(keys::NODES, node_id).await {
            warn!(%node_id, error = %e, "failed to remove node record");
        }
        inner
            .broadcast(ClusterEvent::NodeLeave {
                node_id: node_id.to_string(),
                timestamp: Utc::now(),
            })
            .await;

        info!(%node_id, "cluster node stopped");
        Ok(())
    }

    async fn publish_state(
        &self,
        state_type: StateType,
        key: &str,
        value: &[u8],
    ) -> ClusterResult<()> {
        let inner = &self.inner;
        inner
            .store
            .hset(&keys::state_hash(state_type.as_str()), key, value)
            .await?;
        inner.remember(state_type, key, value);

        let event = ClusterEvent::StateChange {
            node_id: inner.node_id.clone(),
            timestamp: Utc::now(),
            state_type,
            key: key.to_string(),
        };
        inner
            .store
            .publish(keys::EVENTS_CHANNEL, &event.encode()?)
            .await?;
        debug!(%state_type, %key, "state published");
        Ok(())
    }

    async fn get_state(&self, state_type: StateType, key: &str) -> ClusterResult<Vec<u8>> {
        self.inner
            .store
            .hget(&keys::state_hash(state_type.as_str()), key)
            .await?
            .ok_or_else(|| ClusterError::StateNotFound {
                state_type: state_type.to_string(),
                key: key.to_string(),
            })
    }

    async fn get_all_state(&self, state_type: StateType) -> ClusterResult<HashMap<String, Vec<u8>>> {
        Ok(self
            .inner
            .store
            .hgetall(&keys::state_hash(state_type.as_str()))
            .await?)
    }

    fn nodes(&self) -> Vec<ClusterNode> {
        let mut nodes: Vec<ClusterNode> = self
            .inner
            .nodes
            .read()
            .expect("nodes lock")
            .values()
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    async fn status(&self) -> ClusterResult<ClusterStatus> {
        let leader_id = self
            .inner
            .store
            .get(keys::LEADER)
            .await?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned());
        let nodes = self.nodes();
        Ok(ClusterStatus {
            enabled: true,
            node_id: self.inner.node_id.clone(),
            role: self.inner.role(),
            leader_id,
            node_count: nodes.len(),
            healthy_nodes: nodes.iter().filter(|n| n.is_healthy).count(),
        })
    }

    fn register_state_listener(&self, state_type: StateType, listener: StateListener) {
        self.inner
            .listeners
            .write()
            .expect("listeners lock")
            .entry(state_type)
            .or_default()
            .push(listener);
        debug!(%state_type, "state listener registered");
    }

    fn set_node_address(&self, address: &str) {
        *self.inner.address.write().expect("address lock") = address.to_string();
    }
}

impl Inner {
    fn role(&self) -> ClusterRole {
        if self.holds_lease() {
            ClusterRole::Leader
        } else {
            ClusterRole::Follower
        }
    }

    fn holds_lease(&self) -> bool {
        if !self.leader.load(Ordering::SeqCst) {
            return false;
        }
        self.lease_deadline
            .lock()
            .expect("lease lock")
            .is_some_and(|deadline| deadline > Instant::now())
    }

    fn own_record(&self) -> ClusterNode {
        ClusterNode {
            id: self.node_id.clone(),
            address: self.address.read().expect("address lock").clone(),
            role: self.role(),
            last_seen: Utc::now(),
            is_healthy: true,
        }
    }

    async fn write_own_record(&self) -> ClusterResult<()> {
        let node = self.own_record();
        self.store
            .hset(keys::NODES, &self.node_id, &json::encode(&node)?)
            .await?;
        self.nodes
            .write()
            .expect("nodes lock")
            .insert(node.id.clone(), node);
        Ok(())
    }

    /// Publish an event, logging rather than failing.
    async fn broadcast(&self, event: ClusterEvent) {
        let payload = match event.encode() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to encode cluster event");
                return;
            }
        };
        if let Err(e) = self.store.publish(keys::EVENTS_CHANNEL, &payload).await {
            warn!(node_id = %self.node_id, error = %e, "failed to publish cluster event");
        }
    }

    fn remember(&self, state_type: StateType, key: &str, value: &[u8]) {
        self.delivered
            .lock()
            .expect("delivered lock")
            .insert((state_type, key.to_string()), value.to_vec());
    }

    // ── Heartbeat ──────────────────────────────────────────────

    async fn run_heartbeat(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {
                    self.heartbeat_once().await;
                }
                _ = shutdown.changed() => {
                    debug!(node_id = %self.node_id, "heartbeat loop shutting down");
                    break;
                }
            }
        }
    }

    async fn heartbeat_once(&self) {
        if let Err(e) = self.write_own_record().await {
            warn!(node_id = %self.node_id, error = %e, "heartbeat write failed");
        }
        self.broadcast(ClusterEvent::Heartbeat {
            node_id: self.node_id.clone(),
            timestamp: Utc::now(),
        })
        .await;
        if let Err(e) = self.refresh_nodes().await {
            warn!(node_id = %self.node_id, error = %e, "failed to refresh node list");
        }
    }

    /// Reload every node record and recompute health.
    async fn refresh_nodes(&self) -> ClusterResult<()> {
        let raw = self.store.hgetall(keys::NODES).await?;
        let now = Utc::now();
        let timeout = self.config.leader_timeout;

        let mut fresh = HashMap::with_capacity(raw.len());
        for (id, bytes) in raw {
            let mut node: ClusterNode = match json::decode(&bytes) {
                Ok(n) => n,
                Err(e) => {
                    warn!(node = %id, error = %e, "skipping undecodable node record");
                    continue;
                }
            };
            let healthy = node.seen_within(now, timeout);
            if node.is_healthy && !healthy {
                warn!(node = %id, last_seen = %node.last_seen, "node marked unhealthy");
            }
            node.is_healthy = healthy;
            fresh.insert(id, node);
        }
        *self.nodes.write().expect("nodes lock") = fresh;
        Ok(())
    }

    // ── Leader election ────────────────────────────────────────

    async fn run_election(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {
                    self.election_once().await;
                }
                _ = shutdown.changed() => {
                    debug!(node_id = %self.node_id, "election loop shutting down");
                    break;
                }
            }
        }
    }

    async fn election_once(&self) {
        let node_id = self.node_id.as_str();
        let ttl = self.config.lease_ttl();

        // Taken before the store call so the local deadline never outlives
        // the store-side TTL.
        let issued = Instant::now();

        if self.leader.load(Ordering::SeqCst) {
            match self.store.expire_if_eq(keys::LEADER, node_id.as_bytes(), ttl).await {
                Ok(true) => self.extend_lease(issued),
                Ok(false) => self.demote("leadership lease lost"),
                Err(e) => {
                    warn!(%node_id, error = %e, "failed to refresh leadership lease");
                    if !self.holds_lease() {
                        self.demote("leadership lease expired while store unreachable");
                    }
                }
            }
            return;
        }

        match self.store.get(keys::LEADER).await {
            Ok(Some(holder)) => {
                let holder = String::from_utf8_lossy(&holder).into_owned();
                if holder == node_id {
                    // Our own lease survived a demotion; take it back.
                    if let Ok(true) = self.store.expire_if_eq(keys::LEADER, node_id.as_bytes(), ttl).await {
                        self.promote(issued).await;
                    }
                    return;
                }
                let healthy = self
                    .nodes
                    .read()
                    .expect("nodes lock")
                    .get(&holder)
                    .is_some_and(|n| n.is_healthy);
                if healthy {
                    return;
                }
                debug!(%node_id, leader = %holder, "leader unhealthy, waiting for its lease to lapse");
            }
            Ok(None) => {}
            Err(e) => {
                warn!(%node_id, error = %e, "failed to read leadership key");
                return;
            }
        }

        match self.store.set_nx(keys::LEADER, node_id.as_bytes(), ttl).await {
            Ok(true) => self.promote(issued).await,
            Ok(false) => debug!(%node_id, "lost leadership race"),
            Err(e) => warn!(%node_id, error = %e, "leadership attempt failed"),
        }
    }

    fn extend_lease(&self, issued: Instant) {
        *self.lease_deadline.lock().expect("lease lock") = Some(issued + self.config.lease_ttl());
    }

    async fn promote(&self, issued: Instant) {
        self.extend_lease(issued);
        self.leader.store(true, Ordering::SeqCst);
        info!(node_id = %self.node_id, "elected cluster leader");

        if let Err(e) = self.write_own_record().await {
            warn!(node_id = %self.node_id, error = %e, "failed to record leader role");
        }
        self.broadcast(ClusterEvent::LeaderElected {
            node_id: self.node_id.clone(),
            timestamp: Utc::now(),
        })
        .await;
    }

    fn demote(&self, reason: &str) {
        if self.leader.swap(false, Ordering::SeqCst) {
            *self.lease_deadline.lock().expect("lease lock") = None;
            warn!(node_id = %self.node_id, %reason, "stepped down as leader");
        }
    }

    // ── Events ─────────────────────────────────────────────────

    async fn run_events(&self, subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        let mut subscription = Some(subscription);
        loop {
            let Some(sub) = subscription.as_mut() else {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.heartbeat_interval) => {
                        match self.store.subscribe(keys::EVENTS_CHANNEL).await {
                            Ok(s) => {
                                info!(node_id = %self.node_id, "event subscription restored");
                                subscription = Some(s);
                            }
                            Err(e) => warn!(node_id = %self.node_id, error = %e, "resubscribe failed"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
                continue;
            };

            let received = tokio::select! {
                msg = sub.next() => Some(msg),
                _ = shutdown.changed() => None,
            };
            match received {
                None => break,
                Some(Some(bytes)) => self.handle_event(&bytes).await,
                Some(None) => {
                    warn!(node_id = %self.node_id, "event subscription closed");
                    subscription = None;
                }
            }
        }
        debug!(node_id = %self.node_id, "event loop shutting down");
    }

    async fn handle_event(&self, bytes: &[u8]) {
        let event = match ClusterEvent::decode(bytes) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "dropping cluster event");
                return;
            }
        };
        if event.node_id() == self.node_id {
            return;
        }

        match event {
            ClusterEvent::Heartbeat { node_id, timestamp } => {
                if let Some(node) = self.nodes.write().expect("nodes lock").get_mut(&node_id) {
                    node.last_seen = timestamp;
                    node.is_healthy = true;
                }
            }
            ClusterEvent::NodeJoin { node_id, address, timestamp } => {
                info!(%node_id, %address, "node joined cluster");
                self.nodes.write().expect("nodes lock").insert(
                    node_id.clone(),
                    ClusterNode {
                        id: node_id,
                        address,
                        role: ClusterRole::Follower,
                        last_seen: timestamp,
                        is_healthy: true,
                    },
                );
            }
            ClusterEvent::NodeLeave { node_id, .. } => {
                info!(%node_id, "node left cluster");
                self.nodes.write().expect("nodes lock").remove(&node_id);
            }
            ClusterEvent::LeaderElected { node_id, .. } => {
                info!(leader = %node_id, "new cluster leader");
                self.demote("another node was elected");
                for node in self.nodes.write().expect("nodes lock").values_mut() {
                    node.role = if node.id == node_id {
                        ClusterRole::Leader
                    } else {
                        ClusterRole::Follower
                    };
                }
            }
            ClusterEvent::StateChange { state_type, key, .. } => {
                self.on_state_change(state_type, key).await;
            }
        }
    }

    fn listeners_for(&self, state_type: StateType) -> Vec<StateListener> {
        self.listeners
            .read()
            .expect("listeners lock")
            .get(&state_type)
            .cloned()
            .unwrap_or_default()
    }

    async fn on_state_change(&self, state_type: StateType, key: String) {
        let listeners = self.listeners_for(state_type);
        if listeners.is_empty() {
            return;
        }
        let value = match self
            .store
            .hget(&keys::state_hash(state_type.as_str()), &key)
            .await
        {
            Ok(Some(v)) => v,
            Ok(None) => {
                debug!(%state_type, %key, "state removed before it could be read");
                return;
            }
            Err(e) => {
                warn!(%state_type, %key, error = %e, "failed to fetch changed state");
                return;
            }
        };
        self.remember(state_type, &key, &value);
        dispatch(&listeners, state_type, &key, &value);
    }

    // ── Resync ─────────────────────────────────────────────────

    async fn run_resync(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.resync_interval) => {
                    self.resync_once().await;
                }
                _ = shutdown.changed() => {
                    debug!(node_id = %self.node_id, "resync loop shutting down");
                    break;
                }
            }
        }
    }

    /// Deliver any listened-to state whose value differs from what listeners
    /// last saw. The first pass delivers the full snapshot.
    async fn resync_once(&self) {
        let types: Vec<StateType> = self
            .listeners
            .read()
            .expect("listeners lock")
            .keys()
            .copied()
            .collect();

        for state_type in types {
            let all = match self.store.hgetall(&keys::state_hash(state_type.as_str())).await {
                Ok(all) => all,
                Err(e) => {
                    warn!(%state_type, error = %e, "state resync failed");
                    continue;
                }
            };
            let listeners = self.listeners_for(state_type);
            let mut redelivered = 0usize;
            for (key, value) in all {
                let stale = {
                    let delivered = self.delivered.lock().expect("delivered lock");
                    delivered.get(&(state_type, key.clone())) != Some(&value)
                };
                if stale {
                    self.remember(state_type, &key, &value);
                    dispatch(&listeners, state_type, &key, &value);
                    redelivered += 1;
                }
            }
            if redelivered > 0 {
                info!(%state_type, redelivered, "state resynchronised");
            }
        }
    }
}

/// Invoke every listener on its own task.
fn dispatch(listeners: &[StateListener], state_type: StateType, key: &str, value: &[u8]) {
    for listener in listeners {
        tokio::spawn(listener(state_type, key.to_string(), value.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use veloflux_state::InMemoryStore;

    fn fast_config(node_id: &str) -> ClusterConfig {
        ClusterConfig::enabled()
            .with_node_id(node_id)
            .with_node_address(format!("{node_id}.local:9000"))
            .with_heartbeat_interval(Duration::from_millis(20))
            .with_leader_timeout(Duration::from_millis(100))
            .with_resync_interval(Duration::from_secs(3600))
    }

    async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    fn channel_listener(tx: mpsc::UnboundedSender<(StateType, String, Vec<u8>)>) -> StateListener {
        Arc::new(move |t, k, v| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send((t, k, v));
            })
        })
    }

    #[tokio::test]
    async fn start_registers_node() {
        let store = Arc::new(InMemoryStore::new());
        let cluster = Cluster::new(fast_config("n1"), store.clone());
        cluster.start().await.unwrap();

        let record = store.hget(keys::NODES, "n1").await.unwrap();
        assert!(record.is_some());
        assert_eq!(cluster.nodes().len(), 1);
        assert_eq!(cluster.nodes()[0].address, "n1.local:9000");

        assert!(matches!(cluster.start().await, Err(ClusterError::AlreadyStarted)));
        cluster.stop().await.unwrap();
    }

    #[tokio::test]
    async fn single_node_elects_itself() {
        let store = Arc::new(InMemoryStore::new());
        let cluster = Cluster::new(fast_config("n1"), store.clone());
        cluster.start().await.unwrap();

        assert!(wait_until(Duration::from_secs(1), || cluster.is_leader()).await);
        assert_eq!(store.get(keys::LEADER).await.unwrap(), Some(b"n1".to_vec()));

        let status = cluster.status().await.unwrap();
        assert_eq!(status.role, ClusterRole::Leader);
        assert_eq!(status.leader_id.as_deref(), Some("n1"));
        cluster.stop().await.unwrap();
    }

    #[tokio::test]
    async fn at_most_one_leader() {
        let store = Arc::new(InMemoryStore::new());
        let nodes: Vec<Cluster> = ["n1", "n2", "n3"]
            .iter()
            .map(|id| Cluster::new(fast_config(id), store.clone()))
            .collect();
        for n in &nodes {
            n.start().await.unwrap();
        }

        assert!(wait_until(Duration::from_secs(1), || nodes.iter().any(|n| n.is_leader())).await);
        for _ in 0..20 {
            let leaders: Vec<String> = nodes
                .iter()
                .filter(|n| n.is_leader())
                .map(|n| n.node_id())
                .collect();
            assert!(leaders.len() <= 1, "multiple leaders: {leaders:?}");
            if let Some(leader) = leaders.first() {
                let key = store.get(keys::LEADER).await.unwrap();
                assert_eq!(key.as_deref(), Some(leader.as_bytes()));
            }
            tokio::time::sleep(Duration::from_millis(15)).await;
        }

        assert!(wait_until(Duration::from_secs(1), || nodes[0].nodes().len() == 3).await);
        for n in &nodes {
            n.stop().await.unwrap();
        }
    }

    #[tokio::test]
    async fn graceful_leader_stop_hands_over() {
        let store = Arc::new(InMemoryStore::new());
        let a = Cluster::new(fast_config("a"), store.clone());
        let b = Cluster::new(fast_config("b"), store.clone());
        a.start().await.unwrap();
        b.start().await.unwrap();

        assert!(wait_until(Duration::from_secs(1), || a.is_leader() || b.is_leader()).await);
        let (leader, follower) = if a.is_leader() { (a, b) } else { (b, a) };

        leader.stop().await.unwrap();
        assert!(wait_until(Duration::from_millis(400), || follower.is_leader()).await);
        follower.stop().await.unwrap();
    }

    #[tokio::test]
    async fn crashed_leader_is_replaced_after_lease_expiry() {
        let store = Arc::new(InMemoryStore::new());
        let a = Cluster::new(fast_config("a"), store.clone());
        let b = Cluster::new(fast_config("b"), store.clone());
        a.start().await.unwrap();
        b.start().await.unwrap();

        assert!(wait_until(Duration::from_secs(1), || a.is_leader() || b.is_leader()).await);
        let (leader, follower) = if a.is_leader() { (a, b) } else { (b, a) };

        // No lease release, no leave event.
        leader.halt_tasks();

        let bound = leader.inner.config.lease_ttl() + Duration::from_millis(300);
        assert!(wait_until(bound, || follower.is_leader()).await);
        assert!(!leader.is_leader());
        follower.stop().await.unwrap();
    }

    #[tokio::test]
    async fn leader_steps_down_when_lease_taken() {
        let store = Arc::new(InMemoryStore::new());
        let cluster = Cluster::new(fast_config("n1"), store.clone());
        cluster.start().await.unwrap();
        assert!(wait_until(Duration::from_secs(1), || cluster.is_leader()).await);

        store
            .set(keys::LEADER, b"intruder", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(wait_until(Duration::from_secs(1), || !cluster.is_leader()).await);
        cluster.stop().await.unwrap();
    }

    #[tokio::test]
    async fn published_state_is_readable_everywhere() {
        let store = Arc::new(InMemoryStore::new());
        let a = Cluster::new(fast_config("a"), store.clone());
        let b = Cluster::new(fast_config("b"), store.clone());
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.publish_state(StateType::Backend, "pool/10.0.0.1:80", b"v1").await.unwrap();
        assert_eq!(b.get_state(StateType::Backend, "pool/10.0.0.1:80").await.unwrap(), b"v1");

        a.publish_state(StateType::Backend, "pool/10.0.0.1:80", b"v2").await.unwrap();
        assert_eq!(b.get_state(StateType::Backend, "pool/10.0.0.1:80").await.unwrap(), b"v2");

        let all = b.get_all_state(StateType::Backend).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(matches!(
            b.get_state(StateType::Route, "missing").await,
            Err(ClusterError::StateNotFound { .. })
        ));

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn remote_change_reaches_listener() {
        let store = Arc::new(InMemoryStore::new());
        let a = Cluster::new(fast_config("a"), store.clone());
        let b = Cluster::new(fast_config("b"), store.clone());
        a.start().await.unwrap();
        b.start().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.register_state_listener(StateType::Route, channel_listener(tx));

        a.publish_state(StateType::Route, "api.example.com", b"{\"pool\":\"p1\"}").await.unwrap();

        let (t, k, v) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t, StateType::Route);
        assert_eq!(k, "api.example.com");
        assert_eq!(v, b"{\"pool\":\"p1\"}");

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn own_changes_do_not_reach_local_listeners() {
        let store = Arc::new(InMemoryStore::new());
        let a = Cluster::new(fast_config("a"), store.clone());
        a.start().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        a.register_state_listener(StateType::Config, channel_listener(tx));
        a.publish_state(StateType::Config, "k", b"v").await.unwrap();

        let got = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(got.is_err());
        a.stop().await.unwrap();
    }

    #[tokio::test]
    async fn resync_delivers_unannounced_writes() {
        let store = Arc::new(InMemoryStore::new());
        let config = fast_config("b").with_resync_interval(Duration::from_millis(30));
        let b = Cluster::new(config, store.clone());
        b.start().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.register_state_listener(StateType::Backend, channel_listener(tx));

        // Written without a state_change event, as after a crash mid-publish.
        store
            .hset(&keys::state_hash("backend"), "pool/x", b"orphan")
            .await
            .unwrap();

        let (_, k, v) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(k, "pool/x");
        assert_eq!(v, b"orphan");

        // Unchanged value is not delivered again.
        let again = tokio::time::timeout(Duration::from_millis(120), rx.recv()).await;
        assert!(again.is_err());
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_leaves() {
        let store = Arc::new(InMemoryStore::new());
        let a = Cluster::new(fast_config("a"), store.clone());
        a.start().await.unwrap();
        assert!(wait_until(Duration::from_secs(1), || a.is_leader()).await);

        a.stop().await.unwrap();
        a.stop().await.unwrap();

        assert!(!a.is_leader());
        assert!(store.hget(keys::NODES, "a").await.unwrap().is_none());
        assert!(store.get(keys::LEADER).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn departed_node_disappears_from_peers() {
        let store = Arc::new(InMemoryStore::new());
        let a = Cluster::new(fast_config("a"), store.clone());
        let b = Cluster::new(fast_config("b"), store.clone());
        a.start().await.unwrap();
        b.start().await.unwrap();
        assert!(wait_until(Duration::from_secs(1), || a.nodes().len() == 2).await);

        b.stop().await.unwrap();
        assert!(wait_until(Duration::from_secs(1), || a.nodes().len() == 1).await);
        a.stop().await.unwrap();
    }
}
