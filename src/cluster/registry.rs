//! Cluster membership, heartbeats, and master election
//!
//! The registry owns every node record: it dials nodes at startup, pings
//! them on a fixed cadence, re-dials nodes that are down, elects the master
//! (lexicographically smallest connected node id), and rebuilds the hash
//! ring snapshot on any status transition. Nodes are never removed, only
//! marked `error`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use super::ring::HashRing;
use super::ClusterConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsSink;
use crate::store::{KeyValueStore, MemoryStore, RedisStore, StoreConnectionConfig};

/// Static node description from cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    /// Relative capacity; scales the node's virtual-node count
    pub weight: u32,
}

/// Connection lifecycle of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Connecting,
    Connected,
    Error,
}

struct NodeState {
    config: NodeConfig,
    status: NodeStatus,
    is_master: bool,
    last_heartbeat: Option<Instant>,
    connection: Option<Arc<dyn KeyValueStore>>,
}

/// Read-only view of a node for callers outside the registry.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub id: String,
    pub status: NodeStatus,
    pub is_master: bool,
    pub weight: u32,
}

/// Dials a store connection for a node. Production uses [`RedisConnector`];
/// tests inject stores through [`MemoryConnector`].
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, node: &NodeConfig) -> Result<Arc<dyn KeyValueStore>>;
}

/// Connects to each node over Redis.
pub struct RedisConnector;

#[async_trait]
impl StoreConnector for RedisConnector {
    async fn connect(&self, node: &NodeConfig) -> Result<Arc<dyn KeyValueStore>> {
        let store =
            RedisStore::connect(StoreConnectionConfig::for_node(&node.host, node.port)).await?;
        Ok(Arc::new(store))
    }
}

/// Hands out in-process stores keyed by node id. Tests can pre-register any
/// store implementation and take nodes down; a downed node refuses new
/// connects and fails every call on connections already handed out.
pub struct MemoryConnector {
    stores: DashMap<String, Arc<dyn KeyValueStore>>,
    down_flags: DashMap<String, Arc<std::sync::atomic::AtomicBool>>,
}

impl MemoryConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stores: DashMap::new(),
            down_flags: DashMap::new(),
        })
    }

    /// Replace (or pre-seed) the store served for a node id.
    pub fn register(&self, node_id: &str, store: Arc<dyn KeyValueStore>) {
        self.stores.insert(node_id.to_string(), store);
    }

    /// The node's backing store, bypassing the outage toggle. Reads and
    /// writes here always work, which lets tests inspect or plant state.
    pub fn store_for(&self, node_id: &str) -> Arc<dyn KeyValueStore> {
        self.stores
            .entry(node_id.to_string())
            .or_insert_with(|| MemoryStore::shared() as Arc<dyn KeyValueStore>)
            .clone()
    }

    fn flag_for(&self, node_id: &str) -> Arc<std::sync::atomic::AtomicBool> {
        self.down_flags
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(std::sync::atomic::AtomicBool::new(false)))
            .clone()
    }

    /// Simulate a node outage (or recovery).
    pub fn set_down(&self, node_id: &str, down: bool) {
        self.flag_for(node_id)
            .store(down, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self, node: &NodeConfig) -> Result<Arc<dyn KeyValueStore>> {
        let flag = self.flag_for(&node.id);
        if flag.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::StoreUnavailable(format!("node {} is down", node.id)));
        }
        Ok(Arc::new(ToggleStore {
            node_id: node.id.clone(),
            inner: self.store_for(&node.id),
            down: flag,
        }))
    }
}

/// Delegating store that fails every call while its node is down.
struct ToggleStore {
    node_id: String,
    inner: Arc<dyn KeyValueStore>,
    down: Arc<std::sync::atomic::AtomicBool>,
}

impl ToggleStore {
    fn check(&self) -> Result<()> {
        if self.down.load(std::sync::atomic::Ordering::SeqCst) {
            Err(Error::StoreUnavailable(format!(
                "node {} is down",
                self.node_id
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyValueStore for ToggleStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<std::time::Duration>,
    ) -> Result<()> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn del(&self, keys: &[String]) -> Result<usize> {
        self.check()?;
        self.inner.del(keys).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check()?;
        self.inner.exists(key).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<std::time::Duration>> {
        self.check()?;
        self.inner.ttl(key).await
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        self.check()?;
        self.inner.scan(cursor, pattern, count).await
    }

    async fn set_batch(&self, entries: &[crate::store::BatchEntry]) -> Result<()> {
        self.check()?;
        self.inner.set_batch(entries).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.check()?;
        self.inner.zadd(key, member, score).await
    }

    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> Result<f64> {
        self.check()?;
        self.inner.zincrby(key, member, delta).await
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        self.check()?;
        self.inner.zscore(key, member).await
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.check()?;
        self.inner.zrange(key, start, stop).await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        self.check()?;
        self.inner.zrem(key, member).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.check()?;
        self.inner.sadd(key, member).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.check()?;
        self.inner.smembers(key).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        self.check()?;
        self.inner.srem(key, member).await
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        self.check()?;
        self.inner.scard(key).await
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        self.check()?;
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> Result<crate::store::PubSubStream> {
        self.check()?;
        self.inner.subscribe(channel).await
    }

    async fn ping(&self) -> Result<()> {
        self.check()?;
        self.inner.ping().await
    }
}

/// Cluster membership and ring owner.
pub struct NodeRegistry {
    config: ClusterConfig,
    nodes: RwLock<HashMap<String, NodeState>>,
    ring: parking_lot::RwLock<Arc<HashRing>>,
    connector: Arc<dyn StoreConnector>,
    metrics: Arc<MetricsSink>,
    shutdown: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl NodeRegistry {
    pub fn new(
        config: ClusterConfig,
        connector: Arc<dyn StoreConnector>,
        metrics: Arc<MetricsSink>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let nodes = config
            .nodes
            .iter()
            .map(|nc| {
                (
                    nc.id.clone(),
                    NodeState {
                        config: nc.clone(),
                        status: NodeStatus::Connecting,
                        is_master: false,
                        last_heartbeat: None,
                        connection: None,
                    },
                )
            })
            .collect();
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            nodes: RwLock::new(nodes),
            ring: parking_lot::RwLock::new(Arc::new(HashRing::default())),
            connector,
            metrics,
            shutdown,
            tasks: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    /// Connect every configured node, elect a master, build the first ring
    /// snapshot, and start the heartbeat loop. Fails when no node at all is
    /// reachable.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.connect_all().await;
        self.elect_master().await?;
        self.rebuild_ring().await;

        let registry = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so startup state settles.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.heartbeat_tick().await,
                    _ = shutdown.changed() => return,
                }
            }
        });
        self.tasks.lock().push(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn connect_all(&self) {
        let mut nodes = self.nodes.write().await;
        for node in nodes.values_mut() {
            match self.connector.connect(&node.config).await {
                Ok(conn) => {
                    node.connection = Some(conn);
                    node.status = NodeStatus::Connected;
                    node.last_heartbeat = Some(Instant::now());
                }
                Err(e) => {
                    error!("Failed to connect to node {}: {e}", node.config.id);
                    node.status = NodeStatus::Error;
                }
            }
        }
    }

    /// Pick the connected node with the smallest id. Ids are unique, so ties
    /// are impossible.
    pub async fn elect_master(&self) -> Result<String> {
        let mut nodes = self.nodes.write().await;
        let elected = nodes
            .values()
            .filter(|n| n.status == NodeStatus::Connected)
            .map(|n| n.config.id.clone())
            .min()
            .ok_or_else(|| Error::StoreUnavailable("no connected nodes for election".into()))?;

        for node in nodes.values_mut() {
            node.is_master = node.config.id == elected;
        }
        drop(nodes);

        info!("Elected master node: {elected}");
        self.metrics
            .increment_counter("cluster_elections_total", 1.0, &[("master", &elected)]);
        Ok(elected)
    }

    /// Rebuild the immutable ring snapshot from connected nodes.
    pub async fn rebuild_ring(&self) {
        let connected: Vec<(String, u32)> = {
            let nodes = self.nodes.read().await;
            nodes
                .values()
                .filter(|n| n.status == NodeStatus::Connected)
                .map(|n| (n.config.id.clone(), n.config.weight))
                .collect()
        };
        let ring = Arc::new(HashRing::build(&connected, self.config.virtual_nodes));
        *self.ring.write() = ring;
    }

    /// Current ring snapshot; never blocks on membership changes.
    pub fn ring(&self) -> Arc<HashRing> {
        self.ring.read().clone()
    }

    async fn heartbeat_tick(&self) {
        let mut membership_changed = false;
        let mut master_lost = false;

        let ids: Vec<String> = {
            let nodes = self.nodes.read().await;
            nodes.keys().cloned().collect()
        };

        for id in ids {
            let (status, conn, is_master, config) = {
                let nodes = self.nodes.read().await;
                let Some(node) = nodes.get(&id) else { continue };
                (
                    node.status,
                    node.connection.clone(),
                    node.is_master,
                    node.config.clone(),
                )
            };

            match (status, conn) {
                (NodeStatus::Connected, Some(conn)) => {
                    let ping =
                        tokio::time::timeout(self.config.operation_timeout, conn.ping()).await;
                    match ping {
                        Ok(Ok(())) => {
                            let mut nodes = self.nodes.write().await;
                            if let Some(node) = nodes.get_mut(&id) {
                                node.last_heartbeat = Some(Instant::now());
                            }
                        }
                        Ok(Err(e)) => {
                            warn!("Heartbeat failed for node {id}: {e}");
                            self.mark_error(&id).await;
                            membership_changed = true;
                            master_lost |= is_master;
                        }
                        Err(_) => {
                            warn!("Heartbeat timed out for node {id}");
                            self.mark_error(&id).await;
                            membership_changed = true;
                            master_lost |= is_master;
                        }
                    }
                }
                // Down or never-connected nodes are re-dialed every tick.
                _ => match self.connector.connect(&config).await {
                    Ok(conn) => {
                        info!("Node {id} reconnected");
                        let mut nodes = self.nodes.write().await;
                        if let Some(node) = nodes.get_mut(&id) {
                            node.connection = Some(conn);
                            node.status = NodeStatus::Connected;
                            node.last_heartbeat = Some(Instant::now());
                        }
                        membership_changed = true;
                    }
                    Err(_) => {}
                },
            }
        }

        if master_lost || self.master_id().await.is_none() {
            if let Err(e) = self.elect_master().await {
                warn!("Master election failed: {e}");
            }
        }
        if membership_changed {
            self.rebuild_ring().await;
        }

        let healthy = self.healthy_count().await;
        self.metrics
            .gauge("cache_cluster_nodes", healthy as f64, &[]);
    }

    async fn mark_error(&self, id: &str) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get_mut(id) {
            node.status = NodeStatus::Error;
            node.is_master = false;
            node.connection = None;
        }
    }

    pub async fn master_id(&self) -> Option<String> {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .find(|n| n.is_master && n.status == NodeStatus::Connected)
            .map(|n| n.config.id.clone())
    }

    /// The master's store connection, used for pub/sub sync.
    pub async fn master_connection(&self) -> Option<(String, Arc<dyn KeyValueStore>)> {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .find(|n| n.is_master && n.status == NodeStatus::Connected)
            .and_then(|n| n.connection.clone().map(|c| (n.config.id.clone(), c)))
    }

    pub async fn connection_for(&self, node_id: &str) -> Option<Arc<dyn KeyValueStore>> {
        let nodes = self.nodes.read().await;
        nodes.get(node_id).and_then(|n| {
            (n.status == NodeStatus::Connected)
                .then(|| n.connection.clone())
                .flatten()
        })
    }

    /// Connected nodes in the key's ring traversal order, paired with their
    /// connections.
    pub async fn nodes_for_key(&self, key: &str) -> Vec<(String, Arc<dyn KeyValueStore>)> {
        let order = self.ring().nodes_for(key);
        let nodes = self.nodes.read().await;
        order
            .into_iter()
            .filter_map(|id| {
                nodes.get(&id).and_then(|n| {
                    (n.status == NodeStatus::Connected)
                        .then(|| n.connection.clone().map(|c| (id, c)))
                        .flatten()
                })
            })
            .collect()
    }

    /// All connected nodes with their connections, in id order.
    pub async fn healthy_connections(&self) -> Vec<(String, Arc<dyn KeyValueStore>)> {
        let nodes = self.nodes.read().await;
        let mut out: Vec<_> = nodes
            .values()
            .filter(|n| n.status == NodeStatus::Connected)
            .filter_map(|n| n.connection.clone().map(|c| (n.config.id.clone(), c)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub async fn healthy_count(&self) -> usize {
        let nodes = self.nodes.read().await;
        nodes
            .values()
            .filter(|n| n.status == NodeStatus::Connected)
            .count()
    }

    pub async fn snapshots(&self) -> Vec<NodeSnapshot> {
        let nodes = self.nodes.read().await;
        let mut out: Vec<_> = nodes
            .values()
            .map(|n| NodeSnapshot {
                id: n.config.id.clone(),
                status: n.status,
                is_master: n.is_master,
                weight: n.config.weight,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Drive one heartbeat pass immediately. Exposed for tests.
    #[doc(hidden)]
    pub async fn force_heartbeat(&self) {
        self.heartbeat_tick().await;
    }
}
