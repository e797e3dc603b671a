//! Quorum replication and cluster sync
//!
//! Writes fan out over the key's ring traversal until `W` nodes acknowledge;
//! reads collect up to `R` values and flag divergence. Every committed write
//! is also published on the cluster sync channel through the master's
//! connection; subscriber loops apply messages they did not originate.
//! Deletes are writes of an empty payload with a one-second TTL, so expiry
//! erases them everywhere. Consistency is eventual, last-write-wins per key.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::registry::NodeRegistry;
use crate::error::{Error, Result};
use crate::metrics::MetricsSink;
use crate::store::KeyValueStore;

/// TTL used to model a delete as a write.
pub const DELETE_TTL: Duration = Duration::from_secs(1);

/// Wire form of a sync notification. The payload is the stored entry
/// envelope, byte-identical to what the originating node wrote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub key: String,
    pub payload: Vec<u8>,
    pub ttl_millis: Option<u64>,
    pub source_node: String,
    pub timestamp: String,
}

/// Quorum read/write engine bound to a node registry.
pub struct ReplicationEngine {
    registry: Arc<NodeRegistry>,
    namespace: String,
    metrics: Arc<MetricsSink>,
    shutdown: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicationEngine {
    pub fn new(
        registry: Arc<NodeRegistry>,
        namespace: impl Into<String>,
        metrics: Arc<MetricsSink>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            registry,
            namespace: namespace.into(),
            metrics,
            shutdown,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn sync_channel(&self) -> String {
        format!("{}:sync", self.namespace)
    }

    /// Write with quorum: traverse healthy nodes in ring order from the
    /// key's primary, succeed once `W` acknowledge. Remaining replicas up to
    /// the configured replication factor are written in the background, and
    /// the write is published on the sync channel.
    pub async fn write(&self, key: &str, payload: &[u8], ttl: Option<Duration>) -> Result<()> {
        let write_quorum = self.registry.config().write_quorum;
        let timeout = self.registry.config().operation_timeout;
        let nodes = self.registry.nodes_for_key(key).await;

        let mut acks = 0usize;
        let mut tried = 0usize;
        let mut origin: Option<String> = None;
        let mut remaining: Vec<(String, Arc<dyn KeyValueStore>)> = Vec::new();

        for (node_id, conn) in nodes {
            if acks >= write_quorum {
                remaining.push((node_id, conn));
                continue;
            }
            tried += 1;
            match tokio::time::timeout(timeout, conn.set(key, payload, ttl)).await {
                Ok(Ok(())) => {
                    acks += 1;
                    origin.get_or_insert(node_id);
                }
                Ok(Err(e)) => warn!("Quorum write to {node_id} failed: {e}"),
                Err(_) => warn!("Quorum write to {node_id} timed out"),
            }
        }

        if acks < write_quorum {
            self.metrics.increment_counter(
                "cache_quorum_failures_total",
                1.0,
                &[("op", "write"), ("namespace", &self.namespace)],
            );
            debug!("Quorum write failed for {key}: {acks}/{write_quorum} after {tried} nodes");
            return Err(Error::QuorumNotMet {
                acks,
                required: write_quorum,
            });
        }

        self.replicate_background(key, payload, ttl, acks, remaining);
        let origin = origin.unwrap_or_default();
        self.publish_sync(key, payload, ttl, &origin).await;
        Ok(())
    }

    /// Push extra copies toward the replication factor without holding up
    /// the acknowledged write.
    fn replicate_background(
        &self,
        key: &str,
        payload: &[u8],
        ttl: Option<Duration>,
        acked: usize,
        remaining: Vec<(String, Arc<dyn KeyValueStore>)>,
    ) {
        let replication_factor = self.registry.config().replication_factor;
        if acked >= replication_factor || remaining.is_empty() {
            return;
        }
        let extra = replication_factor - acked;
        let key = key.to_string();
        let payload = payload.to_vec();
        tokio::spawn(async move {
            for (node_id, conn) in remaining.into_iter().take(extra) {
                if let Err(e) = conn.set(&key, &payload, ttl).await {
                    debug!("Background replica write to {node_id} failed: {e}");
                }
            }
        });
    }

    /// Read with quorum: collect up to `R` values in ring order. Returns the
    /// first value found and whether every collected copy was byte-equal.
    /// `Ok(None)` is a clean miss; fewer than `R` responding nodes with no
    /// value at all is a quorum failure.
    pub async fn read(&self, key: &str) -> Result<Option<(Vec<u8>, bool)>> {
        let read_quorum = self.registry.config().read_quorum;
        let timeout = self.registry.config().operation_timeout;
        let nodes = self.registry.nodes_for_key(key).await;

        let mut values: Vec<Vec<u8>> = Vec::new();
        let mut responded = 0usize;

        for (node_id, conn) in nodes {
            match tokio::time::timeout(timeout, conn.get(key)).await {
                Ok(Ok(Some(value))) => {
                    responded += 1;
                    values.push(value);
                    if values.len() >= read_quorum {
                        break;
                    }
                }
                Ok(Ok(None)) => responded += 1,
                Ok(Err(e)) => warn!("Quorum read from {node_id} failed: {e}"),
                Err(_) => warn!("Quorum read from {node_id} timed out"),
            }
        }

        if values.is_empty() {
            if responded < read_quorum {
                self.metrics.increment_counter(
                    "cache_quorum_failures_total",
                    1.0,
                    &[("op", "read"), ("namespace", &self.namespace)],
                );
                return Err(Error::QuorumNotMet {
                    acks: responded,
                    required: read_quorum,
                });
            }
            return Ok(None);
        }

        let consistent = values.iter().all(|v| v == &values[0]);
        if !consistent {
            warn!("Inconsistent quorum read for key {key}");
            self.metrics.increment_counter(
                "cache_inconsistent_reads_total",
                1.0,
                &[("namespace", &self.namespace)],
            );
        }
        Ok(Some((values.swap_remove(0), consistent)))
    }

    /// Quorum delete: a write of an empty payload expiring in one second.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.write(key, &[], Some(DELETE_TTL)).await
    }

    /// Publish through the master's connection. The source node is the node
    /// that first acknowledged the write, so subscribers skip re-applying
    /// the copy it already holds.
    async fn publish_sync(&self, key: &str, payload: &[u8], ttl: Option<Duration>, origin: &str) {
        let Some((_, conn)) = self.registry.master_connection().await else {
            warn!("No master available, skipping sync publish for {key}");
            return;
        };
        let message = SyncMessage {
            key: key.to_string(),
            payload: payload.to_vec(),
            ttl_millis: ttl.map(|d| d.as_millis() as u64),
            source_node: origin.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        };
        let encoded = match serde_json::to_vec(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode sync message for {key}: {e}");
                return;
            }
        };
        // Best-effort: sync delivery loss is tolerated by design.
        if let Err(e) = conn.publish(&self.sync_channel(), &encoded).await {
            warn!("Sync publish failed for {key}: {e}");
            return;
        }
        self.metrics.increment_counter(
            "cache_sync_operations_total",
            1.0,
            &[("namespace", &self.namespace)],
        );
    }

    /// Spawn the subscriber loop: apply sync messages to every connected
    /// node except the one that originated them. Re-subscribes if the
    /// channel drops.
    pub fn start_sync(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                let Some((_, conn)) = engine.registry.master_connection().await else {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                        _ = shutdown.changed() => return,
                    }
                };
                let mut stream = match conn.subscribe(&engine.sync_channel()).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("Sync subscribe failed: {e}");
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                            _ = shutdown.changed() => return,
                        }
                    }
                };
                info!("Cluster sync subscriber attached");
                loop {
                    tokio::select! {
                        message = stream.next() => match message {
                            Some(raw) => engine.apply_sync(&raw).await,
                            None => {
                                warn!("Sync channel closed, resubscribing");
                                break;
                            }
                        },
                        _ = shutdown.changed() => return,
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn apply_sync(&self, raw: &[u8]) {
        let message: SyncMessage = match serde_json::from_slice(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed sync message: {e}");
                return;
            }
        };
        let ttl = message.ttl_millis.map(Duration::from_millis);
        for (node_id, conn) in self.registry.healthy_connections().await {
            if node_id == message.source_node {
                continue;
            }
            if let Err(e) = conn.set(&message.key, &message.payload, ttl).await {
                warn!("Sync apply to {node_id} failed for {}: {e}", message.key);
            }
        }
        self.metrics.increment_counter(
            "cache_sync_applied_total",
            1.0,
            &[("namespace", &self.namespace)],
        );
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::registry::{MemoryConnector, NodeConfig, StoreConnector};
    use crate::cluster::ClusterConfig;
    use crate::metrics::MetricsConfig;

    async fn cluster(
        ids: &[&str],
        read_quorum: usize,
        write_quorum: usize,
    ) -> (Arc<NodeRegistry>, Arc<MemoryConnector>, Arc<ReplicationEngine>) {
        let connector = MemoryConnector::new();
        let metrics = MetricsSink::new(MetricsConfig::default());
        let config = ClusterConfig {
            nodes: ids
                .iter()
                .enumerate()
                .map(|(i, id)| NodeConfig {
                    id: id.to_string(),
                    host: "127.0.0.1".into(),
                    port: 7100 + i as u16,
                    weight: 1,
                })
                .collect(),
            read_quorum,
            write_quorum,
            replication_factor: 2,
            ..Default::default()
        };
        let registry = NodeRegistry::new(
            config,
            connector.clone() as Arc<dyn StoreConnector>,
            metrics.clone(),
        )
        .unwrap();
        registry.start().await.unwrap();
        let engine = ReplicationEngine::new(registry.clone(), "test", metrics);
        (registry, connector, engine)
    }

    #[tokio::test]
    async fn test_quorum_write_reaches_enough_nodes() {
        let (registry, connector, engine) = cluster(&["n1", "n2", "n3"], 2, 2).await;
        engine.write("test:k", b"payload", None).await.unwrap();

        let copies = futures::future::join_all(
            ["n1", "n2", "n3"]
                .iter()
                .map(|id| connector.store_for(id))
                .map(|s| async move { s.get("test:k").await.unwrap().is_some() }),
        )
        .await;
        assert!(copies.iter().filter(|present| **present).count() >= 2);
        registry.stop().await;
    }

    #[tokio::test]
    async fn test_quorum_read_roundtrip_consistent() {
        let (registry, _, engine) = cluster(&["n1", "n2", "n3"], 2, 2).await;
        engine.write("test:k", b"v1", None).await.unwrap();

        let (value, consistent) = engine.read("test:k").await.unwrap().unwrap();
        assert_eq!(value, b"v1");
        assert!(consistent);
        registry.stop().await;
    }

    #[tokio::test]
    async fn test_quorum_write_fails_below_w() {
        let (registry, connector, engine) = cluster(&["n1", "n2", "n3"], 2, 3).await;
        // Take two nodes down; only one can acknowledge.
        connector.set_down("n2", true);
        connector.set_down("n3", true);
        registry.force_heartbeat().await;

        let result = engine.write("test:k", b"v", None).await;
        assert!(matches!(
            result,
            Err(Error::QuorumNotMet { required: 3, .. })
        ));
        registry.stop().await;
    }

    #[tokio::test]
    async fn test_inconsistent_read_is_flagged() {
        let (registry, connector, engine) = cluster(&["n1", "n2", "n3"], 3, 2).await;
        // Plant divergent copies directly on every node.
        for (id, value) in [("n1", b"a".as_slice()), ("n2", b"b"), ("n3", b"b")] {
            connector.store_for(id).set("test:k", value, None).await.unwrap();
        }

        let (_, consistent) = engine.read("test:k").await.unwrap().unwrap();
        assert!(!consistent);
        registry.stop().await;
    }

    #[tokio::test]
    async fn test_delete_writes_short_ttl_tombstone() {
        let (registry, connector, engine) = cluster(&["n1", "n2", "n3"], 2, 2).await;
        engine.write("test:k", b"v", None).await.unwrap();
        engine.delete("test:k").await.unwrap();

        let mut tombstoned = 0;
        for id in ["n1", "n2", "n3"] {
            let store = connector.store_for(id);
            if let Some(value) = store.get("test:k").await.unwrap() {
                assert!(value.is_empty());
                assert!(store.ttl("test:k").await.unwrap().unwrap() <= DELETE_TTL);
                tombstoned += 1;
            }
        }
        assert!(tombstoned >= 2);
        registry.stop().await;
    }

    #[tokio::test]
    async fn test_sync_propagates_to_non_source_nodes() {
        let (registry, connector, engine) = cluster(&["n1", "n2", "n3"], 1, 1).await;
        engine.start_sync();
        // Let the subscriber attach before publishing.
        tokio::time::sleep(Duration::from_millis(50)).await;

        engine.write("test:synced", b"everywhere", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        for id in ["n1", "n2", "n3"] {
            let value = connector.store_for(id).get("test:synced").await.unwrap();
            assert_eq!(value, Some(b"everywhere".to_vec()), "node {id}");
        }
        engine.stop().await;
        registry.stop().await;
    }
}
