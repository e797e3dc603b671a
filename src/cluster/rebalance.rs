//! Key rebalancing after topology changes
//!
//! Walks every connected node's keyspace, computes each key's current ring
//! owner, and migrates misplaced keys by copy-then-delete, preserving the
//! remaining TTL. Three pacing strategies: immediate (pipelined bulk move),
//! gradual (batched with pauses), and off-peak (gradual, gated to the
//! 02:00–05:00 local window). Runs are idempotent and cancellable between
//! keys.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Timelike};
use log::{info, warn};

use super::registry::NodeRegistry;
use crate::error::{Error, Result};
use crate::metrics::MetricsSink;
use crate::store::{scan_all, BatchEntry, KeyValueStore};

/// Pacing strategy for a rebalance run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceStrategy {
    /// Move everything at once with pipelined writes
    Immediate,
    /// Move in batches with a pause between batches
    Gradual,
    /// Gradual, but only inside the off-peak window
    OffPeak,
}

impl RebalanceStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebalanceStrategy::Immediate => "immediate",
            RebalanceStrategy::Gradual => "gradual",
            RebalanceStrategy::OffPeak => "off_peak",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "immediate" => Ok(RebalanceStrategy::Immediate),
            "gradual" => Ok(RebalanceStrategy::Gradual),
            "off_peak" => Ok(RebalanceStrategy::OffPeak),
            other => Err(Error::Config(format!("unknown rebalance strategy: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RebalancerConfig {
    pub strategy: RebalanceStrategy,
    /// Namespace whose keys are rebalanced
    pub namespace: String,
    pub batch_size: usize,
    pub sleep_between_batches: Duration,
}

impl RebalancerConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            strategy: RebalanceStrategy::Gradual,
            namespace: namespace.into(),
            batch_size: 100,
            sleep_between_batches: Duration::from_millis(100),
        }
    }
}

struct PlannedMove {
    key: String,
    source: String,
    target: String,
}

/// Moves keys to their ring owners.
pub struct ClusterRebalancer {
    registry: Arc<NodeRegistry>,
    config: RebalancerConfig,
    metrics: Arc<MetricsSink>,
    cancelled: AtomicBool,
    running: AtomicBool,
}

impl ClusterRebalancer {
    pub fn new(
        registry: Arc<NodeRegistry>,
        config: RebalancerConfig,
        metrics: Arc<MetricsSink>,
    ) -> Self {
        Self {
            registry,
            config,
            metrics,
            cancelled: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// Request cancellation; the run halts after the in-flight key.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one rebalance pass. Returns the number of keys moved.
    pub async fn rebalance(&self) -> Result<usize> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Rebalance already in progress");
            return Ok(0);
        }
        self.cancelled.store(false, Ordering::SeqCst);

        let result = self.run_inner().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(&self) -> Result<usize> {
        self.registry.rebuild_ring().await;
        let moves = self.plan_moves().await?;
        if moves.is_empty() {
            info!("Rebalance found no misplaced keys");
            return Ok(0);
        }
        info!("Rebalancing {} keys", moves.len());

        let moved = match self.config.strategy {
            RebalanceStrategy::Immediate => self.run_immediate(moves).await?,
            RebalanceStrategy::Gradual => self.run_gradual(&moves).await?,
            RebalanceStrategy::OffPeak => self.run_off_peak(&moves).await?,
        };

        self.metrics.increment_counter(
            "cache_rebalance_moved_total",
            moved as f64,
            &[
                ("namespace", self.config.namespace.as_str()),
                ("strategy", self.config.strategy.as_str()),
            ],
        );
        Ok(moved)
    }

    /// Scan every connected node for namespace keys whose ring owner differs
    /// from where they currently live.
    async fn plan_moves(&self) -> Result<Vec<PlannedMove>> {
        let ring = self.registry.ring();
        let pattern = format!("{}:*", self.config.namespace);
        let mut moves = Vec::new();

        for (node_id, conn) in self.registry.healthy_connections().await {
            let keys = scan_all(conn.as_ref(), &pattern).await?;
            for key in keys {
                if let Some(target) = ring.node_for(&key) {
                    if target != node_id {
                        moves.push(PlannedMove {
                            key,
                            source: node_id.clone(),
                            target: target.to_string(),
                        });
                    }
                }
            }
        }
        Ok(moves)
    }

    /// Pipelined bulk move: batch reads from each source, one batched write
    /// per target, then bulk delete at the source.
    async fn run_immediate(&self, moves: Vec<PlannedMove>) -> Result<usize> {
        let mut by_pair: HashMap<(String, String), Vec<String>> = HashMap::new();
        for m in moves {
            by_pair.entry((m.source, m.target)).or_default().push(m.key);
        }

        let mut moved = 0usize;
        for ((source, target), keys) in by_pair {
            if self.cancelled.load(Ordering::SeqCst) {
                break;
            }
            let (Some(source_conn), Some(target_conn)) = (
                self.registry.connection_for(&source).await,
                self.registry.connection_for(&target).await,
            ) else {
                continue;
            };

            let mut entries: Vec<BatchEntry> = Vec::new();
            let mut present: Vec<String> = Vec::new();
            for key in keys {
                if let Some(data) = source_conn.get(&key).await? {
                    let ttl = source_conn.ttl(&key).await?;
                    entries.push((key.clone(), data, ttl));
                    present.push(key);
                }
            }
            if entries.is_empty() {
                continue;
            }
            target_conn.set_batch(&entries).await?;
            source_conn.del(&present).await?;
            moved += present.len();
        }
        Ok(moved)
    }

    async fn run_gradual(&self, moves: &[PlannedMove]) -> Result<usize> {
        let mut moved = 0usize;
        for m in moves {
            if self.cancelled.load(Ordering::SeqCst) {
                info!("Rebalance cancelled after {moved} moves");
                break;
            }
            match self.move_key(m).await {
                Ok(true) => {
                    moved += 1;
                    if moved % self.config.batch_size == 0 {
                        tokio::time::sleep(self.config.sleep_between_batches).await;
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to move key {}: {e}", m.key),
            }
        }
        Ok(moved)
    }

    async fn run_off_peak(&self, moves: &[PlannedMove]) -> Result<usize> {
        let mut moved = 0usize;
        let mut index = 0usize;
        while index < moves.len() && !self.cancelled.load(Ordering::SeqCst) {
            if is_off_peak(Local::now().hour()) {
                let end = (index + self.config.batch_size).min(moves.len());
                moved += self.run_gradual(&moves[index..end]).await?;
                index = end;
            } else {
                // Re-check the clock once a minute without blocking cancel.
                for _ in 0..60 {
                    if self.cancelled.load(Ordering::SeqCst) {
                        return Ok(moved);
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        Ok(moved)
    }

    /// Copy-then-delete preserving the remaining TTL. Returns false when the
    /// key disappeared before the copy, which keeps reruns idempotent.
    async fn move_key(&self, m: &PlannedMove) -> Result<bool> {
        let (Some(source_conn), Some(target_conn)) = (
            self.registry.connection_for(&m.source).await,
            self.registry.connection_for(&m.target).await,
        ) else {
            return Ok(false);
        };
        let Some(data) = source_conn.get(&m.key).await? else {
            return Ok(false);
        };
        let ttl = source_conn.ttl(&m.key).await?;
        target_conn.set(&m.key, &data, ttl).await?;
        source_conn.del(std::slice::from_ref(&m.key)).await?;
        Ok(true)
    }
}

/// The off-peak migration window: 02:00 inclusive to 05:00 exclusive.
fn is_off_peak(hour: u32) -> bool {
    (2..5).contains(&hour)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::registry::{MemoryConnector, NodeConfig, StoreConnector};
    use crate::cluster::ClusterConfig;
    use crate::metrics::MetricsConfig;

    async fn cluster(ids: &[&str]) -> (Arc<NodeRegistry>, Arc<MemoryConnector>) {
        let connector = MemoryConnector::new();
        let metrics = MetricsSink::new(MetricsConfig::default());
        let config = ClusterConfig {
            nodes: ids
                .iter()
                .enumerate()
                .map(|(i, id)| NodeConfig {
                    id: id.to_string(),
                    host: "127.0.0.1".into(),
                    port: 7200 + i as u16,
                    weight: 1,
                })
                .collect(),
            read_quorum: 1,
            write_quorum: 1,
            ..Default::default()
        };
        let registry = NodeRegistry::new(
            config,
            connector.clone() as Arc<dyn StoreConnector>,
            metrics,
        )
        .unwrap();
        registry.start().await.unwrap();
        (registry, connector)
    }

    fn rebalancer(
        registry: &Arc<NodeRegistry>,
        strategy: RebalanceStrategy,
    ) -> ClusterRebalancer {
        let mut config = RebalancerConfig::new("app");
        config.strategy = strategy;
        config.sleep_between_batches = Duration::from_millis(1);
        ClusterRebalancer::new(
            registry.clone(),
            config,
            MetricsSink::new(MetricsConfig::default()),
        )
    }

    /// Plant every key on one node, then check the rebalancer spreads them
    /// to their ring owners.
    async fn seed_misplaced(connector: &MemoryConnector, count: usize) {
        let store = connector.store_for("n1");
        for i in 0..count {
            store
                .set(&format!("app:key-{i}"), b"v", Some(Duration::from_secs(600)))
                .await
                .unwrap();
        }
    }

    async fn locate(
        connector: &MemoryConnector,
        ids: &[&str],
        key: &str,
    ) -> Vec<String> {
        let mut found = Vec::new();
        for id in ids {
            if connector.store_for(id).get(key).await.unwrap().is_some() {
                found.push(id.to_string());
            }
        }
        found
    }

    #[tokio::test]
    async fn test_gradual_moves_keys_to_ring_owners() {
        let (registry, connector) = cluster(&["n1", "n2", "n3"]).await;
        seed_misplaced(&connector, 30).await;

        let rebalancer = rebalancer(&registry, RebalanceStrategy::Gradual);
        let moved = rebalancer.rebalance().await.unwrap();
        assert!(moved > 0);

        let ring = registry.ring();
        for i in 0..30 {
            let key = format!("app:key-{i}");
            let owner = ring.node_for(&key).unwrap().to_string();
            let locations = locate(&connector, &["n1", "n2", "n3"], &key).await;
            assert_eq!(locations, vec![owner], "key {key}");
        }
        registry.stop().await;
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let (registry, connector) = cluster(&["n1", "n2", "n3"]).await;
        seed_misplaced(&connector, 20).await;

        let rebalancer = rebalancer(&registry, RebalanceStrategy::Gradual);
        rebalancer.rebalance().await.unwrap();
        let second = rebalancer.rebalance().await.unwrap();
        assert_eq!(second, 0);
        registry.stop().await;
    }

    #[tokio::test]
    async fn test_immediate_preserves_ttl() {
        let (registry, connector) = cluster(&["n1", "n2", "n3"]).await;
        seed_misplaced(&connector, 10).await;

        let rebalancer = rebalancer(&registry, RebalanceStrategy::Immediate);
        rebalancer.rebalance().await.unwrap();

        let ring = registry.ring();
        for i in 0..10 {
            let key = format!("app:key-{i}");
            let owner = ring.node_for(&key).unwrap().to_string();
            let ttl = connector.store_for(&owner).ttl(&key).await.unwrap();
            let ttl = ttl.expect("ttl preserved");
            assert!(ttl <= Duration::from_secs(600));
            assert!(ttl > Duration::from_secs(500));
        }
        registry.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_halts_run_early() {
        let (registry, connector) = cluster(&["n1", "n2", "n3"]).await;
        seed_misplaced(&connector, 50).await;

        let mut config = RebalancerConfig::new("app");
        config.strategy = RebalanceStrategy::Gradual;
        config.batch_size = 1;
        config.sleep_between_batches = Duration::from_millis(50);
        let rebalancer = Arc::new(ClusterRebalancer::new(
            registry.clone(),
            config,
            MetricsSink::new(MetricsConfig::default()),
        ));

        let runner = rebalancer.clone();
        let run = tokio::spawn(async move { runner.rebalance().await });
        tokio::time::sleep(Duration::from_millis(120)).await;
        rebalancer.cancel();

        let moved = run.await.unwrap().unwrap();
        assert!(moved < 50, "cancel should stop the run early, moved {moved}");
        registry.stop().await;
    }

    #[test]
    fn test_off_peak_window() {
        assert!(is_off_peak(2));
        assert!(is_off_peak(4));
        assert!(!is_off_peak(5));
        assert!(!is_off_peak(1));
        assert!(!is_off_peak(14));
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(
            RebalanceStrategy::from_name("off_peak").unwrap(),
            RebalanceStrategy::OffPeak
        );
        assert!(RebalanceStrategy::from_name("nope").is_err());
    }
}
