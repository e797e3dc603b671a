//! Clustered cache machinery
//!
//! Consistent-hash key placement (`ring`), membership with heartbeats and
//! master election (`registry`), quorum replication with pub/sub sync
//! (`replication`), and key rebalancing after topology changes
//! (`rebalance`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod rebalance;
pub mod registry;
pub mod replication;
pub mod ring;

pub use rebalance::{ClusterRebalancer, RebalanceStrategy, RebalancerConfig};
pub use registry::{
    MemoryConnector, NodeConfig, NodeRegistry, NodeSnapshot, NodeStatus, RedisConnector,
    StoreConnector,
};
pub use replication::{ReplicationEngine, SyncMessage};
pub use ring::{HashRing, DEFAULT_VIRTUAL_NODES};

/// Cluster topology and quorum configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeConfig>,
    /// Acknowledgements required for a quorum read
    pub read_quorum: usize,
    /// Acknowledgements required for a quorum write
    pub write_quorum: usize,
    /// Copies targeted by replication
    pub replication_factor: usize,
    /// Ring entries per unit of node weight
    pub virtual_nodes: usize,
    pub heartbeat_interval: Duration,
    /// Deadline applied to each outbound node call
    pub operation_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            read_quorum: 2,
            write_quorum: 2,
            replication_factor: 2,
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            heartbeat_interval: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(5),
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::Config("cluster has no nodes".into()));
        }
        let mut ids: Vec<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.nodes.len() {
            return Err(Error::Config("node ids must be unique".into()));
        }
        if self.nodes.iter().any(|n| n.weight == 0) {
            return Err(Error::Config("node weight must be >= 1".into()));
        }
        if self.read_quorum == 0 || self.write_quorum == 0 {
            return Err(Error::Config("quorum sizes must be >= 1".into()));
        }
        if self.read_quorum > self.nodes.len() || self.write_quorum > self.nodes.len() {
            return Err(Error::Config(format!(
                "quorum sizes R={}/W={} exceed node count {}",
                self.read_quorum,
                self.write_quorum,
                self.nodes.len()
            )));
        }
        if self.virtual_nodes == 0 {
            return Err(Error::Config("virtual_nodes must be >= 1".into()));
        }
        Ok(())
    }
}
