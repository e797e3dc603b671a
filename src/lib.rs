//! # BASIN - Distributed Cache & Resilience Core
//!
//! The caching and service-mesh resilience machinery of the Basin data
//! platform's lake services.
//!
//! ## Architecture
//!
//! - `store`: Key/value store protocol with in-memory and Redis backends
//! - `cache`: Namespaced cache facade with eviction, codecs, write-behind
//!   buffering, access pattern tracking, and predictive warming
//! - `cluster`: Consistent-hash ring, node registry with heartbeats and
//!   master election, quorum replication, key rebalancing
//! - `mesh`: Circuit breaker, health-aware load balancer, health trend
//!   analysis
//! - `metrics`: Counters, gauges, histograms, timers with aggregation,
//!   retention, and export
//! - `error`: Typed error surface shared by all of the above
//!
//! The cache runs single-node or clustered; clustered mode is eventually
//! consistent, with quorum reads/writes and best-effort pub/sub sync.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

// Shared typed errors
pub mod error;

// Store protocol and backends
pub mod store;

// Metrics sink
pub mod metrics;

// Cache core
pub mod cache;

// Cluster machinery
pub mod cluster;

// Resilience fabric
pub mod mesh;

// Re-export commonly used types
pub use cache::{Cache, CacheConfig, CodecKind, EvictionPolicyKind, WriteMode};
pub use cluster::{ClusterConfig, NodeConfig};
pub use error::{Error, Result};
pub use metrics::{MetricsConfig, MetricsSink};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
