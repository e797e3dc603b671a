//! # Distributed Cache Core
//!
//! Namespaced, multi-strategy key/value caching for the platform's lake
//! services, in either single-node or clustered mode.
//!
//! - **Facade** (this module): `get` / `set` / `delete` / `clear` with
//!   namespace routing, per-operation metrics, and error containment — cache
//!   failures degrade to caller defaults instead of propagating.
//! - **Codecs** (`codec`): JSON and binary value encoding, one JSON entry
//!   envelope everywhere, optional zlib compression.
//! - **Eviction** (`eviction`): LRU / LFU / FIFO / random / TTL policies
//!   with store-side bookkeeping, enforced on write and hourly.
//! - **Write-behind** (`write_behind`): batched asynchronous writes.
//! - **Access tracking** (`access`): periodic, related-key, and seasonal
//!   analyses feeding the warming engine.
//! - **Warming** (`warming`): per-minute predictive prefetch through a
//!   caller-supplied fetch function.
//!
//! In clustered mode the facade routes operations through the quorum
//! replication engine; reads return the first value a read quorum produced
//! and writes succeed once `W` nodes acknowledge. Consistency is eventual.
//!
//! ```no_run
//! use std::sync::Arc;
//! use basin::cache::{Cache, CacheConfig};
//! use basin::metrics::{MetricsConfig, MetricsSink};
//! use basin::store::MemoryStore;
//!
//! # async fn example() -> basin::Result<()> {
//! let metrics = MetricsSink::new(MetricsConfig::default());
//! let cache = Cache::single_node(
//!     MemoryStore::shared(),
//!     CacheConfig::default(),
//!     metrics,
//! )?;
//! cache.start().await;
//!
//! cache.set("user:1", &serde_json::json!({"name": "a"}), None, None).await;
//! let value: Option<serde_json::Value> = cache.get("user:1", None, None).await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub mod access;
pub mod codec;
pub mod eviction;
pub mod types;
pub mod warming;
pub mod write_behind;

pub use access::{AccessPatternTracker, AccessTrackerConfig, PeriodicPattern};
pub use codec::CodecKind;
pub use eviction::{create_policy, EvictionPolicy};
pub use types::{CacheConfig, EvictionPolicyKind, StoredEntry, WriteMode};
pub use warming::{WarmFetcher, WarmPatternConfig, WarmingEngine};
pub use write_behind::WriteBehindBuffer;

use crate::cluster::{ClusterConfig, NodeRegistry, ReplicationEngine, StoreConnector};
use crate::error::{Error, Result};
use crate::metrics::MetricsSink;
use crate::store::{count_matching, scan_all, BatchEntry, KeyValueStore};
use codec::{decode_envelope, encode_envelope};
use types::StoredEntry as Entry;

/// Storage routing: direct single-node access or the quorum engine.
pub(crate) enum Backend {
    Single(Arc<dyn KeyValueStore>),
    Clustered {
        registry: Arc<NodeRegistry>,
        replication: Arc<ReplicationEngine>,
    },
}

impl Backend {
    /// Envelope bytes for a key, with the quorum consistency verdict.
    /// Tombstones (empty payloads) read as misses.
    pub(crate) async fn read(&self, key: &str) -> Result<Option<(Vec<u8>, bool)>> {
        let result = match self {
            Backend::Single(store) => store.get(key).await?.map(|bytes| (bytes, true)),
            Backend::Clustered { replication, .. } => replication.read(key).await?,
        };
        Ok(result.filter(|(bytes, _)| !bytes.is_empty()))
    }

    pub(crate) async fn write(&self, key: &str, payload: &[u8], ttl: Option<Duration>) -> Result<()> {
        match self {
            Backend::Single(store) => store.set(key, payload, ttl).await,
            Backend::Clustered { replication, .. } => replication.write(key, payload, ttl).await,
        }
    }

    pub(crate) async fn write_batch(&self, entries: &[BatchEntry]) -> Result<()> {
        match self {
            Backend::Single(store) => store.set_batch(entries).await,
            Backend::Clustered { replication, .. } => {
                for (key, payload, ttl) in entries {
                    replication.write(key, payload, *ttl).await?;
                }
                Ok(())
            }
        }
    }

    pub(crate) async fn delete(&self, key: &str) -> Result<bool> {
        match self {
            Backend::Single(store) => {
                Ok(store.del(std::slice::from_ref(&key.to_string())).await? > 0)
            }
            Backend::Clustered { replication, .. } => {
                replication.delete(key).await?;
                Ok(true)
            }
        }
    }

    pub(crate) async fn exists(&self, key: &str) -> Result<bool> {
        match self {
            Backend::Single(store) => store.exists(key).await,
            Backend::Clustered { registry, .. } => {
                let nodes = registry.nodes_for_key(key).await;
                match nodes.first() {
                    Some((_, conn)) => conn.exists(key).await,
                    None => Err(Error::StoreUnavailable("no healthy nodes".into())),
                }
            }
        }
    }

    /// Distinct namespace keys across the backend.
    pub(crate) async fn count_namespace(&self, pattern: &str) -> Result<usize> {
        match self {
            Backend::Single(store) => count_matching(store.as_ref(), pattern).await,
            Backend::Clustered { registry, .. } => {
                let mut distinct = std::collections::HashSet::new();
                for (_, conn) in registry.healthy_connections().await {
                    distinct.extend(scan_all(conn.as_ref(), pattern).await?);
                }
                Ok(distinct.len())
            }
        }
    }
}

/// The public cache surface.
pub struct Cache {
    config: CacheConfig,
    backend: Arc<Backend>,
    policy: Arc<dyn EvictionPolicy>,
    tracker: Arc<AccessPatternTracker>,
    metrics: Arc<MetricsSink>,
    registry: Option<Arc<NodeRegistry>>,
    write_behind: Option<Arc<WriteBehindBuffer>>,
    warming: parking_lot::Mutex<Option<Arc<WarmingEngine>>>,
    shutdown: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Cache {
    /// Cache over a single store node.
    pub fn single_node(
        store: Arc<dyn KeyValueStore>,
        config: CacheConfig,
        metrics: Arc<MetricsSink>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let backend = Arc::new(Backend::Single(store.clone()));
        let policy = create_policy(config.eviction, store, &config.namespace);
        Ok(Self::assemble(config, backend, policy, None, metrics))
    }

    /// Clustered cache: connects the node registry, elects a master, and
    /// routes operations through quorum replication.
    pub async fn clustered(
        cluster: ClusterConfig,
        connector: Arc<dyn StoreConnector>,
        config: CacheConfig,
        metrics: Arc<MetricsSink>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let registry = NodeRegistry::new(cluster, connector, metrics.clone())?;
        registry.start().await?;

        let replication =
            ReplicationEngine::new(registry.clone(), config.namespace.clone(), metrics.clone());
        let meta_store = registry
            .master_connection()
            .await
            .map(|(_, conn)| conn)
            .ok_or_else(|| Error::StoreUnavailable("no master connection".into()))?;
        let policy = create_policy(config.eviction, meta_store, &config.namespace);
        let backend = Arc::new(Backend::Clustered {
            registry: registry.clone(),
            replication,
        });
        Ok(Self::assemble(config, backend, policy, Some(registry), metrics))
    }

    fn assemble(
        config: CacheConfig,
        backend: Arc<Backend>,
        policy: Arc<dyn EvictionPolicy>,
        registry: Option<Arc<NodeRegistry>>,
        metrics: Arc<MetricsSink>,
    ) -> Arc<Self> {
        let tracker = Arc::new(AccessPatternTracker::new(AccessTrackerConfig {
            window: config.access_pattern_window,
            ..Default::default()
        }));
        let write_behind = (config.write_mode == WriteMode::WriteBehind).then(|| {
            WriteBehindBuffer::new(
                backend.clone(),
                config.write_buffer_size,
                config.ttl,
                config.write_interval,
                config.namespace.clone(),
                metrics.clone(),
            )
        });
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            backend,
            policy,
            tracker,
            metrics,
            registry,
            write_behind,
            warming: parking_lot::Mutex::new(None),
            shutdown,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Configure predictive warming. Patterns are globs over the full
    /// namespaced key space; the fetcher is called for every candidate key.
    pub async fn enable_warming(
        &self,
        strategy_names: &[String],
        fetcher: Arc<dyn WarmFetcher>,
        patterns: Vec<(String, WarmPatternConfig)>,
    ) -> Result<()> {
        let strategies = warming::create_warming_strategies(
            strategy_names,
            self.tracker.clone(),
            self.backend.clone(),
        )?;
        let engine = WarmingEngine::new(
            strategies,
            fetcher,
            self.backend.clone(),
            self.policy.clone(),
            self.metrics.clone(),
            self.config.codec,
            self.config.compression,
        );
        for (pattern, config) in patterns {
            engine.register_pattern(&pattern, config).await?;
        }
        *self.warming.lock() = Some(engine);
        Ok(())
    }

    /// Start background machinery: cluster sync, write-behind flusher,
    /// warming ticker, and the hourly maintenance loop.
    pub async fn start(self: &Arc<Self>) {
        if let Backend::Clustered { replication, .. } = self.backend.as_ref() {
            replication.start_sync();
        }
        if let Some(buffer) = &self.write_behind {
            buffer.start();
        }
        if let Some(engine) = self.warming.lock().clone() {
            engine.start();
        }

        let cache = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = cache.enforce_capacity().await {
                            error!("Capacity enforcement failed: {e}");
                        }
                        if let Err(e) = cache.cleanup_metadata().await {
                            error!("Metadata cleanup failed: {e}");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
        self.tasks.lock().push(handle);
        info!(
            "Cache started (namespace={}, mode={:?}, policy={})",
            self.config.namespace,
            self.config.write_mode,
            self.policy.name()
        );
    }

    /// Stop background loops; drains the write-behind buffer once.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        if let Some(engine) = self.warming.lock().clone() {
            engine.stop().await;
        }
        if let Some(buffer) = &self.write_behind {
            buffer.stop().await;
        }
        if let Backend::Clustered { replication, .. } = self.backend.as_ref() {
            replication.stop().await;
        }
        if let Some(registry) = &self.registry {
            registry.stop().await;
        }
    }

    /// Fetch and decode a value. Any failure, including decode errors and
    /// unreachable quorums, degrades to `default` and is recorded.
    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &str,
        default: Option<T>,
        codec: Option<CodecKind>,
    ) -> Option<T> {
        let started = Instant::now();
        let full_key = self.config.namespaced(key);
        let outcome = self.try_get(&full_key, codec).await;
        let result = match outcome {
            Ok(Some(value)) => {
                self.metrics.increment_counter(
                    "cache_hits_total",
                    1.0,
                    &[("namespace", &self.config.namespace)],
                );
                Some(value)
            }
            Ok(None) => {
                self.metrics.increment_counter(
                    "cache_misses_total",
                    1.0,
                    &[("namespace", &self.config.namespace)],
                );
                default
            }
            Err(e) => {
                error!("Cache get error for {full_key}: {e}");
                self.metrics.increment_counter(
                    "cache_errors_total",
                    1.0,
                    &[("operation", "get"), ("namespace", &self.config.namespace)],
                );
                default
            }
        };
        self.metrics.timing(
            "cache_operation_duration_seconds",
            started.elapsed(),
            &[("operation", "get"), ("namespace", &self.config.namespace)],
        );
        result
    }

    async fn try_get<T: DeserializeOwned>(
        &self,
        full_key: &str,
        codec: Option<CodecKind>,
    ) -> Result<Option<T>> {
        let read = tokio::time::timeout(self.config.operation_timeout, self.backend.read(full_key))
            .await
            .map_err(|_| Error::Timeout("get".into()))??;

        let Some((bytes, _consistent)) = read else {
            return Ok(None);
        };
        let mut entry = decode_envelope(&bytes, self.config.compression)?;
        if entry.is_expired() {
            return Ok(None);
        }

        self.policy.record_access(full_key).await?;
        self.tracker.record_access(full_key);

        let codec = entry
            .metadata
            .get("codec")
            .and_then(|name| CodecKind::from_name(name).ok())
            .or(codec)
            .unwrap_or(self.config.codec);
        let value = codec.decode(&entry.payload)?;

        // Fold the read back into the stored access stats on the local path;
        // quorum mode skips the extra write and lets sync converge instead.
        if let Backend::Single(store) = self.backend.as_ref() {
            entry.touch();
            let remaining = entry.expires_at.and_then(|at| {
                (at - chrono::Utc::now()).to_std().ok()
            });
            let bytes = encode_envelope(&entry, self.config.compression)?;
            store.set(full_key, &bytes, remaining).await?;
        }
        Ok(Some(value))
    }

    /// Stored entry envelope, including metadata, without decoding the
    /// payload. `CacheMiss` when absent.
    pub async fn get_entry(&self, key: &str) -> Result<StoredEntry> {
        let full_key = self.config.namespaced(key);
        match self.backend.read(&full_key).await? {
            Some((bytes, _)) => decode_envelope(&bytes, self.config.compression),
            None => Err(Error::CacheMiss(full_key)),
        }
    }

    /// Encode and store a value. Returns `false` on any failure; in
    /// write-behind mode the value is buffered and `true` returned
    /// immediately.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        codec: Option<CodecKind>,
    ) -> bool {
        let started = Instant::now();
        let full_key = self.config.namespaced(key);
        let outcome = self.try_set(&full_key, value, ttl, codec).await;
        let result = match outcome {
            Ok(()) => {
                self.metrics.increment_counter(
                    "cache_writes_total",
                    1.0,
                    &[("namespace", &self.config.namespace)],
                );
                true
            }
            Err(e) => {
                error!("Cache set error for {full_key}: {e}");
                self.metrics.increment_counter(
                    "cache_errors_total",
                    1.0,
                    &[("operation", "set"), ("namespace", &self.config.namespace)],
                );
                false
            }
        };
        self.metrics.timing(
            "cache_operation_duration_seconds",
            started.elapsed(),
            &[("operation", "set"), ("namespace", &self.config.namespace)],
        );
        result
    }

    async fn try_set<T: Serialize + ?Sized>(
        &self,
        full_key: &str,
        value: &T,
        ttl: Option<Duration>,
        codec: Option<CodecKind>,
    ) -> Result<()> {
        let codec = codec.unwrap_or(self.config.codec);
        let ttl = ttl.unwrap_or(self.config.ttl);
        let payload = codec.encode(value)?;
        let entry = Entry::new(payload, Some(ttl))
            .with_metadata("codec", codec.as_str())
            .with_metadata("strategy", write_mode_name(self.config.write_mode));
        let bytes = encode_envelope(&entry, self.config.compression)?;

        if let Some(buffer) = &self.write_behind {
            buffer.enqueue(full_key.to_string(), bytes).await?;
            return Ok(());
        }

        tokio::time::timeout(
            self.config.operation_timeout,
            self.backend.write(full_key, &bytes, Some(ttl)),
        )
        .await
        .map_err(|_| Error::Timeout("set".into()))??;

        self.policy.record_access(full_key).await?;
        self.tracker.record_access(full_key);
        self.enforce_capacity().await?;
        Ok(())
    }

    /// Remove a key. Returns `false` on failure.
    pub async fn delete(&self, key: &str) -> bool {
        let started = Instant::now();
        let full_key = self.config.namespaced(key);
        let outcome: Result<bool> = async {
            let removed = tokio::time::timeout(
                self.config.operation_timeout,
                self.backend.delete(&full_key),
            )
            .await
            .map_err(|_| Error::Timeout("delete".into()))??;
            self.policy.forget(&full_key).await?;
            Ok(removed)
        }
        .await;

        let result = match outcome {
            Ok(removed) => {
                self.metrics.increment_counter(
                    "cache_invalidations_total",
                    1.0,
                    &[("namespace", &self.config.namespace)],
                );
                removed
            }
            Err(e) => {
                error!("Cache delete error for {full_key}: {e}");
                self.metrics.increment_counter(
                    "cache_errors_total",
                    1.0,
                    &[
                        ("operation", "delete"),
                        ("namespace", &self.config.namespace),
                    ],
                );
                false
            }
        };
        self.metrics.timing(
            "cache_operation_duration_seconds",
            started.elapsed(),
            &[
                ("operation", "delete"),
                ("namespace", &self.config.namespace),
            ],
        );
        result
    }

    /// Bulk-delete a namespace (defaults to this facade's). In clustered
    /// mode only healthy nodes are visited; unreachable ones are logged and
    /// skipped, and sync-driven expiry converges them later.
    pub async fn clear(&self, namespace: Option<&str>) -> usize {
        let ns = namespace.unwrap_or(&self.config.namespace);
        let pattern = format!("{ns}:*");
        let outcome: Result<usize> = async {
            let mut cleared = 0usize;
            match self.backend.as_ref() {
                Backend::Single(store) => {
                    let keys = scan_all(store.as_ref(), &pattern).await?;
                    for key in &keys {
                        self.policy.forget(key).await?;
                    }
                    cleared += store.del(&keys).await?;
                }
                Backend::Clustered { registry, .. } => {
                    let healthy = registry.healthy_connections().await;
                    let configured = registry.config().nodes.len();
                    if healthy.len() < configured {
                        warn!(
                            "Clearing {ns} from {}/{} nodes; the rest are unreachable",
                            healthy.len(),
                            configured
                        );
                    }
                    for (node_id, conn) in healthy {
                        let keys = scan_all(conn.as_ref(), &pattern).await?;
                        for key in &keys {
                            self.policy.forget(key).await?;
                        }
                        match conn.del(&keys).await {
                            Ok(count) => cleared += count,
                            Err(e) => warn!("Clear failed on node {node_id}: {e}"),
                        }
                    }
                }
            }
            Ok(cleared)
        }
        .await;

        match outcome {
            Ok(cleared) => {
                self.metrics.increment_counter(
                    "cache_clears_total",
                    1.0,
                    &[("namespace", ns)],
                );
                cleared
            }
            Err(e) => {
                error!("Cache clear error for namespace {ns}: {e}");
                0
            }
        }
    }

    /// Evict down to `max_size` using the configured policy. Runs after
    /// writes and hourly from the maintenance loop.
    pub async fn enforce_capacity(&self) -> Result<()> {
        let Some(max_size) = self.config.max_size else {
            return Ok(());
        };
        let pattern = format!("{}:*", self.config.namespace);
        let count = self.backend.count_namespace(&pattern).await?;
        if count <= max_size {
            return Ok(());
        }

        let excess = count - max_size;
        let candidates = self.policy.eviction_candidates(excess).await?;
        if candidates.is_empty() {
            return Ok(());
        }
        for key in &candidates {
            self.backend.delete(key).await?;
            self.policy.forget(key).await?;
        }
        info!(
            "Evicted {} entries from {} (policy={})",
            candidates.len(),
            self.config.namespace,
            self.policy.name()
        );
        self.metrics.increment_counter(
            "cache_evictions",
            candidates.len() as f64,
            &[("policy", self.policy.name())],
        );
        Ok(())
    }

    /// Drop policy bookkeeping for keys the store no longer holds.
    async fn cleanup_metadata(&self) -> Result<()> {
        let tracked = self.policy.eviction_candidates(10_000).await?;
        for key in tracked {
            if !self.backend.exists(&key).await? {
                self.policy.forget(&key).await?;
            }
        }
        Ok(())
    }

    pub fn tracker(&self) -> Arc<AccessPatternTracker> {
        self.tracker.clone()
    }

    pub fn warming_engine(&self) -> Option<Arc<WarmingEngine>> {
        self.warming.lock().clone()
    }

    /// Node registry handle in clustered mode (for rebalancing and
    /// introspection).
    pub fn registry(&self) -> Option<Arc<NodeRegistry>> {
        self.registry.clone()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

fn write_mode_name(mode: WriteMode) -> &'static str {
    match mode {
        WriteMode::WriteThrough => "write_through",
        WriteMode::WriteBehind => "write_behind",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsConfig;
    use crate::store::MemoryStore;

    fn cache_with(config: CacheConfig) -> (Arc<Cache>, Arc<MemoryStore>, Arc<MetricsSink>) {
        let store = MemoryStore::shared();
        let metrics = MetricsSink::new(MetricsConfig::default());
        let cache = Cache::single_node(
            store.clone() as Arc<dyn KeyValueStore>,
            config,
            metrics.clone(),
        )
        .unwrap();
        (cache, store, metrics)
    }

    #[tokio::test]
    async fn test_set_get_delete_roundtrip() {
        let (cache, _, _) = cache_with(CacheConfig::default());
        assert!(cache.set("user:1", &serde_json::json!({"name": "a"}), None, None).await);

        let value: Option<serde_json::Value> = cache.get("user:1", None, None).await;
        assert_eq!(value, Some(serde_json::json!({"name": "a"})));

        assert!(cache.delete("user:1").await);
        let value: Option<serde_json::Value> = cache.get("user:1", None, None).await;
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_get_returns_default_on_miss() {
        let (cache, _, metrics) = cache_with(CacheConfig::default());
        let value = cache.get("absent", Some("fallback".to_string()), None).await;
        assert_eq!(value, Some("fallback".to_string()));
        assert_eq!(
            metrics.counter_value("cache_misses_total", &[("namespace", "default")]),
            1.0
        );
    }

    #[tokio::test]
    async fn test_namespacing_isolates_keys() {
        let store = MemoryStore::shared();
        let metrics = MetricsSink::new(MetricsConfig::default());
        let a = Cache::single_node(
            store.clone() as Arc<dyn KeyValueStore>,
            CacheConfig {
                namespace: "a".into(),
                ..Default::default()
            },
            metrics.clone(),
        )
        .unwrap();
        let b = Cache::single_node(
            store.clone() as Arc<dyn KeyValueStore>,
            CacheConfig {
                namespace: "b".into(),
                ..Default::default()
            },
            metrics,
        )
        .unwrap();

        a.set("k", "from-a", None, None).await;
        let from_b: Option<String> = b.get("k", None, None).await;
        assert_eq!(from_b, None);
        assert!(store.exists("a:k").await.unwrap());
    }

    #[tokio::test]
    async fn test_entry_metadata_records_codec_and_strategy() {
        let (cache, _, _) = cache_with(CacheConfig::default());
        cache.set("k", "v", None, Some(CodecKind::BinaryObject)).await;

        let entry = cache.get_entry("k").await.unwrap();
        assert_eq!(entry.metadata["codec"], "binary-object");
        assert_eq!(entry.metadata["strategy"], "write_through");

        // Stored codec wins over the configured default on read.
        let value: Option<String> = cache.get("k", None, None).await;
        assert_eq!(value, Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_compression_roundtrip() {
        let (cache, _, _) = cache_with(CacheConfig {
            compression: true,
            ..Default::default()
        });
        let value = serde_json::json!({"blob": "x".repeat(500)});
        assert!(cache.set("big", &value, None, None).await);
        let read: Option<serde_json::Value> = cache.get("big", None, None).await;
        assert_eq!(read, Some(value));
    }

    #[tokio::test]
    async fn test_capacity_enforcement_fifo() {
        let (cache, _, metrics) = cache_with(CacheConfig {
            namespace: "cap".into(),
            eviction: EvictionPolicyKind::Fifo,
            max_size: Some(2),
            ..Default::default()
        });

        cache.set("k1", "v1", None, None).await;
        cache.set("k2", "v2", None, None).await;
        cache.set("k3", "v3", None, None).await;

        let k1: Option<String> = cache.get("k1", None, None).await;
        let k2: Option<String> = cache.get("k2", None, None).await;
        let k3: Option<String> = cache.get("k3", None, None).await;
        assert_eq!(k1, None);
        assert_eq!(k2, Some("v2".to_string()));
        assert_eq!(k3, Some("v3".to_string()));
        assert_eq!(
            metrics.counter_value("cache_evictions", &[("policy", "fifo")]),
            1.0
        );
    }

    #[tokio::test]
    async fn test_write_behind_defers_store_write() {
        let (cache, store, _) = cache_with(CacheConfig {
            write_mode: WriteMode::WriteBehind,
            write_interval: Duration::from_millis(30),
            ..Default::default()
        });
        cache.start().await;

        assert!(cache.set("wb", "value", None, None).await);
        // Not yet in the store; buffered.
        assert!(!store.exists("default:wb").await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.exists("default:wb").await.unwrap());
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_clear_namespace_counts() {
        let (cache, store, _) = cache_with(CacheConfig {
            namespace: "wipe".into(),
            ..Default::default()
        });
        for i in 0..5 {
            cache.set(&format!("k{i}"), &i, None, None).await;
        }
        store.set("other:k", b"keep", None).await.unwrap();

        assert_eq!(cache.clear(None).await, 5);
        assert!(store.exists("other:k").await.unwrap());
    }

    #[tokio::test]
    async fn test_read_path_swallows_decode_errors() {
        let (cache, store, metrics) = cache_with(CacheConfig::default());
        store
            .set("default:corrupt", b"not-an-envelope", None)
            .await
            .unwrap();

        let value = cache.get("corrupt", Some("safe".to_string()), None).await;
        assert_eq!(value, Some("safe".to_string()));
        assert!(
            metrics.counter_value(
                "cache_errors_total",
                &[("operation", "get"), ("namespace", "default")]
            ) >= 1.0
        );
    }

    #[tokio::test]
    async fn test_access_count_increments_on_reads() {
        let (cache, _, _) = cache_with(CacheConfig::default());
        cache.set("k", "v", None, None).await;
        let _: Option<String> = cache.get("k", None, None).await;
        let _: Option<String> = cache.get("k", None, None).await;

        let entry = cache.get_entry("k").await.unwrap();
        assert_eq!(entry.access_count, 2);
        assert!(entry.last_accessed.is_some());
    }
}
