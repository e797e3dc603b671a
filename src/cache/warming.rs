//! Predictive cache warming
//!
//! Registered glob patterns are warmed once a minute: each enabled strategy
//! nominates candidate keys, the union is capped at the pattern's batch
//! size, and every candidate is fetched through the caller-supplied fetch
//! function and written back with the pattern's TTL. A nil fetch result
//! means "no value; do not cache". Warming never evicts, and the eviction
//! layer is free to reclaim a warmed entry immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info};
use regex::Regex;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::access::AccessPatternTracker;
use super::codec::{encode_envelope, CodecKind};
use super::eviction::EvictionPolicy;
use super::types::StoredEntry;
use super::Backend;
use crate::error::{Error, Result};
use crate::metrics::MetricsSink;

/// Caller-supplied source of truth for warmed keys. Implementations must be
/// idempotent and safe to call concurrently; errors are logged and treated
/// as "no value".
#[async_trait]
pub trait WarmFetcher: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Option<serde_json::Value>>;
}

/// Per-pattern warming parameters.
#[derive(Debug, Clone)]
pub struct WarmPatternConfig {
    /// TTL applied to warmed entries
    pub ttl: Duration,
    /// Warm keys predicted to be read within this window
    pub warm_window: Duration,
    /// Upper bound on keys warmed per cycle
    pub batch_size: usize,
    /// Co-occurrence threshold for related-key warming
    pub related_threshold: f64,
    /// Seasonal score threshold
    pub seasonal_threshold: f64,
    /// Minimum time between warms of the same pattern
    pub warm_interval: Duration,
}

impl Default for WarmPatternConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            warm_window: Duration::from_secs(300),
            batch_size: 100,
            related_threshold: 0.8,
            seasonal_threshold: 0.7,
            warm_interval: Duration::from_secs(3600),
        }
    }
}

/// A strategy nominates keys worth prefetching for one pattern.
#[async_trait]
pub trait WarmingStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn candidates(&self, pattern: &Regex, config: &WarmPatternConfig)
        -> Result<Vec<String>>;
}

/// Build strategies from configured names. `hybrid` expands to the union of
/// all three.
pub(crate) fn create_warming_strategies(
    names: &[String],
    tracker: Arc<AccessPatternTracker>,
    backend: Arc<Backend>,
) -> Result<Vec<Box<dyn WarmingStrategy>>> {
    let mut strategies: Vec<Box<dyn WarmingStrategy>> = Vec::new();
    for name in names {
        match name.as_str() {
            "time" => strategies.push(Box::new(TimeBasedWarming {
                tracker: tracker.clone(),
            })),
            "related" => strategies.push(Box::new(RelatedKeyWarming {
                tracker: tracker.clone(),
                backend: backend.clone(),
            })),
            "seasonal" => strategies.push(Box::new(SeasonalWarming {
                tracker: tracker.clone(),
                backend: backend.clone(),
            })),
            "hybrid" => {
                return create_warming_strategies(
                    &["time".into(), "related".into(), "seasonal".into()],
                    tracker,
                    backend,
                )
            }
            other => {
                return Err(Error::Config(format!("unknown warming strategy: {other}")));
            }
        }
    }
    Ok(strategies)
}

/// Keys whose predicted next access lands inside the warm window.
struct TimeBasedWarming {
    tracker: Arc<AccessPatternTracker>,
}

#[async_trait]
impl WarmingStrategy for TimeBasedWarming {
    fn name(&self) -> &'static str {
        "time"
    }

    async fn candidates(
        &self,
        pattern: &Regex,
        config: &WarmPatternConfig,
    ) -> Result<Vec<String>> {
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        let window = config.warm_window.as_secs_f64();
        let mut candidates = Vec::new();
        for key in self.tracker.keys_matching(pattern) {
            if let Some(predicted) = self.tracker.predict_next_access(&key) {
                let lead = predicted - now;
                if (0.0..=window).contains(&lead) {
                    candidates.push(key);
                }
            }
        }
        Ok(candidates)
    }
}

/// Missing keys strongly co-accessed with a key that is present.
struct RelatedKeyWarming {
    tracker: Arc<AccessPatternTracker>,
    backend: Arc<Backend>,
}

#[async_trait]
impl WarmingStrategy for RelatedKeyWarming {
    fn name(&self) -> &'static str {
        "related"
    }

    async fn candidates(
        &self,
        pattern: &Regex,
        config: &WarmPatternConfig,
    ) -> Result<Vec<String>> {
        let mut candidates = Vec::new();
        for key in self.tracker.keys_matching(pattern) {
            if !self.backend.exists(&key).await.unwrap_or(false) {
                continue;
            }
            for related in self.tracker.related_keys(&key, config.related_threshold) {
                if !self.backend.exists(&related).await.unwrap_or(false) {
                    candidates.push(related);
                }
            }
        }
        Ok(candidates)
    }
}

/// Missing keys whose seasonal profile says "now" is a hot time.
struct SeasonalWarming {
    tracker: Arc<AccessPatternTracker>,
    backend: Arc<Backend>,
}

#[async_trait]
impl WarmingStrategy for SeasonalWarming {
    fn name(&self) -> &'static str {
        "seasonal"
    }

    async fn candidates(
        &self,
        pattern: &Regex,
        config: &WarmPatternConfig,
    ) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut candidates = Vec::new();
        for key in self.tracker.keys_matching(pattern) {
            if self.backend.exists(&key).await.unwrap_or(true) {
                continue;
            }
            if let Some(score) = self.tracker.seasonal_score(&key, now) {
                if score >= config.seasonal_threshold {
                    candidates.push(key);
                }
            }
        }
        Ok(candidates)
    }
}

struct RegisteredPattern {
    raw: String,
    regex: Regex,
    config: WarmPatternConfig,
    last_warm: Option<Instant>,
}

/// Background prefetcher driving the registered patterns.
pub struct WarmingEngine {
    patterns: Mutex<Vec<RegisteredPattern>>,
    strategies: Vec<Box<dyn WarmingStrategy>>,
    fetcher: Arc<dyn WarmFetcher>,
    backend: Arc<Backend>,
    policy: Arc<dyn EvictionPolicy>,
    metrics: Arc<MetricsSink>,
    codec: CodecKind,
    compression: bool,
    tick: Duration,
    shutdown: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WarmingEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        strategies: Vec<Box<dyn WarmingStrategy>>,
        fetcher: Arc<dyn WarmFetcher>,
        backend: Arc<Backend>,
        policy: Arc<dyn EvictionPolicy>,
        metrics: Arc<MetricsSink>,
        codec: CodecKind,
        compression: bool,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            patterns: Mutex::new(Vec::new()),
            strategies,
            fetcher,
            backend,
            policy,
            metrics,
            codec,
            compression,
            tick: Duration::from_secs(60),
            shutdown,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Register a glob pattern (full namespaced key space) for warming.
    pub async fn register_pattern(&self, pattern: &str, config: WarmPatternConfig) -> Result<()> {
        let regex = crate::store::glob_to_regex(pattern)?;
        let mut patterns = self.patterns.lock().await;
        patterns.push(RegisteredPattern {
            raw: pattern.to_string(),
            regex,
            config,
            last_warm: None,
        });
        Ok(())
    }

    /// Spawn the per-minute warming ticker.
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => engine.run_cycle().await,
                    _ = shutdown.changed() => return,
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn run_cycle(&self) {
        let due: Vec<usize> = {
            let patterns = self.patterns.lock().await;
            patterns
                .iter()
                .enumerate()
                .filter(|(_, p)| {
                    p.last_warm
                        .map(|at| at.elapsed() >= p.config.warm_interval)
                        .unwrap_or(true)
                })
                .map(|(i, _)| i)
                .collect()
        };
        for index in due {
            if let Err(e) = self.warm_index(index).await {
                error!("Warming cycle failed: {e}");
            }
        }
    }

    /// Warm one registered pattern immediately, ignoring its interval gate.
    /// Returns the number of entries written.
    pub async fn warm_now(&self, pattern: &str) -> Result<usize> {
        let index = {
            let patterns = self.patterns.lock().await;
            patterns
                .iter()
                .position(|p| p.raw == pattern)
                .ok_or_else(|| Error::Config(format!("unknown warming pattern: {pattern}")))?
        };
        self.warm_index(index).await
    }

    async fn warm_index(&self, index: usize) -> Result<usize> {
        let (raw, regex, config) = {
            let patterns = self.patterns.lock().await;
            let p = &patterns[index];
            (p.raw.clone(), p.regex.clone(), p.config.clone())
        };

        let mut seen = std::collections::HashSet::new();
        let mut candidates = Vec::new();
        for strategy in &self.strategies {
            match strategy.candidates(&regex, &config).await {
                Ok(keys) => {
                    for key in keys {
                        if seen.insert(key.clone()) {
                            candidates.push(key);
                        }
                    }
                }
                Err(e) => debug!("Warming strategy {} failed: {e}", strategy.name()),
            }
            if candidates.len() >= config.batch_size {
                break;
            }
        }
        candidates.truncate(config.batch_size);

        let mut warmed = 0usize;
        for key in candidates {
            let value = match self.fetcher.fetch(&key).await {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(e) => {
                    error!("Warming fetch failed for {key}: {e}");
                    continue;
                }
            };
            if let Err(e) = self.write_warmed(&key, &value, config.ttl).await {
                error!("Warming write failed for {key}: {e}");
                continue;
            }
            warmed += 1;
        }

        {
            let mut patterns = self.patterns.lock().await;
            if let Some(p) = patterns.get_mut(index) {
                p.last_warm = Some(Instant::now());
            }
        }
        if warmed > 0 {
            info!("Warmed {warmed} keys for pattern {raw}");
        }
        self.metrics
            .increment_counter("cache_warm", warmed as f64, &[("pattern", &raw)]);
        Ok(warmed)
    }

    async fn write_warmed(&self, key: &str, value: &serde_json::Value, ttl: Duration) -> Result<()> {
        let payload = self.codec.encode(value)?;
        let entry = StoredEntry::new(payload, Some(ttl))
            .with_metadata("codec", self.codec.as_str())
            .with_metadata("strategy", "warming");
        let bytes = encode_envelope(&entry, self.compression)?;
        self.backend.write(key, &bytes, Some(ttl)).await?;
        self.policy.record_access(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::codec::decode_envelope;
    use crate::cache::eviction::create_policy;
    use crate::cache::types::EvictionPolicyKind;
    use crate::cache::AccessTrackerConfig;
    use crate::metrics::MetricsConfig;
    use crate::store::{KeyValueStore, MemoryStore};

    struct MapFetcher {
        values: std::collections::HashMap<String, serde_json::Value>,
    }

    #[async_trait]
    impl WarmFetcher for MapFetcher {
        async fn fetch(&self, key: &str) -> Result<Option<serde_json::Value>> {
            Ok(self.values.get(key).cloned())
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl WarmFetcher for FailingFetcher {
        async fn fetch(&self, _key: &str) -> Result<Option<serde_json::Value>> {
            Err(Error::StoreUnavailable("origin down".into()))
        }
    }

    struct Fixture {
        engine: Arc<WarmingEngine>,
        tracker: Arc<AccessPatternTracker>,
        store: Arc<MemoryStore>,
    }

    fn fixture(fetcher: Arc<dyn WarmFetcher>, strategy_names: &[&str]) -> Fixture {
        let store = MemoryStore::shared();
        let backend = Arc::new(Backend::Single(store.clone() as Arc<dyn KeyValueStore>));
        let tracker = Arc::new(AccessPatternTracker::new(AccessTrackerConfig {
            window: Duration::from_secs(7 * 24 * 3600),
            ..Default::default()
        }));
        let names: Vec<String> = strategy_names.iter().map(|s| s.to_string()).collect();
        let strategies =
            create_warming_strategies(&names, tracker.clone(), backend.clone()).unwrap();
        let policy = create_policy(
            EvictionPolicyKind::Lru,
            store.clone() as Arc<dyn KeyValueStore>,
            "t",
        );
        let engine = WarmingEngine::new(
            strategies,
            fetcher,
            backend,
            policy,
            MetricsSink::new(MetricsConfig::default()),
            CodecKind::Json,
            false,
        );
        Fixture {
            engine,
            tracker,
            store,
        }
    }

    fn map_fetcher(pairs: &[(&str, serde_json::Value)]) -> Arc<dyn WarmFetcher> {
        Arc::new(MapFetcher {
            values: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        })
    }

    #[tokio::test]
    async fn test_time_based_warming_prefetches_predicted_key() {
        let fetcher = map_fetcher(&[("app:periodic", serde_json::json!({"warm": true}))]);
        let fx = fixture(fetcher, &["time"]);
        fx.engine
            .register_pattern("app:*", WarmPatternConfig::default())
            .await
            .unwrap();

        // Evenly spaced accesses ending now, next predicted inside the window.
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        for i in (0..5).rev() {
            fx.tracker
                .record_access_at("app:periodic", now - i as f64 * 120.0);
        }

        let warmed = fx.engine.warm_now("app:*").await.unwrap();
        assert_eq!(warmed, 1);

        let stored = fx.store.get("app:periodic").await.unwrap().unwrap();
        let entry = decode_envelope(&stored, false).unwrap();
        assert_eq!(entry.metadata["strategy"], "warming");
        let value: serde_json::Value = CodecKind::Json.decode(&entry.payload).unwrap();
        assert_eq!(value, serde_json::json!({"warm": true}));
    }

    #[tokio::test]
    async fn test_related_warming_fills_missing_partner() {
        let fetcher = map_fetcher(&[("app:b", serde_json::json!("b-value"))]);
        let fx = fixture(fetcher, &["related"]);
        fx.engine
            .register_pattern("app:*", WarmPatternConfig::default())
            .await
            .unwrap();

        // a and b co-accessed; only a is present in the store.
        for i in 0..5 {
            let t = 1000.0 + i as f64 * 30.0;
            fx.tracker.record_access_at("app:a", t);
            fx.tracker.record_access_at("app:b", t + 0.5);
        }
        fx.store.set("app:a", b"here", None).await.unwrap();

        let warmed = fx.engine.warm_now("app:*").await.unwrap();
        assert_eq!(warmed, 1);
        assert!(fx.store.get("app:b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_nil_fetch_is_not_cached() {
        let fetcher = map_fetcher(&[]);
        let fx = fixture(fetcher, &["time"]);
        fx.engine
            .register_pattern("app:*", WarmPatternConfig::default())
            .await
            .unwrap();

        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        for i in (0..5).rev() {
            fx.tracker.record_access_at("app:gone", now - i as f64 * 60.0);
        }

        let warmed = fx.engine.warm_now("app:*").await.unwrap();
        assert_eq!(warmed, 0);
        assert!(fx.store.get("app:gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_errors_do_not_stop_the_batch() {
        let fx = fixture(Arc::new(FailingFetcher), &["time"]);
        fx.engine
            .register_pattern("app:*", WarmPatternConfig::default())
            .await
            .unwrap();

        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        for key in ["app:k1", "app:k2"] {
            for i in (0..5).rev() {
                fx.tracker.record_access_at(key, now - i as f64 * 60.0);
            }
        }

        let warmed = fx.engine.warm_now("app:*").await.unwrap();
        assert_eq!(warmed, 0);
    }

    #[tokio::test]
    async fn test_batch_size_caps_candidates() {
        let pairs: Vec<(String, serde_json::Value)> = (0..10)
            .map(|i| (format!("app:k{i}"), serde_json::json!(i)))
            .collect();
        let fetcher: Arc<dyn WarmFetcher> = Arc::new(MapFetcher {
            values: pairs.into_iter().collect(),
        });
        let fx = fixture(fetcher, &["time"]);
        fx.engine
            .register_pattern(
                "app:*",
                WarmPatternConfig {
                    batch_size: 3,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        for i in 0..10 {
            let key = format!("app:k{i}");
            for j in (0..5).rev() {
                fx.tracker.record_access_at(&key, now - j as f64 * 60.0);
            }
        }

        let warmed = fx.engine.warm_now("app:*").await.unwrap();
        assert_eq!(warmed, 3);
    }

    #[tokio::test]
    async fn test_unknown_strategy_name_is_config_error() {
        let store = MemoryStore::shared();
        let backend = Arc::new(Backend::Single(store as Arc<dyn KeyValueStore>));
        let tracker = Arc::new(AccessPatternTracker::new(AccessTrackerConfig::default()));
        let result = create_warming_strategies(&["ml".to_string()], tracker, backend);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
