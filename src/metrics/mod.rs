//! Metrics collection and retention
//!
//! Counters, gauges, histograms, timers, and summaries with tag support,
//! periodic aggregation, retention-based cleanup, statistical queries, and
//! optional JSON checkpointing. The sink is the one process-wide shared
//! observability structure; every core component records into it.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

pub mod export;

/// Metric kinds with distinct aggregation behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonically increasing value
    Counter,
    /// Point-in-time value
    Gauge,
    /// Distribution of values
    Histogram,
    /// Statistical summary
    Summary,
    /// Duration measurements
    Timer,
}

impl MetricKind {
    pub const ALL: [MetricKind; 5] = [
        MetricKind::Counter,
        MetricKind::Gauge,
        MetricKind::Histogram,
        MetricKind::Summary,
        MetricKind::Timer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
            MetricKind::Summary => "summary",
            MetricKind::Timer => "timer",
        }
    }
}

/// Sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enable_aggregation: bool,
    /// Points older than this are folded into one aggregate per series
    pub aggregation_interval: Duration,
    /// Points older than this are dropped by the cleanup loop
    pub retention_period: Duration,
    /// Checkpoint file; `None` disables persistence
    pub storage_path: Option<PathBuf>,
    /// Tags beyond this count are truncated
    pub max_tags: usize,
    /// Maximum series per metric kind; the series with the oldest
    /// oldest-sample is dropped when exceeded
    pub max_metrics: usize,
    /// Percentiles reported by stats queries, e.g. `[0.5, 0.95, 0.99]`
    pub percentiles: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enable_aggregation: true,
            aggregation_interval: Duration::from_secs(60),
            retention_period: Duration::from_secs(24 * 60 * 60),
            storage_path: None,
            max_tags: 10,
            max_metrics: 1000,
            percentiles: vec![0.5, 0.9, 0.95, 0.99],
        }
    }
}

/// A recorded sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Statistics over a filtered series.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub stddev: f64,
    pub percentiles: BTreeMap<String, f64>,
}

type SeriesMap = HashMap<MetricKind, HashMap<String, Vec<MetricPoint>>>;

/// Metrics sink with bounded memory and background maintenance.
pub struct MetricsSink {
    config: MetricsConfig,
    series: Mutex<SeriesMap>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl MetricsSink {
    pub fn new(config: MetricsConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            series: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        })
    }

    /// Load persisted state and spawn the aggregation/cleanup loops.
    pub async fn start(self: &Arc<Self>) {
        if self.config.storage_path.is_some() {
            if let Err(e) = self.load_state().await {
                warn!("Failed to load metrics state: {e}");
            }
        }
        if self.config.enable_aggregation {
            let mut tasks = self.tasks.lock();
            tasks.push(self.spawn_aggregation_loop());
            tasks.push(self.spawn_cleanup_loop());
        }
    }

    /// Stop background loops and write a final checkpoint.
    pub async fn stop(self: &Arc<Self>) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        if self.config.storage_path.is_some() {
            if let Err(e) = self.save_state().await {
                error!("Failed to save metrics state: {e}");
            }
        }
    }

    pub fn increment_counter(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.record(MetricKind::Counter, name, value, tags);
    }

    pub fn gauge(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.record(MetricKind::Gauge, name, value, tags);
    }

    pub fn histogram(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.record(MetricKind::Histogram, name, value, tags);
    }

    pub fn summary(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        self.record(MetricKind::Summary, name, value, tags);
    }

    /// Record a duration in seconds.
    pub fn timing(&self, name: &str, elapsed: Duration, tags: &[(&str, &str)]) {
        self.record(MetricKind::Timer, name, elapsed.as_secs_f64(), tags);
    }

    /// Record a sample, truncating excess tags and enforcing the series cap.
    pub fn record(&self, kind: MetricKind, name: &str, value: f64, tags: &[(&str, &str)]) {
        let tags: BTreeMap<String, String> = tags
            .iter()
            .take(self.config.max_tags)
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let key = metric_key(name, &tags);

        let mut series = self.series.lock();
        let by_key = series.entry(kind).or_default();
        by_key.entry(key).or_default().push(MetricPoint {
            value,
            timestamp: Utc::now(),
            tags,
        });

        if by_key.len() > self.config.max_metrics {
            let oldest = by_key
                .iter()
                .min_by_key(|(_, points)| points.iter().map(|p| p.timestamp).min())
                .map(|(k, _)| k.clone());
            if let Some(key) = oldest {
                debug!("Metric series cap reached, dropping {key}");
                by_key.remove(&key);
            }
        }
    }

    /// Points for one series, optionally bounded by a time range.
    pub fn points(
        &self,
        kind: MetricKind,
        name: &str,
        tags: &[(&str, &str)],
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<MetricPoint> {
        let tags: BTreeMap<String, String> = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let key = metric_key(name, &tags);
        let series = self.series.lock();
        series
            .get(&kind)
            .and_then(|by_key| by_key.get(&key))
            .map(|points| {
                points
                    .iter()
                    .filter(|p| start.is_none_or(|s| p.timestamp >= s))
                    .filter(|p| end.is_none_or(|e| p.timestamp <= e))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Count/min/max/mean/median/stddev and configured percentiles over a
    /// filtered time range. Returns `None` for an empty series.
    pub fn stats(
        &self,
        kind: MetricKind,
        name: &str,
        tags: &[(&str, &str)],
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Option<MetricStats> {
        let points = self.points(kind, name, tags, start, end);
        if points.is_empty() {
            return None;
        }

        let mut values: Vec<f64> = points.iter().map(|p| p.value).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let median = if count % 2 == 0 {
            (values[count / 2 - 1] + values[count / 2]) / 2.0
        } else {
            values[count / 2]
        };
        let stddev = if count > 1 {
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
            var.sqrt()
        } else {
            0.0
        };

        let mut percentiles = BTreeMap::new();
        for &p in &self.config.percentiles {
            let rank = ((p * count as f64).ceil() as usize).clamp(1, count) - 1;
            percentiles.insert(format!("p{}", (p * 100.0).round() as u32), values[rank]);
        }

        Some(MetricStats {
            count,
            min: values[0],
            max: values[count - 1],
            mean,
            median,
            stddev,
            percentiles,
        })
    }

    /// Sum of a counter series over its retained points. Test and debugging
    /// convenience.
    pub fn counter_value(&self, name: &str, tags: &[(&str, &str)]) -> f64 {
        self.points(MetricKind::Counter, name, tags, None, None)
            .iter()
            .map(|p| p.value)
            .sum()
    }

    fn spawn_aggregation_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let sink = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sink.config.aggregation_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => sink.aggregate(),
                    _ = shutdown.changed() => return,
                }
            }
        })
    }

    fn spawn_cleanup_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let sink = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => sink.cleanup(),
                    _ = shutdown.changed() => return,
                }
            }
        })
    }

    /// Fold points older than the aggregation interval into one aggregate per
    /// series: sum for counters, mean for everything else.
    pub fn aggregate(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.aggregation_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut series = self.series.lock();
        for (kind, by_key) in series.iter_mut() {
            for points in by_key.values_mut() {
                let (old, recent): (Vec<MetricPoint>, Vec<MetricPoint>) =
                    points.drain(..).partition(|p| p.timestamp < cutoff);
                *points = recent;
                if old.is_empty() {
                    continue;
                }
                let value = match kind {
                    MetricKind::Counter => old.iter().map(|p| p.value).sum(),
                    _ => old.iter().map(|p| p.value).sum::<f64>() / old.len() as f64,
                };
                points.insert(
                    0,
                    MetricPoint {
                        value,
                        timestamp: cutoff,
                        tags: old[0].tags.clone(),
                    },
                );
            }
        }
    }

    /// Drop points older than the retention period and any emptied series.
    pub fn cleanup(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention_period)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut series = self.series.lock();
        for by_key in series.values_mut() {
            by_key.retain(|_, points| {
                points.retain(|p| p.timestamp >= cutoff);
                !points.is_empty()
            });
        }
    }

    pub(crate) fn snapshot(&self) -> SeriesMap {
        self.series.lock().clone()
    }

    async fn save_state(&self) -> Result<()> {
        let Some(path) = &self.config.storage_path else {
            return Ok(());
        };
        let snapshot = self.snapshot();
        let by_type: BTreeMap<&str, &HashMap<String, Vec<MetricPoint>>> = snapshot
            .iter()
            .map(|(kind, by_key)| (kind.as_str(), by_key))
            .collect();
        let json = serde_json::to_vec(&by_type)
            .map_err(|e| Error::Serialization(format!("metrics checkpoint: {e}")))?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("metrics checkpoint write: {e}")))
    }

    async fn load_state(&self) -> Result<()> {
        let Some(path) = &self.config.storage_path else {
            return Ok(());
        };
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(Error::StoreUnavailable(format!(
                    "metrics checkpoint read: {e}"
                )))
            }
        };
        let by_type: HashMap<String, HashMap<String, Vec<MetricPoint>>> =
            serde_json::from_slice(&bytes)
                .map_err(|e| Error::Serialization(format!("metrics checkpoint: {e}")))?;

        let mut series = self.series.lock();
        for (type_name, by_key) in by_type {
            let kind = match type_name.as_str() {
                "counter" => MetricKind::Counter,
                "gauge" => MetricKind::Gauge,
                "histogram" => MetricKind::Histogram,
                "summary" => MetricKind::Summary,
                "timer" => MetricKind::Timer,
                other => {
                    warn!("Skipping unknown metric type in checkpoint: {other}");
                    continue;
                }
            };
            series.entry(kind).or_default().extend(by_key);
        }
        Ok(())
    }
}

/// Series key: `name` or `name[k1=v1,k2=v2]` with tags sorted by key.
pub(crate) fn metric_key(name: &str, tags: &BTreeMap<String, String>) -> String {
    if tags.is_empty() {
        return name.to_string();
    }
    let tag_str = tags
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("{name}[{tag_str}]")
}
