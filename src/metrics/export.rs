//! Metrics export formats
//!
//! Two consumers: a structured JSON document for dashboards and a line-based
//! text exposition with `# HELP` / `# TYPE` headers for scrape-style
//! collectors.

use chrono::{DateTime, Utc};
use serde_json::json;

use super::{MetricKind, MetricsSink};

impl MetricsSink {
    /// Structured JSON export over an optional time range, keyed by metric
    /// type, then series key.
    pub fn export_json(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> serde_json::Value {
        let snapshot = self.snapshot();
        let mut by_type = serde_json::Map::new();
        for kind in MetricKind::ALL {
            let Some(by_key) = snapshot.get(&kind) else {
                continue;
            };
            let mut series = serde_json::Map::new();
            for (key, points) in by_key {
                let filtered: Vec<_> = points
                    .iter()
                    .filter(|p| start.is_none_or(|s| p.timestamp >= s))
                    .filter(|p| end.is_none_or(|e| p.timestamp <= e))
                    .map(|p| {
                        json!({
                            "value": p.value,
                            "timestamp": p.timestamp.to_rfc3339(),
                            "tags": p.tags,
                        })
                    })
                    .collect();
                if !filtered.is_empty() {
                    series.insert(key.clone(), serde_json::Value::Array(filtered));
                }
            }
            by_type.insert(kind.as_str().to_string(), serde_json::Value::Object(series));
        }
        serde_json::Value::Object(by_type)
    }

    /// Text exposition: one `# HELP`/`# TYPE` pair per metric name, then one
    /// line per series with its label set and latest value.
    pub fn export_text(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();
        for kind in MetricKind::ALL {
            let Some(by_key) = snapshot.get(&kind) else {
                continue;
            };
            let mut keys: Vec<_> = by_key.keys().collect();
            keys.sort();

            let mut last_name = String::new();
            for key in keys {
                let Some(points) = by_key.get(key) else {
                    continue;
                };
                let Some(latest) = points.iter().max_by_key(|p| p.timestamp) else {
                    continue;
                };
                let name = base_name(key);
                if name != last_name {
                    out.push_str(&format!("# HELP {name} {name}\n"));
                    out.push_str(&format!("# TYPE {name} {}\n", exposition_type(kind)));
                    last_name = name.to_string();
                }
                if latest.tags.is_empty() {
                    out.push_str(&format!("{name} {}\n", latest.value));
                } else {
                    let labels = latest
                        .tags
                        .iter()
                        .map(|(k, v)| format!("{k}=\"{v}\""))
                        .collect::<Vec<_>>()
                        .join(",");
                    out.push_str(&format!("{name}{{{labels}}} {}\n", latest.value));
                }
            }
        }
        out
    }
}

fn base_name(series_key: &str) -> &str {
    series_key.split('[').next().unwrap_or(series_key)
}

fn exposition_type(kind: MetricKind) -> &'static str {
    match kind {
        MetricKind::Counter => "counter",
        MetricKind::Gauge => "gauge",
        MetricKind::Histogram | MetricKind::Timer => "histogram",
        MetricKind::Summary => "summary",
    }
}

#[cfg(test)]
mod tests {
    use super::super::MetricsConfig;
    use super::*;

    #[test]
    fn test_json_export_structure() {
        let sink = MetricsSink::new(MetricsConfig::default());
        sink.increment_counter("hits", 1.0, &[("ns", "users")]);
        sink.gauge("depth", 4.0, &[]);

        let doc = sink.export_json(None, None);
        let counters = doc.get("counter").unwrap().as_object().unwrap();
        assert!(counters.contains_key("hits[ns=users]"));
        let gauges = doc.get("gauge").unwrap().as_object().unwrap();
        assert_eq!(gauges["depth"][0]["value"], 4.0);
    }

    #[test]
    fn test_json_export_time_filter_excludes_future_range() {
        let sink = MetricsSink::new(MetricsConfig::default());
        sink.increment_counter("hits", 1.0, &[]);
        let future = Utc::now() + chrono::Duration::hours(1);
        let doc = sink.export_json(Some(future), None);
        assert!(doc["counter"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_text_exposition_headers_and_labels() {
        let sink = MetricsSink::new(MetricsConfig::default());
        sink.increment_counter("cache_hits_total", 3.0, &[("namespace", "users")]);
        sink.timing("op_seconds", std::time::Duration::from_millis(250), &[]);

        let text = sink.export_text();
        assert!(text.contains("# HELP cache_hits_total cache_hits_total"));
        assert!(text.contains("# TYPE cache_hits_total counter"));
        assert!(text.contains("cache_hits_total{namespace=\"users\"} 3"));
        assert!(text.contains("# TYPE op_seconds histogram"));
    }
}
