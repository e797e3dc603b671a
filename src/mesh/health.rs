//! Health trend analysis
//!
//! Keeps a bounded history of health scores per (service, instance), fits a
//! least-squares line over it, and derives the trend direction, an R²
//! confidence, minute-step predictions, and the estimated time until the
//! score crosses the alert threshold. The circuit breaker's health strategy
//! and the adaptive load balancer both steer off these trends.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Direction of a health score trend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Improving,
    Stable,
    Degrading,
    Unknown,
}

/// Analyzer configuration.
#[derive(Debug, Clone)]
pub struct HealthTrendConfig {
    /// Samples older than this are discarded
    pub window: Duration,
    /// Minimum samples before a trend is reported
    pub min_points: usize,
    /// Slope at or below which the trend is degrading (per second)
    pub degradation_threshold: f64,
    /// Slope at or above which the trend is improving (per second)
    pub improvement_threshold: f64,
    /// Number of one-minute prediction steps
    pub prediction_horizon: usize,
    /// Score whose crossing is estimated
    pub alert_threshold: f64,
}

impl Default for HealthTrendConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3600),
            min_points: 10,
            degradation_threshold: -0.1,
            improvement_threshold: 0.1,
            prediction_horizon: 30,
            alert_threshold: 0.5,
        }
    }
}

/// Result of a trend analysis.
#[derive(Debug, Clone)]
pub struct HealthTrend {
    pub direction: TrendDirection,
    /// Fitted slope, score units per second
    pub slope: f64,
    pub intercept: f64,
    /// R² of the fit, 0 when unknown
    pub confidence: f64,
    /// Predicted scores at one-minute steps, clipped to [0, 1]
    pub predictions: Vec<f64>,
    /// Seconds until the score crosses the alert threshold, when the trend
    /// implies a future crossing
    pub time_to_threshold: Option<f64>,
    pub data_points: usize,
}

impl HealthTrend {
    fn unknown(data_points: usize) -> Self {
        Self {
            direction: TrendDirection::Unknown,
            slope: 0.0,
            intercept: 0.0,
            confidence: 0.0,
            predictions: Vec::new(),
            time_to_threshold: None,
            data_points,
        }
    }

    /// Last predicted score, or `None` without predictions.
    pub fn predicted_score(&self) -> Option<f64> {
        self.predictions.last().copied()
    }
}

/// Per-service summary across instances.
#[derive(Debug, Clone)]
pub struct ServiceHealthSummary {
    pub service: String,
    pub overall: TrendDirection,
    pub confidence: f64,
    pub instances: HashMap<String, HealthTrend>,
}

/// Sliding-window health score analyzer.
pub struct HealthTrendAnalyzer {
    config: HealthTrendConfig,
    history: Mutex<HashMap<String, Vec<(f64, f64)>>>,
}

impl HealthTrendAnalyzer {
    pub fn new(config: HealthTrendConfig) -> Self {
        Self {
            config,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Record a health score sample at the current time. Scores are clamped
    /// to [0, 1].
    pub fn record(&self, service: &str, instance: &str, score: f64) {
        self.record_at(
            service,
            instance,
            Utc::now().timestamp_millis() as f64 / 1000.0,
            score,
        );
    }

    /// Record at an explicit epoch-seconds timestamp.
    pub fn record_at(&self, service: &str, instance: &str, timestamp: f64, score: f64) {
        let key = history_key(service, instance);
        let cutoff = timestamp - self.config.window.as_secs_f64();
        let mut history = self.history.lock();
        let samples = history.entry(key).or_default();
        samples.push((timestamp, score.clamp(0.0, 1.0)));
        samples.retain(|(t, _)| *t > cutoff);
    }

    /// Fit a trend for one instance. Returns `unknown` below `min_points`.
    pub fn analyze(&self, service: &str, instance: &str) -> HealthTrend {
        let samples = {
            let history = self.history.lock();
            history
                .get(&history_key(service, instance))
                .cloned()
                .unwrap_or_default()
        };
        if samples.len() < self.config.min_points {
            return HealthTrend::unknown(samples.len());
        }

        let t0 = samples[0].0;
        let xs: Vec<f64> = samples.iter().map(|(t, _)| t - t0).collect();
        let ys: Vec<f64> = samples.iter().map(|(_, s)| *s).collect();

        let Some((slope, intercept)) = least_squares(&xs, &ys) else {
            return HealthTrend::unknown(samples.len());
        };
        let confidence = r_squared(&xs, &ys, slope, intercept);

        let direction = if slope >= self.config.improvement_threshold {
            TrendDirection::Improving
        } else if slope <= self.config.degradation_threshold {
            TrendDirection::Degrading
        } else {
            TrendDirection::Stable
        };

        let last_x = *xs.last().unwrap_or(&0.0);
        let predictions: Vec<f64> = (1..=self.config.prediction_horizon)
            .map(|i| (slope * (last_x + i as f64 * 60.0) + intercept).clamp(0.0, 1.0))
            .collect();

        let current = *ys.last().unwrap_or(&0.0);
        let time_to_threshold =
            threshold_crossing(slope, current, self.config.alert_threshold);

        HealthTrend {
            direction,
            slope,
            intercept,
            confidence,
            predictions,
            time_to_threshold,
            data_points: samples.len(),
        }
    }

    /// Trend summary over every recorded instance of a service; the highest
    /// confidence instance sets the overall direction.
    pub fn service_summary(&self, service: &str) -> ServiceHealthSummary {
        let prefix = format!("{service}:");
        let instance_names: Vec<String> = {
            let history = self.history.lock();
            history
                .keys()
                .filter_map(|k| k.strip_prefix(&prefix).map(|s| s.to_string()))
                .collect()
        };

        let mut overall = TrendDirection::Stable;
        let mut confidence = 0.0;
        let mut instances = HashMap::new();
        for instance in instance_names {
            let trend = self.analyze(service, &instance);
            if trend.confidence > confidence {
                confidence = trend.confidence;
                overall = trend.direction;
            }
            instances.insert(instance, trend);
        }

        ServiceHealthSummary {
            service: service.to_string(),
            overall,
            confidence,
            instances,
        }
    }

    pub fn sample_count(&self, service: &str, instance: &str) -> usize {
        self.history
            .lock()
            .get(&history_key(service, instance))
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

fn history_key(service: &str, instance: &str) -> String {
    format!("{service}:{instance}")
}

fn least_squares(xs: &[f64], ys: &[f64]) -> Option<(f64, f64)> {
    let n = xs.len() as f64;
    let sum_x: f64 = xs.iter().sum();
    let sum_y: f64 = ys.iter().sum();
    let sum_xy: f64 = xs.iter().zip(ys).map(|(x, y)| x * y).sum();
    let sum_xx: f64 = xs.iter().map(|x| x * x).sum();

    let denom = n * sum_xx - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        return None;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / n;
    Some((slope, intercept))
}

fn r_squared(xs: &[f64], ys: &[f64], slope: f64, intercept: f64) -> f64 {
    let mean_y = ys.iter().sum::<f64>() / ys.len() as f64;
    let ss_res: f64 = xs
        .iter()
        .zip(ys)
        .map(|(x, y)| (y - (slope * x + intercept)).powi(2))
        .sum();
    let ss_tot: f64 = ys.iter().map(|y| (y - mean_y).powi(2)).sum();
    if ss_tot == 0.0 {
        return 0.0;
    }
    (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
}

/// Seconds until the fitted line crosses `threshold` from the current
/// score, when the slope points at it.
fn threshold_crossing(slope: f64, current: f64, threshold: f64) -> Option<f64> {
    if slope == 0.0 {
        return None;
    }
    let crossing_ahead = (slope > 0.0 && current < threshold)
        || (slope < 0.0 && current > threshold);
    if !crossing_ahead {
        return None;
    }
    let t = (threshold - current) / slope;
    (t > 0.0).then_some(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> HealthTrendAnalyzer {
        HealthTrendAnalyzer::new(HealthTrendConfig::default())
    }

    fn record_series(analyzer: &HealthTrendAnalyzer, scores: &[f64], step: f64) {
        let base = 1_000_000.0;
        for (i, score) in scores.iter().enumerate() {
            analyzer.record_at("svc", "i1", base + i as f64 * step, *score);
        }
    }

    #[test]
    fn test_unknown_below_min_points() {
        let analyzer = analyzer();
        record_series(&analyzer, &[0.9; 5], 1.0);
        let trend = analyzer.analyze("svc", "i1");
        assert_eq!(trend.direction, TrendDirection::Unknown);
        assert_eq!(trend.confidence, 0.0);
    }

    #[test]
    fn test_degrading_trend_detected() {
        let analyzer = analyzer();
        // Falling 0.12/s, well past the degradation threshold.
        let scores: Vec<f64> = (0..12).map(|i| 1.0 - i as f64 * 0.12).collect();
        record_series(&analyzer, &scores, 1.0);

        let trend = analyzer.analyze("svc", "i1");
        assert_eq!(trend.direction, TrendDirection::Degrading);
        assert!(trend.confidence > 0.9);
        assert!(trend.slope < -0.1);
    }

    #[test]
    fn test_stable_trend_for_flat_scores() {
        let analyzer = analyzer();
        record_series(&analyzer, &[0.85; 15], 10.0);
        let trend = analyzer.analyze("svc", "i1");
        assert_eq!(trend.direction, TrendDirection::Stable);
        assert!(trend.slope.abs() < 1e-9);
    }

    #[test]
    fn test_predictions_are_clipped() {
        let analyzer = analyzer();
        let scores: Vec<f64> = (0..12).map(|i| 1.0 - i as f64 * 0.12).collect();
        record_series(&analyzer, &scores, 1.0);

        let trend = analyzer.analyze("svc", "i1");
        assert_eq!(trend.predictions.len(), 30);
        assert!(trend
            .predictions
            .iter()
            .all(|p| (0.0..=1.0).contains(p)));
        // A steep fall predicts zero within the horizon.
        assert_eq!(trend.predicted_score(), Some(0.0));
    }

    #[test]
    fn test_time_to_threshold_for_degrading_series() {
        let analyzer = analyzer();
        // From 1.0 falling ~0.02/s; currently above the 0.5 threshold.
        let scores: Vec<f64> = (0..12).map(|i| 1.0 - i as f64 * 0.02).collect();
        record_series(&analyzer, &scores, 1.0);

        let trend = analyzer.analyze("svc", "i1");
        let tts = trend.time_to_threshold.expect("crossing expected");
        // current = 0.78, slope = -0.02 → ~14 s to 0.5
        assert!((tts - 14.0).abs() < 2.0);
    }

    #[test]
    fn test_no_time_to_threshold_when_moving_away() {
        let analyzer = analyzer();
        let scores: Vec<f64> = (0..12).map(|i| 0.6 + i as f64 * 0.02).collect();
        record_series(&analyzer, &scores, 1.0);

        let trend = analyzer.analyze("svc", "i1");
        assert_eq!(trend.time_to_threshold, None);
    }

    #[test]
    fn test_window_discards_old_samples() {
        let analyzer = HealthTrendAnalyzer::new(HealthTrendConfig {
            window: Duration::from_secs(100),
            ..Default::default()
        });
        analyzer.record_at("svc", "i1", 1000.0, 0.5);
        analyzer.record_at("svc", "i1", 1200.0, 0.6);
        assert_eq!(analyzer.sample_count("svc", "i1"), 1);
    }

    #[test]
    fn test_service_summary_uses_highest_confidence() {
        let analyzer = analyzer();
        let base = 1_000_000.0;
        // i1: noisy-flat; i2: cleanly degrading.
        for i in 0..12 {
            let noise = if i % 2 == 0 { 0.02 } else { -0.02 };
            analyzer.record_at("svc", "i1", base + i as f64, 0.8 + noise);
            analyzer.record_at("svc", "i2", base + i as f64, 1.0 - i as f64 * 0.12);
        }

        let summary = analyzer.service_summary("svc");
        assert_eq!(summary.overall, TrendDirection::Degrading);
        assert_eq!(summary.instances.len(), 2);
        assert!(summary.confidence > 0.9);
    }
}
