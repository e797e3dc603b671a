//! Access pattern tracking and analysis
//!
//! Keeps a bounded, time-windowed timestamp list per key and derives three
//! analyses used by the warming engine: periodic patterns (autocorrelation
//! over inter-access intervals), temporal co-occurrence between keys, and
//! seasonal hour/weekday/week-of-year profiles. Analyses are cached until the
//! next recorded access invalidates them.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use parking_lot::Mutex;
use regex::Regex;

/// A detected periodic access pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodicPattern {
    /// Period in seconds
    pub period: f64,
    /// Fraction of observed spacings within 10% of the period
    pub confidence: f64,
}

/// Normalized seasonal profile for one key.
#[derive(Debug, Clone, Default)]
struct SeasonalProfile {
    hourly: HashMap<u32, f64>,
    daily: HashMap<u32, f64>,
    weekly: HashMap<u32, f64>,
}

/// Tracker configuration.
#[derive(Debug, Clone)]
pub struct AccessTrackerConfig {
    /// Sliding window; older records are pruned on every access
    pub window: Duration,
    /// Minimum confidence for a periodic pattern to be reported
    pub min_confidence: f64,
    /// Accesses required before a seasonal profile is meaningful
    pub min_seasonal_samples: usize,
}

impl Default for AccessTrackerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3600),
            min_confidence: 0.7,
            min_seasonal_samples: 24,
        }
    }
}

#[derive(Default)]
struct TrackerState {
    access_times: HashMap<String, Vec<f64>>,
    access_counts: HashMap<String, u64>,
    pattern_cache: HashMap<String, Vec<PeriodicPattern>>,
    seasonal_cache: HashMap<String, SeasonalProfile>,
}

/// Per-key access history with periodic, related-key, and seasonal analyses.
/// Critical sections are lock-only; no I/O happens under the lock.
pub struct AccessPatternTracker {
    config: AccessTrackerConfig,
    state: Mutex<TrackerState>,
}

impl AccessPatternTracker {
    pub fn new(config: AccessTrackerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Record an access at the current time.
    pub fn record_access(&self, key: &str) {
        self.record_access_at(key, Utc::now().timestamp_millis() as f64 / 1000.0);
    }

    /// Record an access at an explicit epoch-seconds timestamp.
    pub fn record_access_at(&self, key: &str, timestamp: f64) {
        let mut state = self.state.lock();
        let times = state.access_times.entry(key.to_string()).or_default();
        // Keep the list sorted even if timestamps arrive slightly out of order.
        match times.last() {
            Some(&last) if last > timestamp => {
                let pos = times.partition_point(|&t| t <= timestamp);
                times.insert(pos, timestamp);
            }
            _ => times.push(timestamp),
        }
        *state.access_counts.entry(key.to_string()).or_default() += 1;

        let cutoff = timestamp - self.config.window.as_secs_f64();
        state.access_times.retain(|_, times| {
            times.retain(|&t| t > cutoff);
            !times.is_empty()
        });
        let live: std::collections::HashSet<String> =
            state.access_times.keys().cloned().collect();
        state.access_counts.retain(|key, _| live.contains(key));
        state.pattern_cache.clear();
        state.seasonal_cache.clear();
    }

    /// Total recorded accesses for a key (within the current window's life).
    pub fn access_count(&self, key: &str) -> u64 {
        self.state.lock().access_counts.get(key).copied().unwrap_or(0)
    }

    /// Number of retained timestamps for a key.
    pub fn sample_count(&self, key: &str) -> usize {
        self.state
            .lock()
            .access_times
            .get(key)
            .map(|t| t.len())
            .unwrap_or(0)
    }

    /// Most recent retained access, epoch seconds.
    pub fn last_access(&self, key: &str) -> Option<f64> {
        self.state
            .lock()
            .access_times
            .get(key)
            .and_then(|t| t.last().copied())
    }

    /// Tracked keys whose name matches `pattern`.
    pub fn keys_matching(&self, pattern: &Regex) -> Vec<String> {
        self.state
            .lock()
            .access_times
            .keys()
            .filter(|k| pattern.is_match(k))
            .cloned()
            .collect()
    }

    /// Detected periodic patterns for a key, highest confidence first.
    pub fn periodic_patterns(&self, key: &str) -> Vec<PeriodicPattern> {
        {
            let state = self.state.lock();
            if let Some(cached) = state.pattern_cache.get(key) {
                return cached.clone();
            }
        }

        let times = {
            let state = self.state.lock();
            match state.access_times.get(key) {
                Some(times) if times.len() >= 3 => times.clone(),
                _ => return Vec::new(),
            }
        };

        let patterns = detect_periodic(&times, self.config.min_confidence);
        self.state
            .lock()
            .pattern_cache
            .insert(key.to_string(), patterns.clone());
        patterns
    }

    /// Predicted next access time (epoch seconds): confidence-weighted mean
    /// of `last_access + period` over detected patterns. `None` without
    /// patterns.
    pub fn predict_next_access(&self, key: &str) -> Option<f64> {
        let patterns = self.periodic_patterns(key);
        if patterns.is_empty() {
            return None;
        }
        let last = self.last_access(key)?;
        let total: f64 = patterns.iter().map(|p| p.confidence).sum();
        if total <= 0.0 {
            return None;
        }
        let weighted: f64 = patterns
            .iter()
            .map(|p| (last + p.period) * p.confidence)
            .sum();
        Some(weighted / total)
    }

    /// Keys whose accesses co-occur with this key's within ±1 s, at or above
    /// `threshold` (fraction of the larger timestamp set).
    pub fn related_keys(&self, key: &str, threshold: f64) -> Vec<String> {
        let state = self.state.lock();
        let Some(key_times) = state.access_times.get(key) else {
            return Vec::new();
        };
        if key_times.is_empty() {
            return Vec::new();
        }

        let mut related = Vec::new();
        for (other, other_times) in &state.access_times {
            if other == key || other_times.is_empty() {
                continue;
            }
            let matches = key_times
                .iter()
                .filter(|&&t| {
                    let pos = other_times.partition_point(|&x| x < t - 1.0);
                    other_times.get(pos).is_some_and(|&x| x <= t + 1.0)
                })
                .count();
            let correlation = matches as f64 / key_times.len().max(other_times.len()) as f64;
            if correlation >= threshold {
                related.push(other.clone());
            }
        }
        related.sort();
        related
    }

    /// Seasonal score at `at`, the mean of the hour-of-day, day-of-week, and
    /// week-of-year bucket scores. `None` with fewer than the configured
    /// minimum samples.
    pub fn seasonal_score(&self, key: &str, at: DateTime<Utc>) -> Option<f64> {
        {
            let state = self.state.lock();
            if let Some(profile) = state.seasonal_cache.get(key) {
                return Some(score_profile(profile, at));
            }
        }

        let times = {
            let state = self.state.lock();
            match state.access_times.get(key) {
                Some(times) if times.len() >= self.config.min_seasonal_samples => times.clone(),
                _ => return None,
            }
        };

        let profile = build_profile(&times);
        let score = score_profile(&profile, at);
        self.state
            .lock()
            .seasonal_cache
            .insert(key.to_string(), profile);
        Some(score)
    }
}

/// Autocorrelate the inter-access intervals and turn significant lags into
/// candidate periods. The unit lag is always a candidate so evenly spaced
/// accesses, where the autocorrelation has no interior peak, are detected.
fn detect_periodic(times: &[f64], min_confidence: f64) -> Vec<PeriodicPattern> {
    let intervals: Vec<f64> = times.windows(2).map(|w| w[1] - w[0]).collect();
    let n = intervals.len();
    if n < 2 {
        return Vec::new();
    }

    let mut autocorr = vec![0.0; n];
    for lag in 0..n {
        for i in 0..n - lag {
            autocorr[lag] += intervals[i] * intervals[i + lag];
        }
    }
    let tail = &autocorr[1..];
    let mean = tail.iter().sum::<f64>() / tail.len() as f64;
    let std = (tail.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / tail.len() as f64).sqrt();

    let mut lags = vec![1usize];
    for lag in 2..n.saturating_sub(1) {
        if autocorr[lag] > autocorr[lag - 1]
            && autocorr[lag] > autocorr[lag + 1]
            && autocorr[lag] > mean + std
        {
            lags.push(lag);
        }
    }

    let mut patterns: Vec<PeriodicPattern> = Vec::new();
    for lag in lags {
        let sums: Vec<f64> = intervals.windows(lag).map(|w| w.iter().sum()).collect();
        if sums.is_empty() {
            continue;
        }
        let period = sums.iter().sum::<f64>() / sums.len() as f64;
        if period <= 0.0 {
            continue;
        }
        let confidence = sums
            .iter()
            .filter(|&&s| (s - period).abs() < period * 0.1)
            .count() as f64
            / sums.len() as f64;
        if confidence <= min_confidence {
            continue;
        }
        // Collapse near-duplicate periods from adjacent lags.
        if patterns
            .iter()
            .any(|p| (p.period - period).abs() < period * 0.1)
        {
            continue;
        }
        patterns.push(PeriodicPattern { period, confidence });
    }
    patterns.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    patterns
}

fn build_profile(times: &[f64]) -> SeasonalProfile {
    let mut hourly: HashMap<u32, f64> = HashMap::new();
    let mut daily: HashMap<u32, f64> = HashMap::new();
    let mut weekly: HashMap<u32, f64> = HashMap::new();
    let mut total = 0.0;

    for &t in times {
        let Some(dt) = DateTime::<Utc>::from_timestamp(t as i64, 0) else {
            continue;
        };
        *hourly.entry(dt.hour()).or_default() += 1.0;
        *daily.entry(dt.weekday().num_days_from_monday()).or_default() += 1.0;
        *weekly.entry(dt.iso_week().week() % 52).or_default() += 1.0;
        total += 1.0;
    }
    if total > 0.0 {
        for bucket in [&mut hourly, &mut daily, &mut weekly] {
            for value in bucket.values_mut() {
                *value /= total;
            }
        }
    }
    SeasonalProfile {
        hourly,
        daily,
        weekly,
    }
}

fn score_profile(profile: &SeasonalProfile, at: DateTime<Utc>) -> f64 {
    let hour = profile.hourly.get(&at.hour()).copied().unwrap_or(0.0);
    let day = profile
        .daily
        .get(&at.weekday().num_days_from_monday())
        .copied()
        .unwrap_or(0.0);
    let week = profile
        .weekly
        .get(&(at.iso_week().week() % 52))
        .copied()
        .unwrap_or(0.0);
    (hour + day + week) / 3.0
}
