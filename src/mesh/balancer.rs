//! Health-aware load balancing
//!
//! Selects a service instance from the candidate list the caller supplies
//! per call. Every strategy sees only instances at or above the minimum
//! health score; the adaptive strategy additionally tracks health movement
//! between calls, excludes instances on a failure streak, and switches its
//! selection algorithm with observed load conditions.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use log::info;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::metrics::MetricsSink;

/// One selectable backend instance, supplied by the caller each call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub weight: u32,
    pub active_connections: u32,
    /// Epoch seconds of the last selection, caller-maintained
    pub last_used: f64,
    /// Health score in [0, 1]
    pub health_score: f64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ServiceInstance {
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            weight: 1,
            active_connections: 0,
            last_used: 0.0,
            health_score: 1.0,
            metadata: BTreeMap::new(),
        }
    }
}

/// Balancer configuration.
#[derive(Debug, Clone)]
pub struct LoadBalancerConfig {
    /// Instances below this health score are never selected
    pub min_health_score: f64,
    /// Health-drop streak that excludes an instance (adaptive strategy)
    pub max_consecutive_failures: u32,
    /// Coefficient of variation of connections above which the adaptive
    /// strategy prefers least-connections
    pub cv_threshold: f64,
    /// Mean connections above which the adaptive strategy prefers
    /// power-of-two
    pub high_load_threshold: f64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            min_health_score: 0.5,
            max_consecutive_failures: 3,
            cv_threshold: 0.3,
            high_load_threshold: 100.0,
        }
    }
}

/// Selection strategy over pre-filtered healthy instances.
pub trait LbStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn select(&self, service: &str, instances: &[ServiceInstance]) -> Option<ServiceInstance>;
}

/// Build a strategy by its configured name.
pub fn create_lb_strategy(name: &str, config: &LoadBalancerConfig) -> Result<Box<dyn LbStrategy>> {
    match name {
        "weighted_rr" => Ok(Box::new(WeightedRoundRobin::new())),
        "least_conn" => Ok(Box::new(LeastConnections)),
        "power_of_2" => Ok(Box::new(PowerOfTwo)),
        "health_weighted_rr" => Ok(Box::new(HealthWeightedRoundRobin::new())),
        "adaptive" => Ok(Box::new(Adaptive::new(config.clone()))),
        other => Err(Error::Config(format!(
            "unknown load balancer strategy: {other}"
        ))),
    }
}

/// Smooth weighted round-robin: each call raises every instance's current
/// weight by its configured weight, picks the highest, and debits the total.
pub struct WeightedRoundRobin {
    current: Mutex<HashMap<String, HashMap<String, i64>>>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LbStrategy for WeightedRoundRobin {
    fn name(&self) -> &'static str {
        "weighted_rr"
    }

    fn select(&self, service: &str, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let mut state = self.current.lock();
        let weights = state.entry(service.to_string()).or_default();
        weights.retain(|id, _| instances.iter().any(|i| &i.id == id));

        let total: i64 = instances.iter().map(|i| i.weight as i64).sum();
        for instance in instances {
            *weights.entry(instance.id.clone()).or_insert(0) += instance.weight as i64;
        }
        // Ties break toward the smaller id so rotation is deterministic.
        let selected_id = weights
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(id, _)| id.clone())?;
        *weights.get_mut(&selected_id)? -= total;

        instances.iter().find(|i| i.id == selected_id).cloned()
    }
}

/// Fewest active connections, scaled by health.
pub struct LeastConnections;

impl LbStrategy for LeastConnections {
    fn name(&self) -> &'static str {
        "least_conn"
    }

    fn select(&self, _service: &str, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        instances
            .iter()
            .min_by(|a, b| {
                load_score(a)
                    .partial_cmp(&load_score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }
}

/// Two random candidates, keep the less loaded one.
pub struct PowerOfTwo;

impl LbStrategy for PowerOfTwo {
    fn name(&self) -> &'static str {
        "power_of_2"
    }

    fn select(&self, _service: &str, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        match instances.len() {
            0 => None,
            1 => Some(instances[0].clone()),
            _ => {
                let mut rng = rand::thread_rng();
                instances
                    .choose_multiple(&mut rng, 2)
                    .min_by(|a, b| {
                        load_score(a)
                            .partial_cmp(&load_score(b))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .cloned()
            }
        }
    }
}

/// `active_connections / health`, the shared load metric. A floor keeps a
/// near-dead instance from dividing by zero.
fn load_score(instance: &ServiceInstance) -> f64 {
    instance.active_connections as f64 / instance.health_score.max(0.1)
}

/// Plain rotation over the health-filtered list.
pub struct HealthWeightedRoundRobin {
    index: Mutex<HashMap<String, usize>>,
}

impl HealthWeightedRoundRobin {
    pub fn new() -> Self {
        Self {
            index: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for HealthWeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LbStrategy for HealthWeightedRoundRobin {
    fn name(&self) -> &'static str {
        "health_weighted_rr"
    }

    fn select(&self, service: &str, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let mut index = self.index.lock();
        let cursor = index.entry(service.to_string()).or_insert(0);
        let selected = instances[*cursor % instances.len()].clone();
        *cursor = (*cursor + 1) % instances.len();
        Some(selected)
    }
}

/// Condition-driven strategy switching with recovery bias and failure-streak
/// exclusion.
pub struct Adaptive {
    config: LoadBalancerConfig,
    wrr: WeightedRoundRobin,
    least: LeastConnections,
    p2: PowerOfTwo,
    last_health: Mutex<HashMap<String, f64>>,
    drop_streaks: Mutex<HashMap<String, u32>>,
}

impl Adaptive {
    pub fn new(config: LoadBalancerConfig) -> Self {
        Self {
            config,
            wrr: WeightedRoundRobin::new(),
            least: LeastConnections,
            p2: PowerOfTwo,
            last_health: Mutex::new(HashMap::new()),
            drop_streaks: Mutex::new(HashMap::new()),
        }
    }

    /// Track health movement per instance; returns ids whose score rose
    /// since the previous observation.
    fn observe(&self, instances: &[ServiceInstance]) -> Vec<String> {
        let mut last_health = self.last_health.lock();
        let mut streaks = self.drop_streaks.lock();
        let mut recovering = Vec::new();
        for instance in instances {
            let previous = last_health.insert(instance.id.clone(), instance.health_score);
            match previous {
                Some(prev) if instance.health_score < prev => {
                    *streaks.entry(instance.id.clone()).or_insert(0) += 1;
                }
                Some(prev) => {
                    streaks.insert(instance.id.clone(), 0);
                    if instance.health_score > prev {
                        recovering.push(instance.id.clone());
                    }
                }
                None => {
                    streaks.insert(instance.id.clone(), 0);
                }
            }
        }
        recovering
    }

    fn pick_strategy(&self, instances: &[ServiceInstance]) -> &dyn LbStrategy {
        let loads: Vec<f64> = instances
            .iter()
            .map(|i| i.active_connections as f64)
            .collect();
        let mean = loads.iter().sum::<f64>() / loads.len() as f64;
        let cv = if mean > 0.0 {
            let variance = loads.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / loads.len() as f64;
            variance.sqrt() / mean
        } else {
            0.0
        };

        if cv > self.config.cv_threshold {
            &self.least
        } else if mean > self.config.high_load_threshold {
            &self.p2
        } else {
            &self.wrr
        }
    }
}

impl LbStrategy for Adaptive {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn select(&self, service: &str, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let recovering = self.observe(instances);

        let viable: Vec<ServiceInstance> = {
            let streaks = self.drop_streaks.lock();
            instances
                .iter()
                .filter(|i| {
                    streaks.get(&i.id).copied().unwrap_or(0) < self.config.max_consecutive_failures
                })
                .cloned()
                .collect()
        };
        if viable.is_empty() {
            return None;
        }

        // Recovery bias: when some instances are climbing back, pick among
        // them only.
        let pool: Vec<ServiceInstance> = if recovering.is_empty() {
            viable
        } else {
            let recovered: Vec<ServiceInstance> = viable
                .iter()
                .filter(|i| recovering.contains(&i.id))
                .cloned()
                .collect();
            if recovered.is_empty() {
                viable
            } else {
                recovered
            }
        };

        let strategy = self.pick_strategy(&pool);
        info!("Adaptive balancer using {} for {service}", strategy.name());
        strategy.select(service, &pool)
    }
}

/// Public selection surface wrapping a strategy with the shared health
/// filter and metrics.
pub struct LoadBalancer {
    config: LoadBalancerConfig,
    strategy: Box<dyn LbStrategy>,
    metrics: Arc<MetricsSink>,
}

impl LoadBalancer {
    pub fn new(
        strategy_name: &str,
        config: LoadBalancerConfig,
        metrics: Arc<MetricsSink>,
    ) -> Result<Self> {
        let strategy = create_lb_strategy(strategy_name, &config)?;
        Ok(Self {
            config,
            strategy,
            metrics,
        })
    }

    /// Select an instance for `service`, or `NoInstanceAvailable` when the
    /// health filter (or the strategy's own exclusions) leaves nothing.
    pub fn select(&self, service: &str, instances: &[ServiceInstance]) -> Result<ServiceInstance> {
        let started = Instant::now();
        let healthy: Vec<ServiceInstance> = instances
            .iter()
            .filter(|i| i.health_score >= self.config.min_health_score)
            .cloned()
            .collect();

        let selected = if healthy.is_empty() {
            None
        } else {
            self.strategy.select(service, &healthy)
        };

        self.metrics.timing(
            "lb_selection_duration_seconds",
            started.elapsed(),
            &[("service", service), ("strategy", self.strategy.name())],
        );

        match selected {
            Some(instance) => {
                self.metrics.increment_counter(
                    "lb_selections_total",
                    1.0,
                    &[
                        ("service", service),
                        ("strategy", self.strategy.name()),
                        ("instance", &instance.id),
                    ],
                );
                Ok(instance)
            }
            None => {
                self.metrics.increment_counter(
                    "lb_rejections_total",
                    1.0,
                    &[("service", service), ("reason", "no_healthy_instances")],
                );
                Err(Error::NoInstanceAvailable(service.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsConfig;

    fn instance(id: &str, connections: u32, health: f64) -> ServiceInstance {
        ServiceInstance {
            active_connections: connections,
            health_score: health,
            ..ServiceInstance::new(id, "10.0.0.1", 8080)
        }
    }

    fn balancer(strategy: &str) -> LoadBalancer {
        LoadBalancer::new(
            strategy,
            LoadBalancerConfig::default(),
            MetricsSink::new(MetricsConfig::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_health_filter_applies_to_all_strategies() {
        for strategy in [
            "weighted_rr",
            "least_conn",
            "power_of_2",
            "health_weighted_rr",
            "adaptive",
        ] {
            let lb = balancer(strategy);
            let instances = vec![instance("sick", 0, 0.2), instance("well", 50, 0.9)];
            let selected = lb.select("svc", &instances).unwrap();
            assert_eq!(selected.id, "well", "strategy {strategy}");
        }
    }

    #[test]
    fn test_no_instance_available() {
        let lb = balancer("least_conn");
        let instances = vec![instance("a", 0, 0.1), instance("b", 0, 0.4)];
        assert!(matches!(
            lb.select("svc", &instances),
            Err(Error::NoInstanceAvailable(_))
        ));
        assert!(matches!(
            lb.select("svc", &[]),
            Err(Error::NoInstanceAvailable(_))
        ));
    }

    #[test]
    fn test_least_connections_prefers_low_load_high_health() {
        let lb = balancer("least_conn");
        let instances = vec![
            instance("busy", 80, 1.0),
            instance("idle", 5, 1.0),
            instance("idle-sickish", 5, 0.6),
        ];
        assert_eq!(lb.select("svc", &instances).unwrap().id, "idle");
    }

    #[test]
    fn test_weighted_rr_distribution_follows_weights() {
        let lb = balancer("weighted_rr");
        let mut a = instance("a", 0, 1.0);
        a.weight = 3;
        let mut b = instance("b", 0, 1.0);
        b.weight = 1;
        let instances = vec![a, b];

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..8 {
            let selected = lb.select("svc", &instances).unwrap();
            *counts.entry(selected.id).or_default() += 1;
        }
        assert_eq!(counts["a"], 6);
        assert_eq!(counts["b"], 2);
    }

    #[test]
    fn test_power_of_two_selects_member() {
        let lb = balancer("power_of_2");
        let instances = vec![
            instance("a", 10, 1.0),
            instance("b", 20, 1.0),
            instance("c", 30, 1.0),
        ];
        for _ in 0..20 {
            let selected = lb.select("svc", &instances).unwrap();
            assert!(["a", "b", "c"].contains(&selected.id.as_str()));
        }
    }

    #[test]
    fn test_health_weighted_rr_rotates() {
        let lb = balancer("health_weighted_rr");
        let instances = vec![instance("a", 0, 1.0), instance("b", 0, 1.0)];
        let first = lb.select("svc", &instances).unwrap().id;
        let second = lb.select("svc", &instances).unwrap().id;
        assert_ne!(first, second);
    }

    #[test]
    fn test_adaptive_picks_least_conn_under_uneven_load() {
        let lb = balancer("adaptive");
        let mut instances: Vec<ServiceInstance> = (1..=4)
            .map(|i| instance(&format!("i{i}"), 10, 0.7 + i as f64 * 0.05))
            .collect();
        instances.push(instance("hot", 100, 1.0));

        // cv ≈ 1.3 > 0.3 → least-connections → the 10-connection instance
        // with the best health.
        let selected = lb.select("svc", &instances).unwrap();
        assert_eq!(selected.id, "i4");
    }

    #[test]
    fn test_adaptive_excludes_failure_streaks() {
        let lb = balancer("adaptive");
        let healthy = |h: f64| vec![instance("flaky", 10, h), instance("steady", 50, 0.8)];

        // Health drops on each observation build a streak for "flaky".
        let _ = lb.select("svc", &healthy(0.95));
        let _ = lb.select("svc", &healthy(0.90));
        let _ = lb.select("svc", &healthy(0.85));
        let _ = lb.select("svc", &healthy(0.80));

        // Streak reached max_consecutive_failures: only "steady" remains.
        for _ in 0..5 {
            assert_eq!(lb.select("svc", &healthy(0.75)).unwrap().id, "steady");
        }
    }

    #[test]
    fn test_adaptive_prefers_recovering_instances() {
        let lb = balancer("adaptive");
        let round = |a_health: f64, b_health: f64| {
            vec![
                instance("a", 10, a_health),
                instance("b", 10, b_health),
            ]
        };

        let _ = lb.select("svc", &round(0.6, 0.9));
        // "a" rose, "b" held: recovery bias restricts the pool to "a".
        let selected = lb.select("svc", &round(0.8, 0.9)).unwrap();
        assert_eq!(selected.id, "a");
    }

    #[test]
    fn test_unknown_strategy_is_config_error() {
        let result = LoadBalancer::new(
            "round_random",
            LoadBalancerConfig::default(),
            MetricsSink::new(MetricsConfig::default()),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
