//! Circuit breaker
//!
//! A per-service state machine (closed → open → half-open) guarding outbound
//! calls, with pluggable trip strategies: consecutive-failure count, rolling
//! failure rate, health-trend, and an adaptive strategy that picks among
//! them per call. Rejections are recorded separately from call failures and
//! never count toward the failure window.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{info, warn};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::health::{HealthTrendAnalyzer, TrendDirection};
use crate::error::{Error, Result};
use crate::metrics::MetricsSink;

/// Circuit states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Rejecting calls
    Open,
    /// Probation, admitting calls to test recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Trip strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStrategyKind {
    CountBased,
    RateBased,
    HealthBased,
    Adaptive,
}

impl CircuitStrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitStrategyKind::CountBased => "count_based",
            CircuitStrategyKind::RateBased => "rate_based",
            CircuitStrategyKind::HealthBased => "health_based",
            CircuitStrategyKind::Adaptive => "adaptive",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "count_based" => Ok(CircuitStrategyKind::CountBased),
            "rate_based" => Ok(CircuitStrategyKind::RateBased),
            "health_based" => Ok(CircuitStrategyKind::HealthBased),
            "adaptive" => Ok(CircuitStrategyKind::Adaptive),
            other => Err(Error::Config(format!("unknown circuit strategy: {other}"))),
        }
    }
}

/// Breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub strategy: CircuitStrategyKind,
    /// Failures since the last closed transition that trip a count-based
    /// breaker
    pub failure_threshold: u32,
    /// Consecutive half-open successes required to close
    pub success_threshold: u32,
    /// Time in open before probing with half-open
    pub reset_timeout: Duration,
    /// Time allowed in half-open before giving up and reopening
    pub half_open_timeout: Duration,
    /// Rolling window for rate calculations
    pub window_size: Duration,
    pub error_rate_threshold: f64,
    /// Requests required in the window before the rate is trusted
    pub min_throughput: usize,
    /// Predicted health score below which the health strategy opens
    pub health_threshold: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            strategy: CircuitStrategyKind::CountBased,
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout: Duration::from_secs(60),
            half_open_timeout: Duration::from_secs(30),
            window_size: Duration::from_secs(60),
            error_rate_threshold: 0.5,
            min_throughput: 10,
            health_threshold: 0.3,
        }
    }
}

/// Counters handed to strategies; no strategy mutates breaker state.
#[derive(Debug, Clone, Copy)]
pub struct CircuitSnapshot {
    pub failures: u32,
    pub successes: u32,
    pub window_requests: usize,
    pub window_failures: usize,
}

/// Decides whether the circuit should open after a failure.
pub trait CircuitStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn should_open(&self, snapshot: &CircuitSnapshot) -> bool;
}

/// Build the configured strategy for a service.
pub fn create_circuit_strategy(
    kind: CircuitStrategyKind,
    config: &CircuitBreakerConfig,
    analyzer: Arc<HealthTrendAnalyzer>,
    service: &str,
) -> Box<dyn CircuitStrategy> {
    match kind {
        CircuitStrategyKind::CountBased => Box::new(CountBasedStrategy {
            failure_threshold: config.failure_threshold,
        }),
        CircuitStrategyKind::RateBased => Box::new(RateBasedStrategy {
            error_rate_threshold: config.error_rate_threshold,
            min_throughput: config.min_throughput,
        }),
        CircuitStrategyKind::HealthBased => Box::new(HealthBasedStrategy {
            analyzer,
            service: service.to_string(),
            health_threshold: config.health_threshold,
        }),
        CircuitStrategyKind::Adaptive => Box::new(AdaptiveStrategy {
            count: CountBasedStrategy {
                failure_threshold: config.failure_threshold,
            },
            rate: RateBasedStrategy {
                error_rate_threshold: config.error_rate_threshold,
                min_throughput: config.min_throughput,
            },
            health: HealthBasedStrategy {
                analyzer,
                service: service.to_string(),
                health_threshold: config.health_threshold,
            },
            min_throughput: config.min_throughput,
        }),
    }
}

struct CountBasedStrategy {
    failure_threshold: u32,
}

impl CircuitStrategy for CountBasedStrategy {
    fn name(&self) -> &'static str {
        "count_based"
    }

    fn should_open(&self, snapshot: &CircuitSnapshot) -> bool {
        snapshot.failures >= self.failure_threshold
    }
}

struct RateBasedStrategy {
    error_rate_threshold: f64,
    min_throughput: usize,
}

impl CircuitStrategy for RateBasedStrategy {
    fn name(&self) -> &'static str {
        "rate_based"
    }

    fn should_open(&self, snapshot: &CircuitSnapshot) -> bool {
        if snapshot.window_requests < self.min_throughput {
            return false;
        }
        let rate = snapshot.window_failures as f64 / snapshot.window_requests as f64;
        rate >= self.error_rate_threshold
    }
}

struct HealthBasedStrategy {
    analyzer: Arc<HealthTrendAnalyzer>,
    service: String,
    health_threshold: f64,
}

impl HealthBasedStrategy {
    const INSTANCE: &'static str = "circuit_breaker";
}

impl CircuitStrategy for HealthBasedStrategy {
    fn name(&self) -> &'static str {
        "health_based"
    }

    fn should_open(&self, _snapshot: &CircuitSnapshot) -> bool {
        let trend = self.analyzer.analyze(&self.service, Self::INSTANCE);
        if trend.direction == TrendDirection::Degrading && trend.confidence > 0.8 {
            return true;
        }
        trend
            .predicted_score()
            .is_some_and(|score| score < self.health_threshold)
    }
}

/// Picks health-based when the analyzer is confident, rate-based once there
/// is throughput, and count-based otherwise.
struct AdaptiveStrategy {
    count: CountBasedStrategy,
    rate: RateBasedStrategy,
    health: HealthBasedStrategy,
    min_throughput: usize,
}

impl AdaptiveStrategy {
    fn pick(&self, snapshot: &CircuitSnapshot) -> &dyn CircuitStrategy {
        let trend = self
            .health
            .analyzer
            .analyze(&self.health.service, HealthBasedStrategy::INSTANCE);
        if trend.confidence > 0.8 {
            return &self.health;
        }
        if snapshot.window_requests >= self.min_throughput {
            return &self.rate;
        }
        &self.count
    }
}

impl CircuitStrategy for AdaptiveStrategy {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn should_open(&self, snapshot: &CircuitSnapshot) -> bool {
        let strategy = self.pick(snapshot);
        info!("Adaptive breaker using {} strategy", strategy.name());
        strategy.should_open(snapshot)
    }
}

struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_state_change: Instant,
    events: VecDeque<(Instant, bool)>,
}

impl BreakerState {
    fn snapshot(&self) -> CircuitSnapshot {
        let window_requests = self.events.len();
        let window_failures = self.events.iter().filter(|(_, ok)| !ok).count();
        CircuitSnapshot {
            failures: self.failures,
            successes: self.successes,
            window_requests,
            window_failures,
        }
    }

    fn trim(&mut self, window: Duration) {
        let cutoff = Instant::now();
        while let Some((t, _)) = self.events.front() {
            if cutoff.duration_since(*t) > window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-service circuit breaker.
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    strategy: Box<dyn CircuitStrategy>,
    state: Mutex<BreakerState>,
    metrics: Arc<MetricsSink>,
}

impl CircuitBreaker {
    pub fn new(
        service: impl Into<String>,
        config: CircuitBreakerConfig,
        analyzer: Arc<HealthTrendAnalyzer>,
        metrics: Arc<MetricsSink>,
    ) -> Self {
        let service = service.into();
        let strategy = create_circuit_strategy(config.strategy, &config, analyzer, &service);
        Self {
            service,
            config,
            strategy,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_state_change: Instant::now(),
                events: VecDeque::new(),
            }),
            metrics,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Run `op` under the breaker; a rejection returns `CircuitOpen`.
    pub async fn execute<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        if !self.can_execute() {
            self.record_rejection();
            return Err(Error::CircuitOpen(self.service.clone()));
        }
        self.run(op).await
    }

    /// Run `op` under the breaker; a rejection runs `fallback` instead.
    pub async fn execute_with_fallback<T>(
        &self,
        op: impl Future<Output = Result<T>>,
        fallback: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        if !self.can_execute() {
            self.record_rejection();
            return fallback.await;
        }
        self.run(op).await
    }

    async fn run<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        let started = Instant::now();
        let result = op.await;
        let elapsed = started.elapsed();
        match &result {
            Ok(_) => {
                self.record_success();
                self.metrics.timing(
                    "circuit_call_duration_seconds",
                    elapsed,
                    &[("service", &self.service), ("outcome", "success")],
                );
            }
            Err(_) => {
                self.record_failure();
                self.metrics.timing(
                    "circuit_call_duration_seconds",
                    elapsed,
                    &[("service", &self.service), ("outcome", "failure")],
                );
            }
        }
        result
    }

    /// Whether a call may proceed, applying time-based transitions.
    pub fn can_execute(&self) -> bool {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if state.last_state_change.elapsed() >= self.config.reset_timeout {
                    self.transition(&mut state, CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if state.successes >= self.config.success_threshold {
                    self.transition(&mut state, CircuitState::Closed);
                    return true;
                }
                if state.last_state_change.elapsed() >= self.config.half_open_timeout {
                    // Probation expired without enough successes.
                    self.transition(&mut state, CircuitState::Open);
                    return false;
                }
                true
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.successes += 1;
        state.events.push_back((Instant::now(), true));
        state.trim(self.config.window_size);
        if state.state == CircuitState::HalfOpen
            && state.successes >= self.config.success_threshold
        {
            self.transition(&mut state, CircuitState::Closed);
        }
    }

    /// Record a failed call; may trip the breaker.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.failures += 1;
        state.events.push_back((Instant::now(), false));
        state.trim(self.config.window_size);

        match state.state {
            // A single failure in probation reopens immediately.
            CircuitState::HalfOpen => self.transition(&mut state, CircuitState::Open),
            CircuitState::Closed => {
                let snapshot = state.snapshot();
                if self.strategy.should_open(&snapshot) {
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_rejection(&self) {
        // Rejections are not failures and stay out of the rate window.
        self.metrics.increment_counter(
            "circuit_rejections_total",
            1.0,
            &[("service", &self.service)],
        );
    }

    /// Apply pending time-based transitions; driven by the registry's
    /// maintenance loop so open circuits probe on schedule.
    pub fn maintain(&self) {
        let mut state = self.state.lock();
        if state.state == CircuitState::Open
            && state.last_state_change.elapsed() >= self.config.reset_timeout
        {
            self.transition(&mut state, CircuitState::HalfOpen);
        }
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState) {
        if state.state == to {
            return;
        }
        let from = state.state;
        state.state = to;
        state.last_state_change = Instant::now();
        match to {
            CircuitState::Closed => {
                state.failures = 0;
                state.successes = 0;
                info!("Circuit for {} closed", self.service);
            }
            CircuitState::HalfOpen => {
                state.successes = 0;
                info!("Circuit for {} entering half-open", self.service);
            }
            CircuitState::Open => {
                warn!(
                    "Circuit for {} opened (from {})",
                    self.service,
                    from.as_str()
                );
            }
        }
        self.metrics.increment_counter(
            "circuit_state_changes",
            1.0,
            &[("service", &self.service), ("state", to.as_str())],
        );
    }
}

/// Creates and owns breakers per service and drives their time-based
/// transitions.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    analyzer: Arc<HealthTrendAnalyzer>,
    metrics: Arc<MetricsSink>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(
        config: CircuitBreakerConfig,
        analyzer: Arc<HealthTrendAnalyzer>,
        metrics: Arc<MetricsSink>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            analyzer,
            metrics,
            breakers: DashMap::new(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn get_or_create(&self, service: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    service,
                    self.config.clone(),
                    self.analyzer.clone(),
                    self.metrics.clone(),
                ))
            })
            .clone()
    }

    pub fn states(&self) -> Vec<(String, CircuitState)> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }

    /// Spawn the maintenance ticker.
    pub fn start(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for entry in registry.breakers.iter() {
                            entry.value().maintain();
                        }
                    }
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::health::HealthTrendConfig;
    use crate::metrics::MetricsConfig;

    fn breaker(config: CircuitBreakerConfig) -> CircuitBreaker {
        let analyzer = Arc::new(HealthTrendAnalyzer::new(HealthTrendConfig::default()));
        CircuitBreaker::new(
            "billing",
            config,
            analyzer,
            MetricsSink::new(MetricsConfig::default()),
        )
    }

    fn fast_count_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout: Duration::from_millis(50),
            half_open_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    async fn failing_call(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .execute(async { Err::<(), _>(Error::Timeout("remote".into())) })
            .await
            .map(|_| ())
    }

    #[tokio::test]
    async fn test_trips_after_five_consecutive_failures() {
        let breaker = breaker(fast_count_config());
        for _ in 0..5 {
            let _ = failing_call(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Next call is rejected with the typed error.
        let result = breaker.execute(async { Ok(1) }).await;
        assert!(matches!(result, Err(Error::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn test_half_open_then_closes_after_three_successes() {
        let breaker = breaker(fast_count_config());
        for _ in 0..5 {
            let _ = failing_call(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(70)).await;
        // Admitted again: the reset timeout has elapsed.
        for _ in 0..3 {
            breaker.execute(async { Ok(()) }).await.unwrap();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker(fast_count_config());
        for _ in 0..5 {
            let _ = failing_call(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let _ = failing_call(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_window_expiry_reopens() {
        let breaker = breaker(fast_count_config());
        for _ in 0..5 {
            let _ = failing_call(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(breaker.can_execute());

        // Let the probation window lapse without successes.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_rejections_do_not_count_as_failures() {
        let breaker = breaker(fast_count_config());
        for _ in 0..5 {
            let _ = failing_call(&breaker).await;
        }
        let failures_when_opened = breaker.state.lock().failures;
        for _ in 0..10 {
            let _ = breaker.execute(async { Ok(()) }).await;
        }
        assert_eq!(breaker.state.lock().failures, failures_when_opened);
    }

    #[tokio::test]
    async fn test_fallback_runs_on_rejection() {
        let breaker = breaker(fast_count_config());
        for _ in 0..5 {
            let _ = failing_call(&breaker).await;
        }
        let value = breaker
            .execute_with_fallback(async { Ok("primary") }, async { Ok("fallback") })
            .await
            .unwrap();
        assert_eq!(value, "fallback");
    }

    #[tokio::test]
    async fn test_rate_based_needs_min_throughput() {
        let config = CircuitBreakerConfig {
            strategy: CircuitStrategyKind::RateBased,
            min_throughput: 10,
            error_rate_threshold: 0.5,
            failure_threshold: 1000,
            ..Default::default()
        };
        let breaker = breaker(config);

        // Four failures: under throughput, stays closed.
        for _ in 0..4 {
            let _ = failing_call(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Push past min throughput with a failing majority.
        for _ in 0..4 {
            let _ = breaker.execute(async { Ok(()) }).await;
        }
        for _ in 0..3 {
            let _ = failing_call(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_health_based_opens_on_degrading_trend() {
        let analyzer = Arc::new(HealthTrendAnalyzer::new(HealthTrendConfig::default()));
        let base = 1_000_000.0;
        for i in 0..12 {
            analyzer.record_at("billing", "circuit_breaker", base + i as f64, 1.0 - i as f64 * 0.12);
        }

        let breaker = CircuitBreaker::new(
            "billing",
            CircuitBreakerConfig {
                strategy: CircuitStrategyKind::HealthBased,
                ..Default::default()
            },
            analyzer,
            MetricsSink::new(MetricsConfig::default()),
        );

        let _ = failing_call(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_adaptive_uses_count_without_data() {
        let config = CircuitBreakerConfig {
            strategy: CircuitStrategyKind::Adaptive,
            failure_threshold: 3,
            min_throughput: 100,
            ..Default::default()
        };
        let breaker = breaker(config);
        for _ in 0..3 {
            let _ = failing_call(&breaker).await;
        }
        // No analyzer data and no throughput: count-based applies.
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_unknown_strategy_name() {
        assert!(matches!(
            CircuitStrategyKind::from_name("psychic"),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_maintenance_promotes_open_circuits() {
        let analyzer = Arc::new(HealthTrendAnalyzer::new(HealthTrendConfig::default()));
        let registry = CircuitBreakerRegistry::new(
            CircuitBreakerConfig {
                reset_timeout: Duration::from_millis(10),
                ..fast_count_config()
            },
            analyzer,
            MetricsSink::new(MetricsConfig::default()),
        );
        let breaker = registry.get_or_create("search");
        for _ in 0..5 {
            let _ = failing_call(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        breaker.maintain();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        registry.stop().await;
    }
}
