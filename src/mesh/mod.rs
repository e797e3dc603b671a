//! Service-mesh resilience fabric
//!
//! Wraps every outbound inter-service call: the circuit breaker decides
//! whether a request is sent at all, the load balancer decides which
//! instance receives it, and both adapt their policy from the health trend
//! analyzer's view of recent health samples.
//!
//! ```no_run
//! use std::sync::Arc;
//! use basin::mesh::{
//!     CircuitBreakerConfig, CircuitBreakerRegistry, HealthTrendAnalyzer,
//!     HealthTrendConfig, LoadBalancer, LoadBalancerConfig,
//! };
//! use basin::metrics::{MetricsConfig, MetricsSink};
//!
//! # async fn example(instances: Vec<basin::mesh::ServiceInstance>) -> basin::Result<()> {
//! let metrics = MetricsSink::new(MetricsConfig::default());
//! let analyzer = Arc::new(HealthTrendAnalyzer::new(HealthTrendConfig::default()));
//! let breakers = CircuitBreakerRegistry::new(
//!     CircuitBreakerConfig::default(),
//!     analyzer.clone(),
//!     metrics.clone(),
//! );
//! let balancer = LoadBalancer::new("adaptive", LoadBalancerConfig::default(), metrics)?;
//!
//! let target = balancer.select("billing", &instances)?;
//! let breaker = breakers.get_or_create("billing");
//! let response = breaker
//!     .execute(async { call_billing(&target).await })
//!     .await?;
//! # Ok(())
//! # }
//! # async fn call_billing(_i: &basin::mesh::ServiceInstance) -> basin::Result<()> { Ok(()) }
//! ```

pub mod balancer;
pub mod circuit;
pub mod health;

pub use balancer::{
    create_lb_strategy, Adaptive, HealthWeightedRoundRobin, LbStrategy, LeastConnections,
    LoadBalancer, LoadBalancerConfig, PowerOfTwo, ServiceInstance, WeightedRoundRobin,
};
pub use circuit::{
    create_circuit_strategy, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitSnapshot, CircuitState, CircuitStrategy, CircuitStrategyKind,
};
pub use health::{
    HealthTrend, HealthTrendAnalyzer, HealthTrendConfig, ServiceHealthSummary, TrendDirection,
};
