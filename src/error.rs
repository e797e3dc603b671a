//! Error types shared by the cache and resilience cores.

use thiserror::Error;

/// Errors surfaced by cache, cluster, and mesh operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Lookup found no entry for the key
    #[error("Cache miss: {0}")]
    CacheMiss(String),

    /// Codec failed to encode or decode a value
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No healthy node, or the store could not be reached
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Fewer than the required quorum acknowledged the operation
    #[error("Quorum not met: {acks}/{required} acks")]
    QuorumNotMet { acks: usize, required: usize },

    /// Quorum read returned divergent values
    #[error("Inconsistent read for key: {0}")]
    InconsistentRead(String),

    /// Circuit breaker rejected the call
    #[error("Circuit open for service: {0}")]
    CircuitOpen(String),

    /// Load balancer filtered out every candidate instance
    #[error("No instance available for service: {0}")]
    NoInstanceAvailable(String),

    /// Deadline elapsed before the operation completed
    #[error("Timeout during {0}")]
    Timeout(String),

    /// Unknown strategy name or invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether a caller may reasonably retry (possibly after backoff).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_)
                | Error::QuorumNotMet { .. }
                | Error::CircuitOpen(_)
                | Error::NoInstanceAvailable(_)
                | Error::Timeout(_)
        )
    }
}

/// Result type for cache and mesh operations.
pub type Result<T> = std::result::Result<T, Error>;
