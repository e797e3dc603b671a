//! Cache configuration and the stored entry envelope.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Eviction policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicyKind {
    /// Least recently used
    Lru,
    /// Least frequently used
    Lfu,
    /// First in, first out
    Fifo,
    /// Uniform random
    Random,
    /// Rely on store-native expiry only
    Ttl,
}

impl EvictionPolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionPolicyKind::Lru => "lru",
            EvictionPolicyKind::Lfu => "lfu",
            EvictionPolicyKind::Fifo => "fifo",
            EvictionPolicyKind::Random => "random",
            EvictionPolicyKind::Ttl => "ttl",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "lru" => Ok(EvictionPolicyKind::Lru),
            "lfu" => Ok(EvictionPolicyKind::Lfu),
            "fifo" => Ok(EvictionPolicyKind::Fifo),
            "random" => Ok(EvictionPolicyKind::Random),
            "ttl" => Ok(EvictionPolicyKind::Ttl),
            other => Err(Error::Config(format!("unknown eviction policy: {other}"))),
        }
    }
}

/// Write path selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Writes go to the store (or quorum) before returning
    WriteThrough,
    /// Writes are buffered and flushed in batches
    WriteBehind,
}

/// Cache facade configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Prepended to every key as `<namespace>:<key>`
    pub namespace: String,
    pub eviction: EvictionPolicyKind,
    pub codec: crate::cache::codec::CodecKind,
    pub compression: bool,
    /// Default TTL applied when a write does not carry one
    pub ttl: Duration,
    /// Entry-count ceiling enforced by eviction; `None` disables it
    pub max_size: Option<usize>,
    pub write_mode: WriteMode,
    /// Flush cadence for write-behind
    pub write_interval: Duration,
    /// Buffered-entry ceiling; overflow forces a synchronous flush
    pub write_buffer_size: usize,
    /// Sliding window for access pattern records
    pub access_pattern_window: Duration,
    /// Deadline applied to each cache operation
    pub operation_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            eviction: EvictionPolicyKind::Lru,
            codec: crate::cache::codec::CodecKind::Json,
            compression: false,
            ttl: Duration::from_secs(3600),
            max_size: None,
            write_mode: WriteMode::WriteThrough,
            write_interval: Duration::from_secs(5),
            write_buffer_size: 10_000,
            access_pattern_window: Duration::from_secs(3600),
            operation_timeout: Duration::from_secs(5),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::Config("namespace must not be empty".into()));
        }
        if self.write_buffer_size == 0 {
            return Err(Error::Config("write_buffer_size must be positive".into()));
        }
        Ok(())
    }

    /// Full store key for a caller key.
    pub fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

/// Stored form of a cache entry: codec-encoded payload plus metadata. The
/// same envelope is written by the facade, the write-behind flusher, the
/// warmer, and cluster sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredEntry {
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub access_count: u64,
    pub last_accessed: Option<DateTime<Utc>>,
    pub version: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl StoredEntry {
    pub fn new(payload: Vec<u8>, ttl: Option<Duration>) -> Self {
        let created_at = Utc::now();
        let expires_at = ttl.and_then(|d| {
            chrono::Duration::from_std(d)
                .ok()
                .map(|delta| created_at + delta)
        });
        Self {
            payload,
            created_at,
            expires_at,
            access_count: 0,
            last_accessed: None,
            version: 1,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }

    /// Record a read. `access_count` never decreases within one node's view.
    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed = Some(Utc::now());
    }
}
