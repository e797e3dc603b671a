//! Key/value store protocol
//!
//! The cache core runs against any store exposing this surface: plain
//! key/value with TTLs, cursor-based SCAN with glob matching, pipelined batch
//! writes, sorted sets and sets for eviction metadata, pub/sub for cluster
//! sync, and PING for heartbeats. `MemoryStore` implements the whole surface
//! in-process for tests and single-process deployments; `RedisStore` adapts
//! a Redis node.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use regex::Regex;

use crate::error::{Error, Result};

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use self::redis::{RedisStore, StoreConnectionConfig};

/// Stream of raw payloads delivered on a subscribed channel.
pub struct PubSubStream {
    inner: Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>,
}

impl PubSubStream {
    pub fn new(inner: Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>) -> Self {
        Self { inner }
    }

    /// Next message, or `None` once the publisher side is gone.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.inner.next().await
    }
}

/// Entry for a pipelined batch write: key, payload, optional TTL.
pub type BatchEntry = (String, Vec<u8>, Option<Duration>);

/// Minimal store surface required by the cache core.
///
/// All operations are async and may fail with `StoreUnavailable` or
/// `Timeout`; none of them panic on transport errors.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;
    /// Delete keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<usize>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Remaining TTL for a key, `None` when the key has no expiry or is gone.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;
    /// Cursor-based iteration over keys matching a glob pattern. A returned
    /// cursor of 0 means the scan is complete.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)>;
    /// Pipelined multi-set.
    async fn set_batch(&self, entries: &[BatchEntry]) -> Result<()>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> Result<f64>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;
    /// Members ordered by ascending score; `start`/`stop` are inclusive rank
    /// bounds with Redis semantics (negative counts from the end).
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
    async fn zrem(&self, key: &str, member: &str) -> Result<()>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
    async fn srem(&self, key: &str, member: &str) -> Result<()>;
    async fn scard(&self, key: &str) -> Result<usize>;

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;
    async fn subscribe(&self, channel: &str) -> Result<PubSubStream>;

    async fn ping(&self) -> Result<()>;
}

/// Drain a full SCAN for `pattern`, following cursors until exhaustion.
pub async fn scan_all(store: &dyn KeyValueStore, pattern: &str) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut cursor = 0u64;
    loop {
        let (next, batch) = store.scan(cursor, pattern, 100).await?;
        keys.extend(batch);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    Ok(keys)
}

/// Count keys matching `pattern` without materializing them all at once.
pub async fn count_matching(store: &dyn KeyValueStore, pattern: &str) -> Result<usize> {
    let mut count = 0usize;
    let mut cursor = 0u64;
    loop {
        let (next, batch) = store.scan(cursor, pattern, 100).await?;
        count += batch.len();
        if next == 0 {
            break;
        }
        cursor = next;
    }
    Ok(count)
}

/// Compile a Redis-style glob pattern (`*`, `?`, `[...]`) into a regex
/// anchored at both ends.
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            '[' => {
                expr.push('[');
                for inner in chars.by_ref() {
                    expr.push(inner);
                    if inner == ']' {
                        break;
                    }
                }
            }
            '\\' => {
                if let Some(&next) = chars.peek() {
                    expr.push_str(&regex::escape(&next.to_string()));
                    chars.next();
                }
            }
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| Error::Config(format!("invalid pattern {pattern:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_star() {
        let re = glob_to_regex("users:*").unwrap();
        assert!(re.is_match("users:1"));
        assert!(re.is_match("users:profile:9"));
        assert!(!re.is_match("sessions:1"));
    }

    #[test]
    fn test_glob_question_mark() {
        let re = glob_to_regex("k?y").unwrap();
        assert!(re.is_match("key"));
        assert!(!re.is_match("keey"));
    }

    #[test]
    fn test_glob_escapes_regex_metachars() {
        let re = glob_to_regex("a.b+c:*").unwrap();
        assert!(re.is_match("a.b+c:1"));
        assert!(!re.is_match("aXb+c:1"));
    }

    #[test]
    fn test_glob_char_class() {
        let re = glob_to_regex("h[ae]llo").unwrap();
        assert!(re.is_match("hallo"));
        assert!(re.is_match("hello"));
        assert!(!re.is_match("hillo"));
    }
}
