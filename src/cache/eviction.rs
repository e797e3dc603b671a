//! Pluggable eviction policies
//!
//! Each policy keeps its bookkeeping in store-side auxiliary structures
//! (`cache:<policy>:<namespace>`) so candidate selection never walks the
//! values. Policies are approximate under concurrency; the store's native
//! expiry remains the backstop.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::seq::SliceRandom;

use super::types::EvictionPolicyKind;
use crate::error::Result;
use crate::store::KeyValueStore;

/// Capability surface shared by all eviction policies.
#[async_trait]
pub trait EvictionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Record that a key was read or written.
    async fn record_access(&self, key: &str) -> Result<()>;

    /// Up to `count` keys that should be evicted first.
    async fn eviction_candidates(&self, count: usize) -> Result<Vec<String>>;

    /// Drop a key's bookkeeping after it is deleted or evicted.
    async fn forget(&self, key: &str) -> Result<()>;
}

/// Build the policy selected by configuration.
pub fn create_policy(
    kind: EvictionPolicyKind,
    store: Arc<dyn KeyValueStore>,
    namespace: &str,
) -> Arc<dyn EvictionPolicy> {
    let meta_key = format!("cache:{}:{}", kind.as_str(), namespace);
    match kind {
        EvictionPolicyKind::Lru => Arc::new(LruPolicy { store, meta_key }),
        EvictionPolicyKind::Lfu => Arc::new(LfuPolicy { store, meta_key }),
        EvictionPolicyKind::Fifo => Arc::new(FifoPolicy { store, meta_key }),
        EvictionPolicyKind::Random => Arc::new(RandomPolicy { store, meta_key }),
        EvictionPolicyKind::Ttl => Arc::new(TtlPolicy),
    }
}

fn now_score() -> f64 {
    Utc::now().timestamp_micros() as f64
}

/// Least recently used: ordered by last-access time.
struct LruPolicy {
    store: Arc<dyn KeyValueStore>,
    meta_key: String,
}

#[async_trait]
impl EvictionPolicy for LruPolicy {
    fn name(&self) -> &'static str {
        "lru"
    }

    async fn record_access(&self, key: &str) -> Result<()> {
        self.store.zadd(&self.meta_key, key, now_score()).await
    }

    async fn eviction_candidates(&self, count: usize) -> Result<Vec<String>> {
        self.store.zrange(&self.meta_key, 0, count as i64 - 1).await
    }

    async fn forget(&self, key: &str) -> Result<()> {
        self.store.zrem(&self.meta_key, key).await
    }
}

/// Least frequently used: ordered by access count.
struct LfuPolicy {
    store: Arc<dyn KeyValueStore>,
    meta_key: String,
}

#[async_trait]
impl EvictionPolicy for LfuPolicy {
    fn name(&self) -> &'static str {
        "lfu"
    }

    async fn record_access(&self, key: &str) -> Result<()> {
        self.store.zincrby(&self.meta_key, key, 1.0).await.map(|_| ())
    }

    async fn eviction_candidates(&self, count: usize) -> Result<Vec<String>> {
        self.store.zrange(&self.meta_key, 0, count as i64 - 1).await
    }

    async fn forget(&self, key: &str) -> Result<()> {
        self.store.zrem(&self.meta_key, key).await
    }
}

/// First in, first out: ordered by first insert; later accesses are ignored.
struct FifoPolicy {
    store: Arc<dyn KeyValueStore>,
    meta_key: String,
}

#[async_trait]
impl EvictionPolicy for FifoPolicy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    async fn record_access(&self, key: &str) -> Result<()> {
        if self.store.zscore(&self.meta_key, key).await?.is_none() {
            self.store.zadd(&self.meta_key, key, now_score()).await?;
        }
        Ok(())
    }

    async fn eviction_candidates(&self, count: usize) -> Result<Vec<String>> {
        self.store.zrange(&self.meta_key, 0, count as i64 - 1).await
    }

    async fn forget(&self, key: &str) -> Result<()> {
        self.store.zrem(&self.meta_key, key).await
    }
}

/// Uniform random sampling without replacement.
struct RandomPolicy {
    store: Arc<dyn KeyValueStore>,
    meta_key: String,
}

#[async_trait]
impl EvictionPolicy for RandomPolicy {
    fn name(&self) -> &'static str {
        "random"
    }

    async fn record_access(&self, key: &str) -> Result<()> {
        self.store.sadd(&self.meta_key, key).await
    }

    async fn eviction_candidates(&self, count: usize) -> Result<Vec<String>> {
        let members = self.store.smembers(&self.meta_key).await?;
        let mut rng = rand::thread_rng();
        Ok(members
            .choose_multiple(&mut rng, count.min(members.len()))
            .cloned()
            .collect())
    }

    async fn forget(&self, key: &str) -> Result<()> {
        self.store.srem(&self.meta_key, key).await
    }
}

/// Store-native expiry handles reclamation; nothing to track.
struct TtlPolicy;

#[async_trait]
impl EvictionPolicy for TtlPolicy {
    fn name(&self) -> &'static str {
        "ttl"
    }

    async fn record_access(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn eviction_candidates(&self, _count: usize) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn forget(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn policy(kind: EvictionPolicyKind) -> Arc<dyn EvictionPolicy> {
        policy_with_store(kind).0
    }

    fn policy_with_store(kind: EvictionPolicyKind) -> (Arc<dyn EvictionPolicy>, Arc<MemoryStore>) {
        let store = MemoryStore::shared();
        (
            create_policy(kind, store.clone() as Arc<dyn KeyValueStore>, "t"),
            store,
        )
    }

    #[tokio::test]
    async fn test_lru_orders_by_recency() {
        let policy = policy(EvictionPolicyKind::Lru);
        policy.record_access("a").await.unwrap();
        policy.record_access("b").await.unwrap();
        policy.record_access("a").await.unwrap();

        // "b" is now the least recently used
        assert_eq!(policy.eviction_candidates(1).await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_lfu_orders_by_frequency() {
        let policy = policy(EvictionPolicyKind::Lfu);
        for _ in 0..3 {
            policy.record_access("hot").await.unwrap();
        }
        policy.record_access("cold").await.unwrap();

        assert_eq!(policy.eviction_candidates(1).await.unwrap(), vec!["cold"]);
    }

    #[tokio::test]
    async fn test_fifo_ignores_later_accesses() {
        let policy = policy(EvictionPolicyKind::Fifo);
        policy.record_access("first").await.unwrap();
        policy.record_access("second").await.unwrap();
        policy.record_access("first").await.unwrap();

        assert_eq!(policy.eviction_candidates(1).await.unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn test_random_samples_without_replacement() {
        let policy = policy(EvictionPolicyKind::Random);
        for key in ["a", "b", "c", "d"] {
            policy.record_access(key).await.unwrap();
        }

        let candidates = policy.eviction_candidates(3).await.unwrap();
        assert_eq!(candidates.len(), 3);
        let unique: std::collections::HashSet<_> = candidates.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[tokio::test]
    async fn test_ttl_policy_is_inert() {
        let policy = policy(EvictionPolicyKind::Ttl);
        policy.record_access("a").await.unwrap();
        assert!(policy.eviction_candidates(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_forget_removes_bookkeeping() {
        let (policy, store) = policy_with_store(EvictionPolicyKind::Lru);
        policy.record_access("a").await.unwrap();
        policy.forget("a").await.unwrap();
        assert!(policy.eviction_candidates(1).await.unwrap().is_empty());
        assert_eq!(store.zscore("cache:lru:t", "a").await.unwrap(), None);
    }
}
