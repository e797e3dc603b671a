//! In-memory implementation of the store protocol
//!
//! Backs unit and integration tests and single-process deployments. Entries
//! expire lazily: an expired key is dropped the next time any operation
//! touches it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{glob_to_regex, BatchEntry, KeyValueStore, PubSubStream};
use crate::error::Result;

#[derive(Clone)]
struct Stored {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Stored {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Complete in-process store: key/value with TTL, sorted sets, sets, pub/sub.
pub struct MemoryStore {
    entries: DashMap<String, Stored>,
    zsets: Mutex<HashMap<String, HashMap<String, f64>>>,
    sets: Mutex<HashMap<String, HashSet<String>>>,
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            zsets: Mutex::new(HashMap::new()),
            sets: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Shared handle, the shape the cluster connector hands out.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn live_keys(&self) -> Vec<String> {
        let mut expired = Vec::new();
        let mut keys = Vec::new();
        for item in self.entries.iter() {
            if item.value().is_expired() {
                expired.push(item.key().clone());
            } else {
                keys.push(item.key().clone());
            }
        }
        for key in expired {
            self.entries.remove(&key);
        }
        keys.sort();
        keys
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        let mut channels = self.channels.lock();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.data.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Stored {
                data: value.to_vec(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            if let Some((_, stored)) = self.entries.remove(key) {
                if !stored.is_expired() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                return Ok(None);
            }
            return Ok(entry
                .expires_at
                .map(|at| at.saturating_duration_since(Instant::now())));
        }
        Ok(None)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let re = glob_to_regex(pattern)?;
        let matching: Vec<String> = self
            .live_keys()
            .into_iter()
            .filter(|k| re.is_match(k))
            .collect();

        let offset = cursor as usize;
        if offset >= matching.len() {
            return Ok((0, Vec::new()));
        }
        let end = (offset + count.max(1)).min(matching.len());
        let batch = matching[offset..end].to_vec();
        let next = if end >= matching.len() { 0 } else { end as u64 };
        Ok((next, batch))
    }

    async fn set_batch(&self, entries: &[BatchEntry]) -> Result<()> {
        for (key, value, ttl) in entries {
            self.set(key, value, *ttl).await?;
        }
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut zsets = self.zsets.lock();
        zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> Result<f64> {
        let mut zsets = self.zsets.lock();
        let entry = zsets
            .entry(key.to_string())
            .or_default()
            .entry(member.to_string())
            .or_insert(0.0);
        *entry += delta;
        Ok(*entry)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let zsets = self.zsets.lock();
        Ok(zsets.get(key).and_then(|m| m.get(member).copied()))
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let zsets = self.zsets.lock();
        let Some(members) = zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut ordered: Vec<(&String, f64)> = members.iter().map(|(m, s)| (m, *s)).collect();
        ordered.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(b.0)));

        let len = ordered.len() as i64;
        let lo = if start < 0 { (len + start).max(0) } else { start.min(len) };
        let hi = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if lo > hi || hi < 0 {
            return Ok(Vec::new());
        }
        Ok(ordered[lo as usize..=(hi as usize)]
            .iter()
            .map(|(m, _)| (*m).clone())
            .collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let mut zsets = self.zsets.lock();
        if let Some(members) = zsets.get_mut(key) {
            members.remove(member);
            if members.is_empty() {
                zsets.remove(key);
            }
        }
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut sets = self.sets.lock();
        sets.entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let sets = self.sets.lock();
        Ok(sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut sets = self.sets.lock();
        if let Some(members) = sets.get_mut(key) {
            members.remove(member);
            if members.is_empty() {
                sets.remove(key);
            }
        }
        Ok(())
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        let sets = self.sets.lock();
        Ok(sets.get(key).map(|s| s.len()).unwrap_or(0))
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        // No subscribers is not an error, matching Redis PUBLISH.
        let _ = self.sender_for(channel).send(payload.to_vec());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<PubSubStream> {
        let rx = self.sender_for(channel).subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(PubSubStream::new(Box::pin(stream)))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_del() {
        let store = MemoryStore::new();
        store.set("k1", b"v1", None).await.unwrap();
        assert_eq!(store.get("k1").await.unwrap(), Some(b"v1".to_vec()));
        assert!(store.exists("k1").await.unwrap());

        let removed = store.del(&["k1".to_string(), "nope".to_string()]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set("short", b"v", Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(store.ttl("short").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("short").await.unwrap(), None);
        assert_eq!(store.ttl("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_with_pattern_and_cursor() {
        let store = MemoryStore::new();
        for i in 0..25 {
            store
                .set(&format!("app:key{i:02}"), b"v", None)
                .await
                .unwrap();
        }
        store.set("other:x", b"v", None).await.unwrap();

        let mut collected = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, batch) = store.scan(cursor, "app:*", 10).await.unwrap();
            collected.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(collected.len(), 25);
        assert!(collected.iter().all(|k| k.starts_with("app:")));
    }

    #[tokio::test]
    async fn test_zset_ordering_and_range() {
        let store = MemoryStore::new();
        store.zadd("z", "c", 3.0).await.unwrap();
        store.zadd("z", "a", 1.0).await.unwrap();
        store.zadd("z", "b", 2.0).await.unwrap();

        assert_eq!(store.zrange("z", 0, 1).await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.zrange("z", 0, -1).await.unwrap(), vec!["a", "b", "c"]);

        store.zrem("z", "a").await.unwrap();
        assert_eq!(store.zrange("z", 0, 0).await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_zincrby_accumulates() {
        let store = MemoryStore::new();
        assert_eq!(store.zincrby("z", "m", 1.0).await.unwrap(), 1.0);
        assert_eq!(store.zincrby("z", "m", 2.5).await.unwrap(), 3.5);
        assert_eq!(store.zscore("z", "m").await.unwrap(), Some(3.5));
    }

    #[tokio::test]
    async fn test_sets() {
        let store = MemoryStore::new();
        store.sadd("s", "x").await.unwrap();
        store.sadd("s", "y").await.unwrap();
        store.sadd("s", "x").await.unwrap();
        assert_eq!(store.scard("s").await.unwrap(), 2);

        store.srem("s", "x").await.unwrap();
        assert_eq!(store.smembers("s").await.unwrap(), vec!["y"]);
    }

    #[tokio::test]
    async fn test_pubsub_roundtrip() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("events").await.unwrap();
        store.publish("events", b"hello").await.unwrap();
        assert_eq!(sub.next().await, Some(b"hello".to_vec()));
    }
}
