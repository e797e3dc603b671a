//! Redis adapter for the store protocol
//!
//! Each cluster node is reached through a `ConnectionManager`, which
//! multiplexes requests over a single auto-reconnecting connection. Pub/sub
//! uses a dedicated connection, as the protocol requires.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::Client;

use super::{BatchEntry, KeyValueStore, PubSubStream};
use crate::error::{Error, Result};

/// Connection settings for one store node.
#[derive(Debug, Clone)]
pub struct StoreConnectionConfig {
    /// Connection URL, e.g. `redis://10.0.0.1:6379`
    pub url: String,
    /// Deadline applied to every command
    pub response_timeout: Duration,
}

impl StoreConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            response_timeout: Duration::from_secs(5),
        }
    }

    pub fn for_node(host: &str, port: u16) -> Self {
        Self::new(format!("redis://{host}:{port}"))
    }
}

/// Store protocol implementation over a Redis node.
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
    response_timeout: Duration,
}

impl RedisStore {
    pub async fn connect(config: StoreConnectionConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| Error::Config(format!("invalid store url {}: {e}", config.url)))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| Error::StoreUnavailable(format!("connect {}: {e}", config.url)))?;
        Ok(Self {
            client,
            manager,
            response_timeout: config.response_timeout,
        })
    }

    async fn run<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.response_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::StoreUnavailable(format!("{op}: {e}"))),
            Err(_) => Err(Error::Timeout(op.to_string())),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn();
        self.run("GET", async move {
            redis::cmd("GET").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        self.run("SET", async move { cmd.query_async(&mut conn).await })
            .await
    }

    async fn del(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        self.run("DEL", async move { cmd.query_async(&mut conn).await })
            .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let count: i64 = self
            .run("EXISTS", async move {
                redis::cmd("EXISTS").arg(key).query_async(&mut conn).await
            })
            .await?;
        Ok(count > 0)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn();
        let millis: i64 = self
            .run("PTTL", async move {
                redis::cmd("PTTL").arg(key).query_async(&mut conn).await
            })
            .await?;
        // -2 = missing key, -1 = no expiry
        if millis < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_millis(millis as u64)))
        }
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let mut conn = self.conn();
        self.run("SCAN", async move {
            redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn set_batch(&self, entries: &[BatchEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        for (key, value, ttl) in entries {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value.as_slice());
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl.as_millis() as u64);
            }
            pipe.add_command(cmd).ignore();
        }
        self.run("PIPELINE SET", async move {
            pipe.query_async::<_, ()>(&mut conn).await
        })
        .await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn();
        self.run("ZADD", async move {
            redis::cmd("ZADD")
                .arg(key)
                .arg(score)
                .arg(member)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn zincrby(&self, key: &str, member: &str, delta: f64) -> Result<f64> {
        let mut conn = self.conn();
        self.run("ZINCRBY", async move {
            redis::cmd("ZINCRBY")
                .arg(key)
                .arg(delta)
                .arg(member)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut conn = self.conn();
        self.run("ZSCORE", async move {
            redis::cmd("ZSCORE")
                .arg(key)
                .arg(member)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut conn = self.conn();
        self.run("ZRANGE", async move {
            redis::cmd("ZRANGE")
                .arg(key)
                .arg(start)
                .arg(stop)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn();
        self.run("ZREM", async move {
            redis::cmd("ZREM")
                .arg(key)
                .arg(member)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn();
        self.run("SADD", async move {
            redis::cmd("SADD")
                .arg(key)
                .arg(member)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        self.run("SMEMBERS", async move {
            redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn();
        self.run("SREM", async move {
            redis::cmd("SREM")
                .arg(key)
                .arg(member)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn();
        self.run("SCARD", async move {
            redis::cmd("SCARD").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.conn();
        self.run("PUBLISH", async move {
            redis::cmd("PUBLISH")
                .arg(channel)
                .arg(payload)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn subscribe(&self, channel: &str) -> Result<PubSubStream> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| Error::StoreUnavailable(format!("SUBSCRIBE connect: {e}")))?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("SUBSCRIBE {channel}: {e}")))?;
        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec());
        Ok(PubSubStream::new(Box::pin(stream)))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        self.run("PING", async move {
            redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await
        })
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_for_node() {
        let config = StoreConnectionConfig::for_node("10.1.2.3", 6380);
        assert_eq!(config.url, "redis://10.1.2.3:6380");
        assert_eq!(config.response_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_url() {
        let result = RedisStore::connect(StoreConnectionConfig::new("not a url")).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
