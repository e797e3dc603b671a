//! Write-behind buffering
//!
//! In write-behind mode the facade enqueues encoded entries here and returns
//! immediately. A background flusher swaps the buffer for an empty map on
//! each interval and issues one batched write. Entries lost to a failed
//! batch are not re-queued (at-most-once); a full buffer forces a
//! synchronous flush before the next write is accepted, and shutdown drains
//! the buffer once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::Backend;
use crate::error::Result;
use crate::metrics::MetricsSink;

pub struct WriteBehindBuffer {
    backend: Arc<Backend>,
    buffer: Mutex<HashMap<String, Vec<u8>>>,
    capacity: usize,
    ttl: Duration,
    interval: Duration,
    namespace: String,
    metrics: Arc<MetricsSink>,
    shutdown: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WriteBehindBuffer {
    pub(crate) fn new(
        backend: Arc<Backend>,
        capacity: usize,
        ttl: Duration,
        interval: Duration,
        namespace: impl Into<String>,
        metrics: Arc<MetricsSink>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            backend,
            buffer: Mutex::new(HashMap::new()),
            capacity,
            ttl,
            interval,
            namespace: namespace.into(),
            metrics,
            shutdown,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Queue an encoded entry. Duplicate keys overwrite; a full buffer is
    /// flushed synchronously first.
    pub async fn enqueue(&self, full_key: String, payload: Vec<u8>) -> Result<()> {
        {
            let mut buffer = self.buffer.lock().await;
            if buffer.len() < self.capacity || buffer.contains_key(&full_key) {
                buffer.insert(full_key, payload);
                return Ok(());
            }
        }
        debug!("Write-behind buffer full, forcing flush");
        self.flush().await?;
        self.buffer.lock().await.insert(full_key, payload);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Swap the buffer out and write everything in one batch.
    pub async fn flush(&self) -> Result<()> {
        let drained: HashMap<String, Vec<u8>> = {
            let mut buffer = self.buffer.lock().await;
            std::mem::take(&mut *buffer)
        };
        if drained.is_empty() {
            return Ok(());
        }
        let count = drained.len();

        let entries: Vec<(String, Vec<u8>, Option<Duration>)> = drained
            .into_iter()
            .map(|(key, payload)| (key, payload, Some(self.ttl)))
            .collect();

        match self.backend.write_batch(&entries).await {
            Ok(()) => {
                self.metrics.increment_counter(
                    "cache_batch_writes_total",
                    1.0,
                    &[("namespace", &self.namespace)],
                );
                Ok(())
            }
            Err(e) => {
                // At-most-once: the batch is gone, record and move on.
                error!("Write-behind flush dropped {count} entries: {e}");
                self.metrics.increment_counter(
                    "cache_write_behind_dropped_total",
                    count as f64,
                    &[("namespace", &self.namespace)],
                );
                Err(e)
            }
        }
    }

    /// Spawn the interval flusher.
    pub fn start(self: &Arc<Self>) {
        let buffer = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(buffer.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = buffer.flush().await {
                            error!("Write-behind flush failed: {e}");
                        }
                    }
                    _ = shutdown.changed() => {
                        // Final drain before exit.
                        if let Err(e) = buffer.flush().await {
                            error!("Write-behind shutdown drain failed: {e}");
                        }
                        return;
                    }
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
