use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::payloads::IncomingJob;

/// One entry read from the queue. `payload` is the raw JSON job; it is
/// parsed by the worker so malformed entries can still be acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: String,
    pub payload: String,
}

impl Delivery {
    pub fn job(&self) -> std::result::Result<IncomingJob, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &IncomingJob) -> Result<String>;
    /// Entries delivered to this consumer earlier but never acknowledged.
    async fn pending(&self) -> Result<Vec<Delivery>>;
    /// New entries; waits a bounded time when the queue is empty.
    async fn next_batch(&self) -> Result<Vec<Delivery>>;
    async fn ack(&self, id: &str) -> Result<()>;
}

pub struct RedisStreamQueue {
    conn: MultiplexedConnection,
    stream_key: String,
    group: String,
    consumer: String,
}

impl RedisStreamQueue {
    pub fn new(
        conn: MultiplexedConnection,
        stream_key: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            conn,
            stream_key: stream_key.into(),
            group: group.into(),
            consumer: consumer.into(),
        }
    }

    /// Creates the consumer group (and the stream) if needed.
    pub async fn ensure_group(&self) -> Result<()> {
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut self.conn.clone())
            .await;
        match created {
            Ok(()) => info!(stream = self.stream_key, group = self.group, "Created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(group = self.group, "Consumer group already exists")
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn read(&self, start_id: &str, block_ms: Option<usize>) -> Result<Vec<Delivery>> {
        let mut opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(10);
        if let Some(ms) = block_ms {
            opts = opts.block(ms);
        }

        let reply: Option<StreamReadReply> = self
            .conn
            .clone()
            .xread_options(&[&self.stream_key], &[start_id], &opts)
            .await?;

        let mut deliveries = Vec::new();
        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in stream.ids {
                let payload = entry
                    .map
                    .get("payload")
                    .and_then(|v| redis::from_redis_value::<String>(v).ok());
                match payload {
                    Some(payload) => deliveries.push(Delivery { id: entry.id, payload }),
                    None => {
                        warn!(id = entry.id, "Stream entry without payload, acknowledging");
                        self.ack(&entry.id).await?;
                    }
                }
            }
        }
        Ok(deliveries)
    }
}

#[async_trait]
impl JobQueue for RedisStreamQueue {
    async fn enqueue(&self, job: &IncomingJob) -> Result<String> {
        let payload = serde_json::to_string(job)?;
        let id: String = self
            .conn
            .clone()
            .xadd(&self.stream_key, "*", &[("payload", payload)])
            .await?;
        Ok(id)
    }

    async fn pending(&self) -> Result<Vec<Delivery>> {
        self.read("0", None).await
    }

    async fn next_batch(&self) -> Result<Vec<Delivery>> {
        self.read(">", Some(5000)).await
    }

    async fn ack(&self, id: &str) -> Result<()> {
        let _: () = self
            .conn
            .clone()
            .xack(&self.stream_key, &self.group, &[id])
            .await?;
        Ok(())
    }
}

/// In-process queue with the same delivery/ack semantics as the stream.
pub struct MemoryQueue {
    inner: Mutex<MemoryQueueInner>,
    notify: Notify,
    block: Duration,
}

#[derive(Default)]
struct MemoryQueueInner {
    next_id: u64,
    ready: VecDeque<Delivery>,
    unacked: BTreeMap<String, Delivery>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl MemoryQueue {
    pub fn new(block: Duration) -> Self {
        Self {
            inner: Mutex::new(MemoryQueueInner::default()),
            notify: Notify::new(),
            block,
        }
    }

    /// Jobs enqueued but not yet acknowledged, in enqueue order.
    pub async fn jobs(&self) -> Vec<IncomingJob> {
        let inner = self.inner.lock().await;
        inner
            .unacked
            .values()
            .chain(inner.ready.iter())
            .filter_map(|d| d.job().ok())
            .collect()
    }

    pub async fn unacked_len(&self) -> usize {
        self.inner.lock().await.unacked.len()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: &IncomingJob) -> Result<String> {
        let payload = serde_json::to_string(job)?;
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = format!("{:020}-0", inner.next_id);
        inner.ready.push_back(Delivery { id: id.clone(), payload });
        drop(inner);
        self.notify.notify_one();
        Ok(id)
    }

    async fn pending(&self) -> Result<Vec<Delivery>> {
        Ok(self.inner.lock().await.unacked.values().cloned().collect())
    }

    async fn next_batch(&self) -> Result<Vec<Delivery>> {
        if self.inner.lock().await.ready.is_empty() {
            let _ = tokio::time::timeout(self.block, self.notify.notified()).await;
        }
        let mut inner = self.inner.lock().await;
        let take = inner.ready.len().min(10);
        let batch: Vec<Delivery> = inner.ready.drain(..take).collect();
        for delivery in &batch {
            inner.unacked.insert(delivery.id.clone(), delivery.clone());
        }
        Ok(batch)
    }

    async fn ack(&self, id: &str) -> Result<()> {
        self.inner.lock().await.unacked.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hook_job(n: u32) -> IncomingJob {
        IncomingJob::HookTriggered {
            hook_id: format!("hook-{n}"),
            data: json!({"n": n}),
        }
    }

    #[tokio::test]
    async fn delivered_entries_stay_pending_until_acked() {
        let queue = MemoryQueue::default();
        queue.enqueue(&hook_job(1)).await.unwrap();
        queue.enqueue(&hook_job(2)).await.unwrap();

        let batch = queue.next_batch().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].job().unwrap(), hook_job(1));
        assert_eq!(queue.pending().await.unwrap().len(), 2);

        queue.ack(&batch[0].id).await.unwrap();
        let pending = queue.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, batch[1].id);
    }

    #[tokio::test]
    async fn empty_queue_returns_empty_batch() {
        let queue = MemoryQueue::new(Duration::from_millis(5));
        assert!(queue.next_batch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batches_are_capped() {
        let queue = MemoryQueue::default();
        for n in 0..12 {
            queue.enqueue(&hook_job(n)).await.unwrap();
        }
        assert_eq!(queue.next_batch().await.unwrap().len(), 10);
        assert_eq!(queue.next_batch().await.unwrap().len(), 2);
    }
}
