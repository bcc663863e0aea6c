//! Redis Streams transport (pull mode).
//!
//! - **Stream key**: `fleetroute:tasks` unless configured otherwise
//! - **Consumer group**: one group shared by every `fleetroute-worker`
//! - **Dead-letter stream**: `{stream}:dlq`, for entries past the delivery limit
//!
//! The redis client is synchronous; async callers go through
//! `spawn_blocking`.

use std::sync::Arc;

use async_trait::async_trait;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use tracing::{instrument, warn};

use super::{EnqueueError, QueueDispatcher, TaskMessage};
use crate::config::DispatchMode;

#[derive(Debug, thiserror::Error)]
pub enum PullQueueError {
    #[error("redis connection error: {0}")]
    Connection(String),

    #[error("redis command error: {0}")]
    Command(String),

    #[error("task encoding error: {0}")]
    Encode(String),
}

/// One stream entry handed to a worker.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub entry_id: String,
    /// 1 on first delivery.
    pub deliveries: u64,
    /// Raw payload is kept for the dead-letter stream when decoding fails.
    pub payload: Option<String>,
    pub message: Result<TaskMessage, String>,
}

#[derive(Debug, Clone)]
pub struct RedisTaskQueue {
    client: Arc<redis::Client>,
    stream_key: String,
    dlq_key: String,
}

impl RedisTaskQueue {
    pub fn open(redis_url: &str, stream_key: impl Into<String>) -> Result<Self, PullQueueError> {
        let client = redis::Client::open(redis_url).map_err(|e| PullQueueError::Connection(e.to_string()))?;
        let stream_key = stream_key.into();
        Ok(Self {
            client: Arc::new(client),
            dlq_key: format!("{stream_key}:dlq"),
            stream_key,
        })
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub fn dlq_key(&self) -> &str {
        &self.dlq_key
    }

    fn connection(&self) -> Result<redis::Connection, PullQueueError> {
        self.client
            .get_connection()
            .map_err(|e| PullQueueError::Connection(e.to_string()))
    }

    /// XADD the message; returns the entry id.
    pub fn push_sync(&self, message: &TaskMessage) -> Result<String, PullQueueError> {
        let payload = serde_json::to_string(message).map_err(|e| PullQueueError::Encode(e.to_string()))?;
        let mut conn = self.connection()?;
        redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("job_id")
            .arg(&message.job_id)
            .arg("payload")
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| PullQueueError::Command(format!("XADD failed: {e}")))
    }

    /// Create the consumer group (and stream) if missing.
    pub fn ensure_group_sync(&self, group: &str) -> Result<(), PullQueueError> {
        let mut conn = self.connection()?;
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(PullQueueError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    /// Read entries never delivered to the group, blocking up to `block_ms`.
    pub fn read_new_sync(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<QueuedTask>, PullQueueError> {
        let mut conn = self.connection()?;
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query(&mut conn)
            .map_err(|e| PullQueueError::Command(format!("XREADGROUP failed: {e}")))?;

        Ok(reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).map(|id| decode(id, 1)).collect())
            .unwrap_or_default())
    }

    /// Take over entries another consumer left pending for at least
    /// `min_idle_ms` (crashed worker, or a Retry outcome left un-acked).
    pub fn claim_idle_sync(
        &self,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<QueuedTask>, PullQueueError> {
        let mut conn = self.connection()?;
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query(&mut conn)
            .map_err(|e| PullQueueError::Command(format!("XPENDING failed: {e}")))?;
        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = pending.ids.iter().map(|p| p.id.as_str()).collect();
        let claimed: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg(&ids)
            .query(&mut conn)
            .map_err(|e| PullQueueError::Command(format!("XCLAIM failed: {e}")))?;

        Ok(claimed
            .ids
            .into_iter()
            .map(|entry| {
                let previous = pending
                    .ids
                    .iter()
                    .find(|p| p.id == entry.id)
                    .map(|p| p.times_delivered as u64)
                    .unwrap_or(0);
                decode(entry, previous + 1)
            })
            .collect())
    }

    pub fn ack_sync(&self, group: &str, entry_ids: &[String]) -> Result<(), PullQueueError> {
        if entry_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection()?;
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(group)
            .arg(entry_ids)
            .query(&mut conn)
            .map_err(|e| PullQueueError::Command(format!("XACK failed: {e}")))?;
        Ok(())
    }

    /// Copy the entry to the dead-letter stream, then acknowledge it.
    pub fn dead_letter_sync(&self, group: &str, task: &QueuedTask, reason: &str) -> Result<(), PullQueueError> {
        let mut conn = self.connection()?;
        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("original_entry_id")
            .arg(&task.entry_id)
            .arg("deliveries")
            .arg(task.deliveries)
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg("payload")
            .arg(task.payload.as_deref().unwrap_or(""))
            .query(&mut conn)
            .map_err(|e| PullQueueError::Command(format!("DLQ XADD failed: {e}")))?;

        warn!(entry_id = %task.entry_id, deliveries = task.deliveries, reason, "task moved to dead-letter stream");
        self.ack_sync(group, std::slice::from_ref(&task.entry_id))
    }
}

fn decode(entry: StreamId, deliveries: u64) -> QueuedTask {
    let payload: Option<String> = entry.get("payload");
    let message = match payload.as_deref() {
        Some(raw) => serde_json::from_str::<TaskMessage>(raw).map_err(|e| e.to_string()),
        None => Err("missing payload field".to_string()),
    };
    QueuedTask {
        entry_id: entry.id,
        deliveries,
        payload,
        message,
    }
}

/// [`QueueDispatcher`] that XADDs onto the task stream.
#[derive(Debug, Clone)]
pub struct PullQueueDispatcher {
    queue: Arc<RedisTaskQueue>,
}

impl PullQueueDispatcher {
    pub fn new(queue: Arc<RedisTaskQueue>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<RedisTaskQueue> {
        &self.queue
    }
}

#[async_trait]
impl QueueDispatcher for PullQueueDispatcher {
    fn mode(&self) -> DispatchMode {
        DispatchMode::Pull
    }

    #[instrument(skip(self, message), fields(task = %message, stream = %self.queue.stream_key()), err)]
    async fn enqueue(&self, message: TaskMessage) -> Result<(), EnqueueError> {
        let queue = self.queue.clone();
        tokio::task::spawn_blocking(move || queue.push_sync(&message))
            .await
            .map_err(|e| EnqueueError::transport(DispatchMode::Pull, format!("enqueue task panicked: {e}")))?
            .map(|_| ())
            .map_err(|e| match e {
                PullQueueError::Encode(detail) => EnqueueError::Encode(detail),
                other => EnqueueError::transport(DispatchMode::Pull, other.to_string()),
            })
    }
}
