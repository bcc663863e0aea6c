//! Pull-mode worker loop.
//!
//! - Reads new entries from the task stream through a consumer group
//! - Hands each to the [`TaskHandler`]
//! - Acknowledges Completed/Skipped outcomes; Retry, `lease_held` skips and
//!   errors stay pending and are reclaimed after `retry_idle` by any worker.
//!   `retry_idle` is longer than the step lease, so a reclaimed entry finds
//!   a crashed worker's lease already expired
//! - Dead-letters entries delivered `max_deliveries` times
//! - Supports graceful shutdown

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::dispatch::pull::{PullQueueError, QueuedTask, RedisTaskQueue};
use crate::task_handler::TaskHandler;

pub const DEFAULT_GROUP: &str = "fleetroute-workers";

#[derive(Debug, Clone)]
pub struct PullWorkerConfig {
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    pub block: Duration,
    /// Pending entries idle this long are taken over (redelivery).
    pub retry_idle: Duration,
    pub max_deliveries: u64,
}

impl PullWorkerConfig {
    /// Consumer named after the worker; reclaim idle derived from the lease.
    pub fn from_engine_config(config: &EngineConfig) -> Self {
        Self {
            group: DEFAULT_GROUP.to_string(),
            consumer: config.worker_name.clone(),
            batch_size: 10,
            block: Duration::from_secs(2),
            retry_idle: config.pull_retry_idle(),
            max_deliveries: 10,
        }
    }
}

/// Handle to stop and join a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the in-flight batch to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "pull worker task panicked");
        }
    }
}

pub struct PullQueueWorker {
    queue: Arc<RedisTaskQueue>,
    handler: Arc<TaskHandler>,
    config: PullWorkerConfig,
}

impl PullQueueWorker {
    pub fn new(queue: Arc<RedisTaskQueue>, handler: Arc<TaskHandler>, config: PullWorkerConfig) -> Self {
        Self { queue, handler, config }
    }

    pub fn spawn(self) -> WorkerHandle {
        let (shutdown, rx) = watch::channel(false);
        let join = tokio::spawn(async move { self.run(rx).await });
        WorkerHandle { shutdown, join }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let worker = Arc::new(self);
        if let Err(e) = worker.blocking(|q, c| q.ensure_group_sync(&c.group)).await {
            error!(error = %e, "failed to create consumer group");
        }
        info!(
            stream = worker.queue.stream_key(),
            group = %worker.config.group,
            consumer = %worker.config.consumer,
            "pull worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = match worker.next_batch().await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "failed to read task stream; backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };

            for task in batch {
                worker.process(task).await;
            }
        }
        info!(consumer = %worker.config.consumer, "pull worker stopped");
    }

    /// Idle pending entries first, then new ones.
    async fn next_batch(self: &Arc<Self>) -> Result<Vec<QueuedTask>, PullQueueError> {
        let idle_ms = self.config.retry_idle.as_millis() as u64;
        let reclaimed = self
            .blocking(move |q, c| q.claim_idle_sync(&c.group, &c.consumer, idle_ms, c.batch_size))
            .await?;
        if !reclaimed.is_empty() {
            debug!(count = reclaimed.len(), "reclaimed idle tasks");
            return Ok(reclaimed);
        }
        let block_ms = self.config.block.as_millis() as u64;
        self.blocking(move |q, c| q.read_new_sync(&c.group, &c.consumer, c.batch_size, block_ms))
            .await
    }

    async fn process(self: &Arc<Self>, task: QueuedTask) {
        let message = match &task.message {
            Ok(message) => message.clone(),
            Err(reason) => {
                let reason = format!("undecodable task: {reason}");
                self.handler.stats().message_dropped();
                self.dead_letter(task, reason).await;
                return;
            }
        };

        if task.deliveries > self.config.max_deliveries {
            let reason = format!("delivered {} times", task.deliveries);
            self.dead_letter(task, reason).await;
            return;
        }

        match self.handler.handle(&message).await {
            Ok(outcome) if outcome.settles_pull_entry() => {
                let ids = vec![task.entry_id.clone()];
                if let Err(e) = self.blocking(move |q, c| q.ack_sync(&c.group, &ids)).await {
                    warn!(entry_id = %task.entry_id, error = %e, "XACK failed; task will be redelivered");
                }
            }
            Ok(outcome) => {
                debug!(entry_id = %task.entry_id, ?outcome, "leaving task pending for redelivery");
            }
            Err(e) => {
                warn!(entry_id = %task.entry_id, task = %message, error = %e, "task failed; leaving pending");
            }
        }
    }

    async fn dead_letter(self: &Arc<Self>, task: QueuedTask, reason: String) {
        let entry_id = task.entry_id.clone();
        if let Err(e) = self
            .blocking(move |q, c| q.dead_letter_sync(&c.group, &task, &reason))
            .await
        {
            error!(entry_id = %entry_id, error = %e, "failed to dead-letter task");
        }
    }

    async fn blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T, PullQueueError>
    where
        F: FnOnce(&RedisTaskQueue, &PullWorkerConfig) -> Result<T, PullQueueError> + Send + 'static,
        T: Send + 'static,
    {
        let worker = self.clone();
        tokio::task::spawn_blocking(move || f(&worker.queue, &worker.config))
            .await
            .map_err(|e| PullQueueError::Command(format!("blocking task failed: {e}")))?
    }
}
