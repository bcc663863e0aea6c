//! In-process transport.
//!
//! `enqueue` hands the message straight to the [`TaskHandler`] and awaits it,
//! so a submission in inline mode drives the whole chain before returning.
//! Retry outcomes are redelivered here the way a real queue would, up to
//! `max_deliveries`.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{EnqueueError, QueueDispatcher, TaskMessage};
use crate::config::DispatchMode;
use crate::retry::RetryPolicy;
use crate::task_handler::{TaskHandler, TaskOutcome};

pub struct InlineDispatcher {
    handler: OnceLock<Weak<TaskHandler>>,
    redelivery: RetryPolicy,
}

impl InlineDispatcher {
    pub fn new(max_deliveries: u32) -> Self {
        Self {
            handler: OnceLock::new(),
            redelivery: RetryPolicy::linear(
                max_deliveries.max(1),
                Duration::from_millis(200),
                Duration::from_secs(2),
            ),
        }
    }

    /// Attach the handler. The handler owns the runner which owns this
    /// dispatcher, so only a weak reference is kept. Later calls are ignored.
    pub fn bind(&self, handler: &Arc<TaskHandler>) {
        if self.handler.set(Arc::downgrade(handler)).is_err() {
            debug!("inline dispatcher already bound");
        }
    }

    fn handler(&self) -> Result<Arc<TaskHandler>, EnqueueError> {
        self.handler
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| EnqueueError::NotConfigured {
                mode: DispatchMode::Inline,
                detail: "no task handler bound".to_string(),
            })
    }
}

#[async_trait]
impl QueueDispatcher for InlineDispatcher {
    fn mode(&self) -> DispatchMode {
        DispatchMode::Inline
    }

    async fn enqueue(&self, message: TaskMessage) -> Result<(), EnqueueError> {
        let handler = self.handler()?;
        let mut deliveries = 0;
        loop {
            deliveries += 1;
            match handler.handle(&message).await {
                Ok(TaskOutcome::Completed | TaskOutcome::Skipped { .. }) => return Ok(()),
                Ok(TaskOutcome::Retry { reason }) => {
                    if !self.redelivery.should_retry(deliveries) {
                        warn!(task = %message, deliveries, reason = %reason, "inline delivery limit reached; dropping task");
                        return Ok(());
                    }
                    debug!(task = %message, deliveries, reason = %reason, "redelivering inline task");
                }
                Err(e) => {
                    if !self.redelivery.should_retry(deliveries) {
                        return Err(EnqueueError::transport(DispatchMode::Inline, e.to_string()));
                    }
                    warn!(task = %message, deliveries, error = %e, "inline task failed; redelivering");
                }
            }
            tokio::time::sleep(self.redelivery.delay_for_attempt(deliveries)).await;
        }
    }
}
