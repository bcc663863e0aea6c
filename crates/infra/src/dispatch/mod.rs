//! Queue Dispatcher: transport for "run this step" messages.
//!
//! One trait, three transports, chosen once when the engine is built:
//!
//! - `push`: a managed push queue that POSTs each task to `/tasks/handle`
//! - `pull`: a Redis stream drained by `fleetroute-worker` processes
//! - `inline`: the task handler runs in-process (development, tests)
//!
//! Orchestration code only ever sees [`QueueDispatcher`]. Messages carry ids,
//! never job state; every receiver re-reads the record.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleetroute_core::{JobId, StepName};

use crate::config::DispatchMode;

pub mod inline;
#[cfg(feature = "redis")]
pub mod pull;
pub mod push;

pub use inline::InlineDispatcher;
#[cfg(feature = "redis")]
pub use pull::{PullQueueDispatcher, RedisTaskQueue};
pub use push::PushQueueDispatcher;

/// What the receiver should do with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TaskKind {
    #[default]
    #[serde(rename = "pipeline_step")]
    PipelineStep,
    #[serde(rename = "generic_job", alias = "job")]
    GenericJob,
}

/// Queue payload.
///
/// Ids are kept as raw strings so a malformed message can still be decoded,
/// logged and acknowledged instead of being redelivered forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    #[serde(default)]
    pub kind: TaskKind,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

impl TaskMessage {
    pub fn pipeline_step(job_id: &JobId, step: StepName) -> Self {
        Self {
            kind: TaskKind::PipelineStep,
            job_id: job_id.to_string(),
            step: Some(step.as_str().to_string()),
        }
    }

    pub fn generic_job(job_id: &JobId) -> Self {
        Self {
            kind: TaskKind::GenericJob,
            job_id: job_id.to_string(),
            step: None,
        }
    }
}

impl std::fmt::Display for TaskMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.kind, &self.step) {
            (TaskKind::PipelineStep, Some(step)) => write!(f, "pipeline_step {}/{}", self.job_id, step),
            (TaskKind::PipelineStep, None) => write!(f, "pipeline_step {}", self.job_id),
            (TaskKind::GenericJob, _) => write!(f, "generic_job {}", self.job_id),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("{mode} dispatcher is not configured: {detail}")]
    NotConfigured { mode: DispatchMode, detail: String },

    #[error("{mode} enqueue failed: {detail}")]
    Transport { mode: DispatchMode, detail: String },

    #[error("failed to encode task: {0}")]
    Encode(String),
}

impl EnqueueError {
    pub fn transport(mode: DispatchMode, detail: impl Into<String>) -> Self {
        Self::Transport {
            mode,
            detail: detail.into(),
        }
    }

    /// Stable error code surfaced to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            EnqueueError::NotConfigured { mode: DispatchMode::Push, .. } => "PUSH_QUEUE_NOT_CONFIGURED",
            EnqueueError::NotConfigured { mode: DispatchMode::Pull, .. } => "PULL_QUEUE_NOT_CONFIGURED",
            EnqueueError::NotConfigured { mode: DispatchMode::Inline, .. } => "INLINE_DISPATCH_NOT_BOUND",
            EnqueueError::Transport { mode: DispatchMode::Push, .. } => "PUSH_QUEUE_ENQUEUE_FAILED",
            EnqueueError::Transport { mode: DispatchMode::Pull, .. } => "PULL_QUEUE_ENQUEUE_FAILED",
            EnqueueError::Transport { mode: DispatchMode::Inline, .. } => "INLINE_DISPATCH_FAILED",
            EnqueueError::Encode(_) => "TASK_ENCODE_FAILED",
        }
    }
}

#[async_trait]
pub trait QueueDispatcher: Send + Sync {
    fn mode(&self) -> DispatchMode;

    /// Hand `message` to the transport. Returns once the transport has
    /// accepted it (or, inline, once it has been handled).
    async fn enqueue(&self, message: TaskMessage) -> Result<(), EnqueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_defaults_to_pipeline_step_and_accepts_job_alias() {
        let msg: TaskMessage = serde_json::from_str(r#"{"job_id":"job_1","step":"GEOCODE"}"#).unwrap();
        assert_eq!(msg.kind, TaskKind::PipelineStep);

        let msg: TaskMessage = serde_json::from_str(r#"{"kind":"job","job_id":"job_1"}"#).unwrap();
        assert_eq!(msg.kind, TaskKind::GenericJob);
        assert_eq!(msg.step, None);
    }

    #[test]
    fn wire_form_uses_snake_case_kinds() {
        let id: JobId = "job_9".parse().unwrap();
        let value = serde_json::to_value(TaskMessage::pipeline_step(&id, StepName::BuildMatrix)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"kind": "pipeline_step", "job_id": "job_9", "step": "BUILD_MATRIX"})
        );
        let value = serde_json::to_value(TaskMessage::generic_job(&id)).unwrap();
        assert_eq!(value, serde_json::json!({"kind": "generic_job", "job_id": "job_9"}));
    }

    #[test]
    fn error_codes_follow_transport() {
        let err = EnqueueError::transport(DispatchMode::Push, "503 from queue");
        assert_eq!(err.code(), "PUSH_QUEUE_ENQUEUE_FAILED");
        let err = EnqueueError::transport(DispatchMode::Pull, "connection refused");
        assert_eq!(err.code(), "PULL_QUEUE_ENQUEUE_FAILED");
    }
}
