//! Push-queue transport.
//!
//! The managed queue accepts a task envelope over HTTP and later POSTs the
//! body to `{APP_BASE_URL}/tasks/handle`, carrying the headers we give it.
//! Retries with backoff are the queue's job; a non-2xx reply from
//! `/tasks/handle` triggers redelivery.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, instrument};

use super::{EnqueueError, QueueDispatcher, TaskMessage};
use crate::clock::Clock;
use crate::config::{DispatchMode, EngineConfig};
use crate::task_auth::TaskTokens;

pub const TASKS_HANDLE_PATH: &str = "/tasks/handle";

const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct PushTaskEnvelope<'a> {
    target_url: &'a str,
    http_method: &'static str,
    headers: BTreeMap<&'static str, String>,
    body: &'a TaskMessage,
}

pub struct PushQueueDispatcher {
    client: reqwest::Client,
    queue_url: String,
    queue_token: Option<String>,
    target_url: String,
    tokens: Option<TaskTokens>,
    clock: Arc<dyn Clock>,
}

impl PushQueueDispatcher {
    pub fn new(
        queue_url: impl Into<String>,
        target_url: impl Into<String>,
        tokens: Option<TaskTokens>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            queue_url: queue_url.into(),
            queue_token: None,
            target_url: target_url.into(),
            tokens,
            clock,
        }
    }

    pub fn with_queue_token(mut self, token: impl Into<String>) -> Self {
        self.queue_token = Some(token.into());
        self
    }

    pub fn from_config(config: &EngineConfig, clock: Arc<dyn Clock>) -> Result<Self, EnqueueError> {
        let queue_url = config.push_queue_url.clone().ok_or_else(|| EnqueueError::NotConfigured {
            mode: DispatchMode::Push,
            detail: "PUSH_QUEUE_URL is not set".to_string(),
        })?;
        let tokens = config
            .tasks_auth_secret
            .as_deref()
            .map(|secret| {
                TaskTokens::new(secret, config.tasks_audience.clone())
                    .with_ttl_seconds(config.task_token_ttl_seconds)
            });
        let target_url = format!("{}{}", config.app_base_url, TASKS_HANDLE_PATH);

        let mut dispatcher = Self::new(queue_url, target_url, tokens, clock);
        if let Some(token) = &config.push_queue_token {
            dispatcher = dispatcher.with_queue_token(token.clone());
        }
        Ok(dispatcher)
    }
}

#[async_trait]
impl QueueDispatcher for PushQueueDispatcher {
    fn mode(&self) -> DispatchMode {
        DispatchMode::Push
    }

    #[instrument(skip(self, message), fields(task = %message), err)]
    async fn enqueue(&self, message: TaskMessage) -> Result<(), EnqueueError> {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type", "application/json".to_string());
        if let Some(tokens) = &self.tokens {
            let token = tokens
                .issue("push-queue", self.clock.now())
                .map_err(|e| EnqueueError::Encode(e.to_string()))?;
            headers.insert("Authorization", format!("Bearer {token}"));
        }
        let envelope = PushTaskEnvelope {
            target_url: &self.target_url,
            http_method: "POST",
            headers,
            body: &message,
        };

        let mut request = self
            .client
            .post(&self.queue_url)
            .timeout(ENQUEUE_TIMEOUT)
            .json(&envelope);
        if let Some(token) = &self.queue_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EnqueueError::transport(DispatchMode::Push, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(EnqueueError::transport(
                DispatchMode::Push,
                format!("queue responded {status}: {snippet}"),
            ));
        }
        debug!(target_url = %self.target_url, "task accepted by push queue");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Utc;
    use fleetroute_core::{JobId, StepName};

    use super::*;
    use crate::clock::ManualClock;

    #[derive(Clone, Default)]
    struct Received {
        bodies: Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>,
    }

    async fn spawn_queue(status: StatusCode) -> (String, Received) {
        let received = Received::default();
        let app = Router::new()
            .route(
                "/enqueue",
                post(
                    move |State(rx): State<Received>, headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        rx.bodies.lock().unwrap().push((auth, body));
                        status
                    },
                ),
            )
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/enqueue"), received)
    }

    #[tokio::test]
    async fn posts_envelope_with_signed_task_header() {
        let (url, received) = spawn_queue(StatusCode::OK).await;
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let tokens = TaskTokens::new("s3cret", "fleetroute-tasks");
        let dispatcher = PushQueueDispatcher::new(
            url,
            "https://routes.example.com/tasks/handle",
            Some(tokens.clone()),
            clock.clone(),
        )
        .with_queue_token("queue-token");

        let id: JobId = "job_push".parse().unwrap();
        dispatcher
            .enqueue(TaskMessage::pipeline_step(&id, StepName::Geocode))
            .await
            .unwrap();

        let bodies = received.bodies.lock().unwrap();
        let (auth, body) = &bodies[0];
        assert_eq!(auth.as_deref(), Some("Bearer queue-token"));
        assert_eq!(body["target_url"], "https://routes.example.com/tasks/handle");
        assert_eq!(body["body"]["step"], "GEOCODE");

        let header = body["headers"]["Authorization"].as_str().unwrap();
        let token = header.strip_prefix("Bearer ").unwrap();
        assert!(tokens.verify(token, clock.now()).is_ok());
    }

    #[tokio::test]
    async fn non_success_reply_is_an_enqueue_failure() {
        let (url, _) = spawn_queue(StatusCode::SERVICE_UNAVAILABLE).await;
        let dispatcher = PushQueueDispatcher::new(
            url,
            "http://localhost/tasks/handle",
            None,
            Arc::new(ManualClock::new(Utc::now())),
        );
        let id: JobId = "job_push".parse().unwrap();
        let err = dispatcher.enqueue(TaskMessage::generic_job(&id)).await.unwrap_err();
        assert_eq!(err.code(), "PUSH_QUEUE_ENQUEUE_FAILED");
    }
}
