//! Executor that delegates to a remote service over HTTP.
//!
//! The step context is POSTed to `{base_url}/{target}`. A JSON reply is the
//! step output; any other content type is stored as an artifact and the
//! [`ArtifactRef`](crate::artifacts::ArtifactRef) becomes the output.
//!
//! | Reply | Outcome |
//! |-------|---------|
//! | 2xx | success |
//! | 4xx | non-retryable failure (`error_code` from the body if present) |
//! | 5xx, timeout, connect error | retryable failure |
//!
//! The lease is extended on a heartbeat while the request is in flight, so a
//! call may run longer than the lease itself.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument};

use fleetroute_core::{JobType, StepName};

use super::{Executor, ExecutorFailure, ExecutorRegistry, PipelineDefinition, StepContext};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Serialize)]
struct ExecutorRequest<'a> {
    job_id: &'a str,
    job_type: JobType,
    step: Option<StepName>,
    attempt: u32,
    payload: &'a Value,
    accumulated: &'a Value,
}

#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    /// Defaults to the context's heartbeat interval.
    heartbeat: Option<Duration>,
}

impl HttpExecutor {
    pub fn new(client: reqwest::Client, base_url: &str, target: &str) -> Self {
        Self {
            client,
            url: format!("{}/{}", base_url.trim_end_matches('/'), target),
            timeout: DEFAULT_TIMEOUT,
            heartbeat: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_heartbeat_every(mut self, every: Duration) -> Self {
        self.heartbeat = Some(every);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    #[instrument(skip(self, ctx), fields(url = %self.url, job_id = %ctx.job_id))]
    async fn execute(&self, ctx: &StepContext) -> Result<Value, ExecutorFailure> {
        let request = ExecutorRequest {
            job_id: ctx.job_id.as_str(),
            job_type: ctx.job_type,
            step: ctx.step,
            attempt: ctx.attempt,
            payload: &ctx.payload,
            accumulated: &ctx.accumulated,
        };

        let every = self.heartbeat.unwrap_or_else(|| ctx.heartbeat_interval());
        let (status, content_type, body) = ctx
            .with_heartbeat(every, async {
                let response = self
                    .client
                    .post(&self.url)
                    .timeout(self.timeout)
                    .json(&request)
                    .send()
                    .await
                    .map_err(|e| ExecutorFailure::retryable("EXECUTOR_UNAVAILABLE", e.to_string()))?;

                let status = response.status();
                let content_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| ExecutorFailure::retryable("EXECUTOR_UNAVAILABLE", e.to_string()))?;
                Ok::<_, ExecutorFailure>((status, content_type, body))
            })
            .await?;

        if status.is_server_error() {
            return Err(ExecutorFailure::retryable(
                "EXECUTOR_UNAVAILABLE",
                format!("{status}: {}", snippet(&body)),
            ));
        }
        if !status.is_success() {
            let parsed: Option<Value> = serde_json::from_slice(&body).ok();
            let code = parsed
                .as_ref()
                .and_then(|v| v.get("error_code"))
                .and_then(Value::as_str)
                .unwrap_or("EXECUTOR_REJECTED")
                .to_string();
            let detail = parsed
                .as_ref()
                .and_then(|v| v.get("detail").or_else(|| v.get("message")))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{status}: {}", snippet(&body)));
            return Err(ExecutorFailure::fatal(code, detail));
        }

        if content_type.starts_with("application/json") {
            return serde_json::from_slice(&body)
                .map_err(|e| ExecutorFailure::fatal("EXECUTOR_BAD_RESPONSE", e.to_string()));
        }

        let name = artifact_name(ctx, &content_type);
        let reference = ctx
            .artifacts()
            .put(&ctx.artifact_key(&name), body.to_vec(), &content_type)
            .await
            .map_err(|e| ExecutorFailure::retryable("ARTIFACT_WRITE_FAILED", e.to_string()))?;
        debug!(key = %reference.key, size = reference.size, "stored executor artifact");
        Ok(serde_json::json!({ "artifact": reference }))
    }
}

fn snippet(body: &[u8]) -> String {
    String::from_utf8_lossy(body).chars().take(200).collect()
}

fn artifact_name(ctx: &StepContext, content_type: &str) -> String {
    let stem = match ctx.step {
        Some(step) => step.as_str().to_ascii_lowercase(),
        None => ctx.job_type.as_str().to_ascii_lowercase(),
    };
    let ext = match content_type.split(';').next().unwrap_or("").trim() {
        "application/pdf" => "pdf",
        "image/png" => "png",
        "text/csv" => "csv",
        "application/zip" => "zip",
        _ => "bin",
    };
    format!("{stem}.{ext}")
}

/// Registry where every job type is served by `{base_url}/...` endpoints:
/// pipeline steps at `steps/{step}`, single-shot jobs at `jobs/{type}`.
pub fn http_registry(client: reqwest::Client, base_url: &str) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    for job_type in JobType::ALL {
        registry = match job_type.default_chain() {
            Some(chain) => {
                let steps = chain
                    .iter()
                    .map(|step| {
                        let target = format!("steps/{}", step.as_str().to_ascii_lowercase());
                        let executor: Arc<dyn Executor> =
                            Arc::new(HttpExecutor::new(client.clone(), base_url, &target));
                        (*step, executor)
                    })
                    .collect();
                match PipelineDefinition::new(steps) {
                    Ok(def) => registry.with_pipeline(job_type, def),
                    Err(_) => registry,
                }
            }
            None => {
                let target = format!("jobs/{}", job_type.as_str().to_ascii_lowercase());
                registry.with_single(job_type, Arc::new(HttpExecutor::new(client.clone(), base_url, &target)))
            }
        };
    }
    registry
}
