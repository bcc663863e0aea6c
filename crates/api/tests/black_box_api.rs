use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use fleetroute_core::{JobType, StepName};
use fleetroute_infra::config::DispatchMode;
use fleetroute_infra::dispatch::{EnqueueError, QueueDispatcher, TaskMessage};
use fleetroute_infra::executors::{Executor, ExecutorFailure, ExecutorRegistry, PipelineDefinition, StepContext};
use fleetroute_infra::task_auth::{TASK_TOKEN_ISSUER, TaskClaims, TaskTokens};
use fleetroute_infra::{Engine, EngineConfig};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde_json::{Value, json};

const TASKS_SECRET: &str = "test-secret";

/// Echoes its step; the export step also writes a CSV artifact.
struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, ctx: &StepContext) -> Result<Value, ExecutorFailure> {
        let step = ctx.step.map(|s| s.as_str()).unwrap_or("JOB");
        if ctx.step == Some(StepName::GenerateExports) {
            let artifact = ctx
                .artifacts()
                .put(&ctx.artifact_key("routes.csv"), b"vehicle,stop\n1,42\n".to_vec(), "text/csv")
                .await
                .map_err(|e| ExecutorFailure::retryable("ARTIFACT_WRITE_FAILED", e.to_string()))?;
            return Ok(json!({ "routes_csv": artifact }));
        }
        Ok(json!({ step.to_ascii_lowercase(): "ok" }))
    }
}

/// Fails retryably the first `failures` times it runs.
struct FlakyExecutor {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl Executor for FlakyExecutor {
    async fn execute(&self, _ctx: &StepContext) -> Result<Value, ExecutorFailure> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(ExecutorFailure::retryable("GEOCODER_TIMEOUT", "upstream timed out"));
        }
        Ok(json!({ "geocode": "ok" }))
    }
}

struct OutageDispatcher;

#[async_trait]
impl QueueDispatcher for OutageDispatcher {
    fn mode(&self) -> DispatchMode {
        DispatchMode::Push
    }

    async fn enqueue(&self, _message: TaskMessage) -> Result<(), EnqueueError> {
        Err(EnqueueError::transport(DispatchMode::Push, "push queue unreachable"))
    }
}

fn registry(geocode: Arc<dyn Executor>) -> ExecutorRegistry {
    let steps = StepName::OPTIMIZE_CHAIN
        .iter()
        .map(|step| match step {
            StepName::Geocode => (*step, geocode.clone()),
            _ => (*step, Arc::new(EchoExecutor) as Arc<dyn Executor>),
        })
        .collect();
    ExecutorRegistry::new()
        .with_pipeline(JobType::OptimizePipeline, PipelineDefinition::new(steps).unwrap())
        .with_single(JobType::ExportPdf, Arc::new(EchoExecutor))
}

fn test_config() -> EngineConfig {
    EngineConfig {
        tasks_auth_required: true,
        tasks_auth_secret: Some(TASKS_SECRET.to_string()),
        ..EngineConfig::default()
    }
}

struct TestServer {
    base_url: String,
    engine: Engine,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(registry(Arc::new(EchoExecutor)), None).await
    }

    async fn spawn_with(registry: ExecutorRegistry, dispatcher: Option<Arc<dyn QueueDispatcher>>) -> Self {
        let mut builder = Engine::builder(test_config()).with_registry(registry);
        if let Some(dispatcher) = dispatcher {
            builder = builder.with_dispatcher(dispatcher);
        }
        let engine = builder.build().await.expect("failed to build engine");

        // Build app (same router as prod), but bind to an ephemeral port.
        let app = fleetroute_api::app::build_app(engine.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            engine,
            handle,
        }
    }

    fn task_token(&self) -> String {
        TaskTokens::new(TASKS_SECRET, self.engine.config.tasks_audience.clone())
            .issue("test-queue", Utc::now())
            .unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn optimize_body() -> Value {
    json!({
        "dataset_id": 12,
        "depot_lat": 1.3521,
        "depot_lon": 103.8198,
        "fleet_config": { "num_vehicles": 3, "capacity": 40 },
        "workday_start": "08:00",
        "workday_end": "17:30",
    })
}

#[tokio::test]
async fn health_reports_dispatch_mode() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["dispatch_mode"], "inline");
}

#[tokio::test]
async fn concurrent_requests_pass_through_the_limit_layer() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let requests = (0..32).map(|_| {
        let client = client.clone();
        let url = format!("{}/health", srv.base_url);
        tokio::spawn(async move { client.get(url).send().await.unwrap().status() })
    });
    for request in requests.collect::<Vec<_>>() {
        assert_eq!(request.await.unwrap(), StatusCode::OK);
    }
}

#[tokio::test]
async fn optimize_job_runs_to_completion_inline() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/api/v1/jobs/optimize", srv.base_url))
        .json(&optimize_body())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let accepted: Value = res.json().await.unwrap();
    assert_eq!(accepted["type"], "OPTIMIZE_PIPELINE");
    assert_eq!(accepted["status"], "SUCCEEDED");
    let id = accepted["job_id"].as_str().unwrap().to_string();

    let job: Value = client
        .get(format!("{}/api/v1/jobs/{}", srv.base_url, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job["progress_pct"], 100);
    let steps = job["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 4);
    assert!(steps.iter().all(|s| s["status"] == "SUCCEEDED"));
    assert_eq!(job["result_ref"]["geocode"], "ok");
    assert!(job.get("lease_owner").is_none());

    // The export step's artifact is served back.
    let res = client
        .get(format!("{}/api/v1/jobs/{}/artifacts/routes.csv", srv.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["content-type"], "text/csv");
    assert_eq!(res.text().await.unwrap(), "vehicle,stop\n1,42\n");

    let res = client
        .get(format!("{}/api/v1/jobs/{}/artifacts/missing.pdf", srv.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn optimize_request_is_validated() {
    let srv = TestServer::spawn().await;
    let mut body = optimize_body();
    body["workday_start"] = json!("18:00");
    body["workday_end"] = json!("08:00");

    let res = reqwest::Client::new()
        .post(format!("{}/api/v1/jobs/optimize", srv.base_url))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let err: Value = res.json().await.unwrap();
    assert_eq!(err["error"], "validation_error");
}

#[tokio::test]
async fn generic_submit_and_unsupported_types() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/api/v1/jobs", srv.base_url))
        .json(&json!({ "type": "EXPORT_PDF", "payload": { "plan_id": 5 } }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let accepted: Value = res.json().await.unwrap();
    assert_eq!(accepted["status"], "SUCCEEDED");

    let res = client
        .post(format!("{}/api/v1/jobs", srv.base_url))
        .json(&json!({ "type": "ML_TRAIN" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let err: Value = res.json().await.unwrap();
    assert_eq!(err["error"], "unsupported_job_type");
}

#[tokio::test]
async fn unknown_and_invalid_job_ids() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/api/v1/jobs/job_doesnotexist", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .get(format!("{}/api/v1/jobs/not%20an%20id", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn enqueue_outage_is_reported_to_submitter() {
    let srv = TestServer::spawn_with(registry(Arc::new(EchoExecutor)), Some(Arc::new(OutageDispatcher))).await;

    let res = reqwest::Client::new()
        .post(format!("{}/api/v1/jobs/optimize", srv.base_url))
        .json(&optimize_body())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    let err: Value = res.json().await.unwrap();
    assert_eq!(err["error"], "PUSH_QUEUE_ENQUEUE_FAILED");

    let id = err["job_id"].as_str().unwrap().parse().unwrap();
    let job = srv.engine.records.get(&id).await.unwrap();
    assert_eq!(job.status.as_str(), "QUEUED");
    assert_eq!(srv.engine.stats.snapshot().enqueue_failures, 1);
}

#[tokio::test]
async fn task_endpoint_requires_trusted_transport() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let job = srv
        .engine
        .records
        .create(JobType::OptimizePipeline, json!({}), &StepName::OPTIMIZE_CHAIN)
        .await
        .unwrap();
    let message = TaskMessage::pipeline_step(&job.id, StepName::Geocode);

    let res = client
        .post(format!("{}/tasks/handle", srv.base_url))
        .json(&message)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    // Signed with the right secret but for another audience.
    let now = Utc::now();
    let claims = TaskClaims {
        iss: TASK_TOKEN_ISSUER.to_string(),
        aud: "someone-else".to_string(),
        sub: "test-queue".to_string(),
        iat: now.timestamp(),
        exp: (now + ChronoDuration::minutes(10)).timestamp(),
    };
    let foreign = jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(TASKS_SECRET.as_bytes()),
    )
    .expect("failed to encode jwt");
    let res = client
        .post(format!("{}/tasks/handle", srv.base_url))
        .bearer_auth(foreign)
        .json(&message)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .post(format!("{}/tasks/handle", srv.base_url))
        .bearer_auth(srv.task_token())
        .json(&message)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let outcome: Value = res.json().await.unwrap();
    assert_eq!(outcome["status"], "completed");

    // Inline dispatch carried the rest of the chain.
    let job = srv.engine.records.get(&job.id).await.unwrap();
    assert_eq!(job.status.as_str(), "SUCCEEDED");
}

#[tokio::test]
async fn task_outcomes_map_to_ack_status_codes() {
    let flaky = Arc::new(FlakyExecutor {
        failures: 1,
        calls: AtomicU32::new(0),
    });
    let srv = TestServer::spawn_with(registry(flaky), None).await;
    let client = reqwest::Client::new();
    let token = srv.task_token();
    let job = srv
        .engine
        .records
        .create(JobType::OptimizePipeline, json!({}), &StepName::OPTIMIZE_CHAIN)
        .await
        .unwrap();
    let message = TaskMessage::pipeline_step(&job.id, StepName::Geocode);

    let res = client
        .post(format!("{}/tasks/handle", srv.base_url))
        .bearer_auth(&token)
        .json(&message)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    let outcome: Value = res.json().await.unwrap();
    assert_eq!(outcome["status"], "retry");

    // Redelivery succeeds.
    let res = client
        .post(format!("{}/tasks/handle", srv.base_url))
        .bearer_auth(&token)
        .json(&message)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Terminal job: acknowledged no-op.
    let res = client
        .post(format!("{}/tasks/handle", srv.base_url))
        .bearer_auth(&token)
        .json(&message)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let outcome: Value = res.json().await.unwrap();
    assert_eq!(outcome["status"], "skipped");
    assert_eq!(outcome["reason"], "job_closed");

    // Garbage body: acknowledged and dropped.
    let res = client
        .post(format!("{}/tasks/handle", srv.base_url))
        .bearer_auth(&token)
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let outcome: Value = res.json().await.unwrap();
    assert_eq!(outcome["reason"], "malformed");

    let stats: Value = client
        .get(format!("{}/internal/stats", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["counters"]["steps_failed"], 1);
    assert_eq!(stats["counters"]["jobs_succeeded"], 1);
    assert_eq!(stats["counters"]["messages_dropped"], 1);
}

#[tokio::test]
async fn cancel_and_retry_lifecycle() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let job = srv
        .engine
        .records
        .create(JobType::OptimizePipeline, json!({}), &StepName::OPTIMIZE_CHAIN)
        .await
        .unwrap();

    // Retry on a fresh job runs it (inline dispatch).
    let res = client
        .post(format!("{}/api/v1/jobs/{}/retry", srv.base_url, job.id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let view: Value = res.json().await.unwrap();
    assert_eq!(view["status"], "SUCCEEDED");

    let other = srv
        .engine
        .records
        .create(JobType::OptimizePipeline, json!({}), &StepName::OPTIMIZE_CHAIN)
        .await
        .unwrap();
    for _ in 0..2 {
        let res = client
            .post(format!("{}/api/v1/jobs/{}/cancel", srv.base_url, other.id))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let view: Value = res.json().await.unwrap();
        assert_eq!(view["status"], "CANCELLED");
    }

    let res = client
        .post(format!("{}/api/v1/jobs/{}/retry", srv.base_url, other.id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    // A finished job cannot be cancelled.
    let res = client
        .post(format!("{}/api/v1/jobs/{}/cancel", srv.base_url, job.id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn job_events_stream_ends_on_terminal_status() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let accepted: Value = client
        .post(format!("{}/api/v1/jobs/optimize", srv.base_url))
        .json(&optimize_body())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = accepted["job_id"].as_str().unwrap();

    let res = client
        .get(format!("{}/api/v1/jobs/{}/events", srv.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(
        res.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let body = tokio::time::timeout(std::time::Duration::from_secs(10), res.text())
        .await
        .expect("event stream did not close")
        .unwrap();
    assert!(body.contains("event: job"));
    let data = body
        .lines()
        .find_map(|line| line.strip_prefix("data: "))
        .unwrap();
    let view: Value = serde_json::from_str(data).unwrap();
    assert_eq!(view["status"], "SUCCEEDED");
    assert_eq!(view["job_id"], id);
}
