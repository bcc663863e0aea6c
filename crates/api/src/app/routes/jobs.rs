use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::{StatusCode, header},
    response::{
        IntoResponse,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
    routing::{get, post},
};
use tokio::sync::mpsc::unbounded_channel;
use tokio_stream::wrappers::UnboundedReceiverStream;

use fleetroute_core::{JobId, JobType};
use fleetroute_infra::Engine;
use fleetroute_infra::jobs::RecordError;

use crate::app::{dto, errors};

const SSE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_job).get(list_jobs))
        .route("/optimize", post(submit_optimize_job))
        .route("/:id", get(get_job))
        .route("/:id/events", get(job_events))
        .route("/:id/cancel", post(cancel_job))
        .route("/:id/retry", post(retry_job))
        .route("/:id/artifacts/:name", get(get_artifact))
}

fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse::<JobId>()
        .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()))
}

/// POST /api/v1/jobs
pub async fn submit_job(
    Extension(engine): Extension<Engine>,
    Json(body): Json<dto::SubmitJobRequest>,
) -> axum::response::Response {
    submit(&engine, body.job_type, body.payload).await
}

/// POST /api/v1/jobs/optimize
pub async fn submit_optimize_job(
    Extension(engine): Extension<Engine>,
    Json(body): Json<dto::OptimizeJobRequest>,
) -> axum::response::Response {
    let payload = match body.into_payload() {
        Ok(payload) => payload,
        Err(resp) => return resp,
    };
    submit(&engine, JobType::OptimizePipeline, payload).await
}

async fn submit(engine: &Engine, job_type: JobType, payload: serde_json::Value) -> axum::response::Response {
    match engine.service.submit_job(job_type, payload).await {
        Ok(job) => (StatusCode::ACCEPTED, Json(dto::JobAccepted::from(&job))).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(engine): Extension<Engine>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    match engine.service.list_jobs(limit).await {
        Ok(jobs) => Json(jobs.iter().map(dto::JobView::from).collect::<Vec<_>>()).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn get_job(Extension(engine): Extension<Engine>, Path(id): Path<String>) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match engine.service.get_job(&job_id).await {
        Ok(job) => Json(dto::JobView::from(&job)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn cancel_job(Extension(engine): Extension<Engine>, Path(id): Path<String>) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match engine.service.cancel_job(&job_id).await {
        Ok(job) => Json(dto::JobView::from(&job)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn retry_job(Extension(engine): Extension<Engine>, Path(id): Path<String>) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match engine.service.retry_job(&job_id).await {
        Ok(job) => (StatusCode::ACCEPTED, Json(dto::JobView::from(&job))).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

/// GET /api/v1/jobs/:id/artifacts/:name
///
/// Serves bytes an executor stored under `{job_id}/{name}`.
pub async fn get_artifact(
    Extension(engine): Extension<Engine>,
    Path((id, name)): Path<(String, String)>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if let Err(e) = engine.records.get(&job_id).await {
        return errors::record_error_to_response(e);
    }
    match engine.artifacts.get(&format!("{job_id}/{name}")).await {
        Ok(artifact) => ([(header::CONTENT_TYPE, artifact.content_type)], artifact.bytes).into_response(),
        Err(e) => errors::artifact_error_to_response(e),
    }
}

/// GET /api/v1/jobs/:id/events
///
/// Server-Sent Events: one `job` event per observed `updated_at` change,
/// closing after the job reaches a terminal status.
pub async fn job_events(Extension(engine): Extension<Engine>, Path(id): Path<String>) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if let Err(e) = engine.records.get(&job_id).await {
        return errors::record_error_to_response(e);
    }

    let (tx, rx) = unbounded_channel::<Result<SseEvent, Infallible>>();
    tokio::spawn(async move {
        let mut last_seen = None;
        loop {
            match engine.records.get(&job_id).await {
                Ok(job) => {
                    if last_seen != Some(job.updated_at) {
                        last_seen = Some(job.updated_at);
                        let event = match SseEvent::default().event("job").json_data(dto::JobView::from(&job)) {
                            Ok(event) => event,
                            Err(e) => {
                                tracing::warn!(job_id = %job_id, error = %e, "failed to encode job event");
                                break;
                            }
                        };
                        if tx.send(Ok(event)).is_err() {
                            break;
                        }
                    }
                    if job.is_terminal() {
                        break;
                    }
                }
                Err(RecordError::NotFound(_)) => break,
                Err(e) => tracing::warn!(job_id = %job_id, error = %e, "job event poll failed"),
            }
            if tx.is_closed() {
                break;
            }
            tokio::time::sleep(SSE_POLL_INTERVAL).await;
        }
    });

    Sse::new(UnboundedReceiverStream::new(rx))
        .keep_alive(KeepAlive::default())
        .into_response()
}
