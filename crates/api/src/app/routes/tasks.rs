//! Queue delivery endpoint.
//!
//! The status code is the acknowledgement contract with the push queue:
//! 200 acknowledges, 503 asks for redelivery of a retryable failure and 500
//! reports an infrastructure fault (also redelivered).

use axum::{
    Json, Router,
    body::Bytes,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};

use fleetroute_infra::dispatch::TaskMessage;
use fleetroute_infra::{Engine, SkipReason, TaskOutcome};

use crate::app::errors;

pub fn router() -> Router {
    Router::new().route("/handle", post(handle_task))
}

/// POST /tasks/handle
pub async fn handle_task(Extension(engine): Extension<Engine>, body: Bytes) -> axum::response::Response {
    // Undecodable bodies are acknowledged; redelivering them cannot help.
    let message: TaskMessage = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            engine.stats.message_dropped();
            tracing::warn!(error = %e, "dropping undecodable task body");
            return (StatusCode::OK, Json(TaskOutcome::skipped(SkipReason::Malformed))).into_response();
        }
    };

    match engine.handler.handle(&message).await {
        Ok(outcome) => {
            let status = if outcome.is_ack() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            (status, Json(outcome)).into_response()
        }
        Err(e) => {
            tracing::error!(task = %message, error = %e, "task handling failed");
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "task_failed", e.to_string())
        }
    }
}
