use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use fleetroute_core::DomainError;
use fleetroute_infra::ServiceError;
use fleetroute_infra::artifacts::ArtifactError;
use fleetroute_infra::jobs::RecordError;

pub fn service_error_to_response(err: ServiceError) -> axum::response::Response {
    match err {
        ServiceError::Unsupported(job_type) => json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "unsupported_job_type",
            format!("no executor registered for {job_type}"),
        ),
        ServiceError::Record(e) => record_error_to_response(e),
        ServiceError::Enqueue { job_id, source } => (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({
                "error": source.code(),
                "message": source.to_string(),
                "job_id": job_id.to_string(),
            })),
        )
            .into_response(),
    }
}

pub fn record_error_to_response(err: RecordError) -> axum::response::Response {
    match err {
        RecordError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        RecordError::Domain(DomainError::Closed(status)) => {
            json_error(StatusCode::CONFLICT, "job_closed", format!("job is already {status}"))
        }
        RecordError::Domain(DomainError::Validation(msg)) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        RecordError::Domain(DomainError::InvalidId(msg)) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        RecordError::Domain(e) => json_error(StatusCode::CONFLICT, "conflict", e.to_string()),
        e @ RecordError::Contention { .. } => json_error(StatusCode::CONFLICT, "conflict", e.to_string()),
        RecordError::Store(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", format!("{e:?}")),
    }
}

pub fn artifact_error_to_response(err: ArtifactError) -> axum::response::Response {
    match err {
        ArtifactError::NotFound(key) => json_error(StatusCode::NOT_FOUND, "not_found", format!("artifact {key} not found")),
        ArtifactError::InvalidKey(key) => json_error(StatusCode::BAD_REQUEST, "invalid_artifact", key),
        ArtifactError::Io(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "artifact_error", msg),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
