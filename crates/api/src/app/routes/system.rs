use axum::{Json, extract::Extension, response::IntoResponse};
use serde_json::json;

use fleetroute_infra::Engine;

pub async fn health(Extension(engine): Extension<Engine>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "dispatch_mode": engine.dispatcher.mode().as_str(),
    }))
}

/// GET /internal/stats
pub async fn stats(Extension(engine): Extension<Engine>) -> impl IntoResponse {
    Json(json!({
        "dispatch_mode": engine.dispatcher.mode().as_str(),
        "counters": engine.stats.snapshot(),
    }))
}
