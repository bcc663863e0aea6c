//! HTTP API application wiring (Axum router + engine wiring).
//!
//! - `routes/`: HTTP routes + handlers (jobs, task delivery, system)
//! - `dto.rs`: request/response DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use fleetroute_infra::Engine;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;

/// Requests served at once; push deliveries beyond this wait for a slot.
const MAX_IN_FLIGHT_REQUESTS: usize = 256;

/// Build the full HTTP router around an already-wired engine.
pub fn build_app(engine: Engine) -> Router {
    let task_auth = middleware::TaskAuthState {
        tokens: engine.task_tokens.clone(),
        required: engine.config.tasks_auth_required,
    };

    // Queue deliveries: only the trusted transport may call these.
    let tasks = routes::tasks::router().layer(axum::middleware::from_fn_with_state(
        task_auth,
        middleware::task_auth_middleware,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .route("/internal/stats", get(routes::system::stats))
        .nest("/api/v1/jobs", routes::jobs::router())
        .nest("/tasks", tasks)
        .layer(Extension(engine))
        .layer(ServiceBuilder::new().concurrency_limit(MAX_IN_FLIGHT_REQUESTS))
}
