use axum::{
    extract::State,
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};
use chrono::Utc;

use fleetroute_infra::task_auth::{TaskTokens, bearer_token};

use crate::app::errors;

#[derive(Clone)]
pub struct TaskAuthState {
    pub tokens: Option<TaskTokens>,
    pub required: bool,
}

/// Admit only the trusted transport to task delivery routes.
pub async fn task_auth_middleware(
    State(state): State<TaskAuthState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    if !state.required {
        return next.run(req).await;
    }
    let Some(tokens) = state.tokens.as_ref() else {
        return errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "tasks_auth_misconfigured",
            "task auth is required but no secret is configured",
        );
    };

    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let verified = bearer_token(header).and_then(|token| tokens.verify(token, Utc::now()));
    if let Err(e) = verified {
        tracing::warn!(error = %e, "rejected task delivery");
        return errors::json_error(StatusCode::UNAUTHORIZED, "unauthorized", e.to_string());
    }

    next.run(req).await
}
