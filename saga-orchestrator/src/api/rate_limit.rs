//! Per-client request throttling, applied after authentication so the
//! burst/minute/hour windows are keyed on the caller's identity rather than
//! a spoofable address.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;

use crate::error::{ErrorResponse, ErrorSeverity};

use super::auth::AuthenticatedUser;
use super::ApiState;

pub async fn enforce(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let client_id = request
        .extensions()
        .get::<AuthenticatedUser>()
        .map(|user| user.0.as_str())
        .unwrap_or("anonymous");

    if state.rate_limiter.allow(client_id) {
        next.run(request).await
    } else {
        state.orchestrator.metrics().rate_limited();
        rate_limited()
    }
}

fn rate_limited() -> Response {
    let body = ErrorResponse {
        timestamp: Utc::now(),
        status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
        error: "rate_limited",
        message: "request rate limit exceeded".to_string(),
        saga_id: None,
        step_id: None,
        error_code: "RATE_LIMITED",
        severity: ErrorSeverity::Medium,
    };
    (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
}
