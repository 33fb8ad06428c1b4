//! HTTP Basic-auth gate for admin endpoints.

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine;
use chrono::Utc;

use crate::error::{ErrorResponse, ErrorSeverity};

use super::ApiState;

/// Identity of the authenticated caller, injected into request extensions
/// on success so downstream middleware (rate limiting) and handlers can key
/// on it without re-parsing the `Authorization` header.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub String);

pub async fn basic_auth(State(state): State<ApiState>, mut request: Request, next: Next) -> Response {
    let credentials = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|header| header.strip_prefix("Basic "))
        .and_then(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok());

    let parsed = credentials.as_deref().and_then(|value| value.split_once(':'));

    let authorized = parsed.is_some_and(|(username, password)| {
        username == &*state.admin_username && password == &*state.admin_password
    });

    if authorized {
        let username = parsed.expect("checked by `authorized`").0.to_string();
        request.extensions_mut().insert(AuthenticatedUser(username));
        next.run(request).await
    } else {
        unauthorized()
    }
}

fn unauthorized() -> Response {
    let body = ErrorResponse {
        timestamp: Utc::now(),
        status: StatusCode::UNAUTHORIZED.as_u16(),
        error: "authentication_error",
        message: "valid basic-auth credentials are required".to_string(),
        saga_id: None,
        step_id: None,
        error_code: "UNAUTHORIZED",
        severity: ErrorSeverity::Medium,
    };
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}
