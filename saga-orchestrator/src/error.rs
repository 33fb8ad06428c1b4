//! Error taxonomy for saga execution, matching the kinds the engine and
//! store can surface and the severity a dashboard should attach to them.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorSeverity::Low => "LOW",
            ErrorSeverity::Medium => "MEDIUM",
            ErrorSeverity::High => "HIGH",
            ErrorSeverity::Critical => "CRITICAL",
        };
        write!(f, "{s}")
    }
}

/// The engine's full error taxonomy. Internal, recoverable kinds
/// (`StepTransient`, `StaleVersion`, ...) never escape the engine as errors
/// returned to a caller — they are recorded as state transitions.
/// `StaleVersion` specifically is caught at every persisted save point by
/// [`crate::store::save_transition`], which reloads the saga and re-applies
/// the in-flight transition rather than surfacing the conflict. Only
/// `Validation` and the administrative-operation rejections reach the API.
#[derive(Error, Debug, Clone)]
pub enum SagaError {
    #[error("step '{step_name}' failed (transient, attempt will be retried): {reason}")]
    StepTransient {
        step_name: String,
        reason: String,
    },

    #[error("step '{step_name}' failed terminally: {reason}")]
    StepTerminal {
        step_name: String,
        reason: String,
    },

    #[error("step '{step_name}' failed but is not required, saga continues")]
    StepSkipped { step_name: String },

    #[error("step '{step_name}' exceeded its deadline of {timeout_ms}ms")]
    StepTimeout {
        step_name: String,
        timeout_ms: u64,
    },

    #[error("circuit open for service '{service}'")]
    CircuitOpen { service: String },

    #[error("rate limit exceeded for client '{client_id}'")]
    RateLimited { client_id: String },

    #[error("no executor registered for step type '{step_type}'")]
    UnsupportedStepType { step_type: String },

    #[error("saga {saga_id} timed out after {timeout_ms}ms")]
    SagaTimeout { saga_id: Uuid, timeout_ms: u64 },

    #[error("compensation failed: {step_name}")]
    CompensationFailed { saga_id: Uuid, step_name: String },

    #[error("saga {saga_id} write observed a stale version (expected {expected}, found {found})")]
    StaleVersion {
        saga_id: Uuid,
        expected: i64,
        found: i64,
    },

    #[error("store error during {operation}: {reason}")]
    StoreError { operation: String, reason: String },

    #[error("validation failed: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("saga {saga_id} not found")]
    NotFound { saga_id: Uuid },

    #[error("invalid operation: saga {saga_id} is in status {status}, expected one of {expected}")]
    InvalidStatus {
        saga_id: Uuid,
        status: String,
        expected: String,
    },
}

impl SagaError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            SagaError::StepSkipped { .. } => ErrorSeverity::Low,
            SagaError::Validation { .. } => ErrorSeverity::Low,
            SagaError::StepTransient { .. }
            | SagaError::StepTimeout { .. }
            | SagaError::CircuitOpen { .. }
            | SagaError::RateLimited { .. }
            | SagaError::StaleVersion { .. }
            | SagaError::NotFound { .. }
            | SagaError::InvalidStatus { .. } => ErrorSeverity::Medium,
            SagaError::StepTerminal { .. } | SagaError::SagaTimeout { .. } => ErrorSeverity::High,
            SagaError::UnsupportedStepType { .. } => ErrorSeverity::High,
            SagaError::CompensationFailed { .. } | SagaError::StoreError { .. } => {
                ErrorSeverity::Critical
            }
        }
    }

    /// Whether the engine should retry this step attempt in place rather
    /// than cascading into compensation.
    pub fn is_step_retryable(&self) -> bool {
        matches!(
            self,
            SagaError::StepTransient { .. }
                | SagaError::StepTimeout { .. }
                | SagaError::CircuitOpen { .. }
        )
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            SagaError::StepTransient { .. } => "STEP_TRANSIENT",
            SagaError::StepTerminal { .. } => "STEP_TERMINAL",
            SagaError::StepSkipped { .. } => "STEP_SKIPPED",
            SagaError::StepTimeout { .. } => "STEP_TIMEOUT",
            SagaError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            SagaError::RateLimited { .. } => "RATE_LIMITED",
            SagaError::UnsupportedStepType { .. } => "UNSUPPORTED_STEP_TYPE",
            SagaError::SagaTimeout { .. } => "SAGA_TIMEOUT",
            SagaError::CompensationFailed { .. } => "COMPENSATION_FAILED",
            SagaError::StaleVersion { .. } => "STALE_VERSION",
            SagaError::StoreError { .. } => "STORE_ERROR",
            SagaError::Validation { .. } => "VALIDATION",
            SagaError::NotFound { .. } => "NOT_FOUND",
            SagaError::InvalidStatus { .. } => "INVALID_STATUS",
        }
    }

    pub fn saga_id(&self) -> Option<Uuid> {
        match self {
            SagaError::SagaTimeout { saga_id, .. }
            | SagaError::CompensationFailed { saga_id, .. }
            | SagaError::StaleVersion { saga_id, .. }
            | SagaError::NotFound { saga_id }
            | SagaError::InvalidStatus { saga_id, .. } => Some(*saga_id),
            _ => None,
        }
    }
}

#[cfg(feature = "postgres-store")]
impl From<sqlx::Error> for SagaError {
    fn from(err: sqlx::Error) -> Self {
        SagaError::StoreError {
            operation: "sqlx".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SagaError {
    fn from(err: serde_json::Error) -> Self {
        SagaError::Validation {
            field: "payload".to_string(),
            message: err.to_string(),
        }
    }
}

pub type SagaResult<T> = Result<T, SagaError>;

/// Uniform error body returned by every admin-facing endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub timestamp: DateTime<Utc>,
    pub status: u16,
    pub error: &'static str,
    pub message: String,
    #[serde(rename = "sagaId", skip_serializing_if = "Option::is_none")]
    pub saga_id: Option<Uuid>,
    #[serde(rename = "stepId", skip_serializing_if = "Option::is_none")]
    pub step_id: Option<Uuid>,
    #[serde(rename = "errorCode")]
    pub error_code: &'static str,
    pub severity: ErrorSeverity,
}

impl SagaError {
    fn status_code(&self) -> StatusCode {
        match self {
            SagaError::Validation { .. } => StatusCode::BAD_REQUEST,
            SagaError::NotFound { .. } => StatusCode::NOT_FOUND,
            SagaError::InvalidStatus { .. } => StatusCode::BAD_REQUEST,
            SagaError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            SagaError::CompensationFailed { .. } | SagaError::StoreError { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Only administrative and validation errors are expected to reach this
/// impl — internal recoverable kinds are handled inside the engine and never
/// escape as a `Result::Err` to an HTTP handler.
impl IntoResponse for SagaError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            timestamp: Utc::now(),
            status: status.as_u16(),
            error: self.error_code(),
            message: self.to_string(),
            saga_id: self.saga_id(),
            step_id: None,
            error_code: self.error_code(),
            severity: self.severity(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_open_is_treated_as_step_retryable() {
        let err = SagaError::CircuitOpen {
            service: "payments.svc".into(),
        };
        assert!(err.is_step_retryable());
        assert_eq!(err.error_code(), "CIRCUIT_OPEN");
    }

    #[test]
    fn compensation_failed_is_critical() {
        let err = SagaError::CompensationFailed {
            saga_id: Uuid::new_v4(),
            step_name: "charge-card".into(),
        };
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert!(!err.is_step_retryable());
    }

    #[test]
    fn unsupported_step_type_is_not_retryable() {
        let err = SagaError::UnsupportedStepType {
            step_type: "PARALLEL".into(),
        };
        assert!(!err.is_step_retryable());
        assert_eq!(err.severity(), ErrorSeverity::High);
    }
}
