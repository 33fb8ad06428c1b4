//! Axum HTTP surface over the [`Orchestrator`] facade: routes, request/
//! response shapes, and the basic-auth gate on admin operations. Health and
//! dashboard probes are intentionally exempt, per the external interface's
//! exception list.

pub mod auth;
pub mod dashboard;
pub mod rate_limit;
pub mod sagas;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::orchestrator::Orchestrator;
use crate::rate_limiter::RateLimiter;

/// Shared axum state: the facade plus the basic-auth credentials admin
/// routes are gated behind.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub admin_username: Arc<str>,
    pub admin_password: Arc<str>,
    pub prometheus_handle: PrometheusHandle,
    pub rate_limiter: Arc<RateLimiter>,
}

impl ApiState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        admin_username: String,
        admin_password: String,
        prometheus_handle: PrometheusHandle,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            orchestrator,
            admin_username: admin_username.into(),
            admin_password: admin_password.into(),
            prometheus_handle,
            rate_limiter,
        }
    }
}

pub fn router(state: ApiState) -> Router {
    let public_routes = Router::new()
        .route("/actuator/health", get(dashboard::health))
        .route("/metrics", get(dashboard::prometheus_metrics))
        .route("/api/v1/dashboard/overview", get(dashboard::overview));

    let admin_routes = Router::new()
        .route("/api/v1/sagas", post(sagas::create_saga).get(sagas::list_sagas))
        .route("/api/v1/sagas/:saga_id", get(sagas::get_saga))
        .route("/api/v1/sagas/:saga_id/retry", post(sagas::retry_saga))
        .route("/api/v1/sagas/:saga_id/compensate", post(sagas::compensate_saga))
        .route("/api/v1/sagas/:saga_id/execute", post(sagas::execute_saga))
        .route(
            "/api/v1/sagas/correlation/:correlation_id",
            get(sagas::list_by_correlation),
        )
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit::enforce))
        .layer(middleware::from_fn_with_state(state.clone(), auth::basic_auth));

    Router::new()
        .merge(public_routes)
        .merge(admin_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
