//! HTTP surface tests: the basic-auth gate, the rate limiter sitting behind
//! it, and the saga CRUD round trip, driven through a real axum `Router`
//! via `axum-test` rather than calling handlers directly.

use std::sync::Arc;

use axum::http::header::AUTHORIZATION;
use axum_test::TestServer;
use base64::Engine;
use fake::faker::lorem::en::Word;
use fake::Fake;
use metrics_exporter_prometheus::PrometheusBuilder;
use saga_orchestrator::api::{self, ApiState};
use saga_orchestrator::compensation::CompensationDriver;
use saga_orchestrator::engine::ExecutionEngine;
use saga_orchestrator::events::EventBus;
use saga_orchestrator::executors::{StepExecutorRegistry, WaitExecutor};
use saga_orchestrator::metrics::Metrics;
use saga_orchestrator::models::StepType;
use saga_orchestrator::orchestrator::Orchestrator;
use saga_orchestrator::pool::WorkerPools;
use saga_orchestrator::rate_limiter::{RateLimiter, RateLimiterConfig};
use saga_orchestrator::store::memory::InMemorySagaStore;
use saga_orchestrator::store::SagaStore;

const ADMIN_USER: &str = "admin";
const ADMIN_PASSWORD: &str = "letmein";

fn basic_auth_header() -> String {
    let credentials = format!("{ADMIN_USER}:{ADMIN_PASSWORD}");
    format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(credentials))
}

fn test_server(rate_limit: RateLimiterConfig) -> TestServer {
    let store: Arc<dyn SagaStore> = Arc::new(InMemorySagaStore::new());
    let mut registry = StepExecutorRegistry::new();
    registry.register(StepType::Wait, Arc::new(WaitExecutor));
    let registry = Arc::new(registry);
    let event_bus = Arc::new(EventBus::new(64));
    let metrics = Arc::new(Metrics::new());
    let compensation = Arc::new(CompensationDriver::new(registry.clone(), event_bus.clone(), metrics.clone()));
    let pools = Arc::new(WorkerPools::default());
    let engine = Arc::new(ExecutionEngine::new(
        store.clone(),
        registry,
        compensation,
        event_bus.clone(),
        metrics.clone(),
        pools.clone(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(store, engine, pools, event_bus, metrics));

    // `.build()` constructs a standalone handle without installing a
    // process-global recorder, so every test gets its own.
    let (_recorder, handle) = PrometheusBuilder::new().build().expect("prometheus handle");

    let rate_limiter = Arc::new(RateLimiter::new(rate_limit));
    let state = ApiState::new(
        orchestrator,
        ADMIN_USER.to_string(),
        ADMIN_PASSWORD.to_string(),
        handle,
        rate_limiter,
    );
    TestServer::new(api::router(state)).expect("test server")
}

fn default_rate_limit() -> RateLimiterConfig {
    RateLimiterConfig {
        burst_limit: 100,
        burst_window: std::time::Duration::from_secs(60),
        minute_limit: 10_000,
        hour_limit: 100_000,
    }
}

#[tokio::test]
async fn health_is_reachable_without_credentials() {
    let server = test_server(default_rate_limit());
    let response = server.get("/actuator/health").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], serde_json::json!("UP"));
}

#[tokio::test]
async fn admin_route_without_credentials_is_rejected() {
    let server = test_server(default_rate_limit());
    let response = server.get("/api/v1/sagas?status=CREATED").await;
    response.assert_status(axum::http::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_and_fetch_a_saga_round_trips_through_the_api() {
    let server = test_server(default_rate_limit());
    let saga_name: String = Word().fake();

    let create_response = server
        .post("/api/v1/sagas")
        .add_header(AUTHORIZATION, basic_auth_header())
        .json(&serde_json::json!({
            "name": saga_name,
            "steps": [{
                "step_id": uuid::Uuid::new_v4(),
                "name": "noop",
                "order": 0,
                "type": "WAIT",
                "status": "CREATED",
                "config": {},
                "compensation_config": null,
                "input_data": {},
                "output_data": {},
                "error_message": null,
                "error_trace": null,
                "retry_count": 0,
                "max_retries": 3,
                "timeout_ms": 30000,
                "retry_delay_ms": 1000,
                "required": true,
                "compensatable": true,
                "started_at": null,
                "completed_at": null,
                "duration_ms": null,
            }],
            "input_data": {},
            "auto_start": false,
        }))
        .await;

    create_response.assert_status(axum::http::StatusCode::CREATED);
    let body: serde_json::Value = create_response.json();
    assert!(body["data"]["saga_id"].as_str().is_some(), "response should carry the new saga's id: {body}");
    assert_eq!(body["data"]["name"], serde_json::json!(saga_name));
}

#[tokio::test]
async fn rate_limited_admin_requests_receive_429() {
    let tight = RateLimiterConfig {
        burst_limit: 1,
        burst_window: std::time::Duration::from_secs(60),
        minute_limit: 1_000,
        hour_limit: 10_000,
    };
    let server = test_server(tight);

    let first = server
        .get("/api/v1/sagas?status=CREATED")
        .add_header(AUTHORIZATION, basic_auth_header())
        .await;
    first.assert_status_ok();

    let second = server
        .get("/api/v1/sagas?status=CREATED")
        .add_header(AUTHORIZATION, basic_auth_header())
        .await;
    second.assert_status(axum::http::StatusCode::TOO_MANY_REQUESTS);
}
