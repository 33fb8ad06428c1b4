//! Liveness, Prometheus scrape, and metrics-snapshot endpoints. Exempt from
//! basic-auth — operators and scrapers need these reachable unauthenticated.

use axum::extract::State;
use axum::Json;
use serde_json::json;

use super::ApiState;

pub async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let pools = state.orchestrator.pools().stats();
    Json(json!({
        "status": "UP",
        "service": "saga-orchestrator",
        "pools": pools,
    }))
}

pub async fn prometheus_metrics(State(state): State<ApiState>) -> String {
    state.prometheus_handle.render()
}

pub async fn overview(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let snapshot = state.orchestrator.metrics().snapshot();
    let pools = state.orchestrator.pools().stats();
    Json(json!({
        "success": true,
        "data": {
            "metrics": snapshot,
            "pools": pools,
        }
    }))
}
