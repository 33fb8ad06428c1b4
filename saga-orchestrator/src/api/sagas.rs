//! Handlers for the saga lifecycle endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::SagaResult;
use crate::models::{DataMap, Saga, SagaStatus, Step};
use crate::orchestrator::CreateOptions;
use crate::store::Page;

use super::ApiState;

#[derive(Debug, Deserialize)]
pub struct CreateSagaRequest {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub input_data: DataMap,
    pub correlation_id: Option<String>,
    pub max_retries: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub priority: Option<i32>,
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

fn default_true() -> bool {
    true
}

pub async fn create_saga(
    State(state): State<ApiState>,
    Json(request): Json<CreateSagaRequest>,
) -> SagaResult<(StatusCode, Json<serde_json::Value>)> {
    let options = CreateOptions {
        correlation_id: request.correlation_id,
        max_retries: request.max_retries,
        timeout_ms: request.timeout_ms,
        priority: request.priority,
        auto_start: request.auto_start,
    };

    let saga = state
        .orchestrator
        .create(request.name, request.steps, request.input_data, options)
        .await?;

    Ok((StatusCode::CREATED, Json(json!({ "success": true, "data": saga }))))
}

pub async fn get_saga(
    State(state): State<ApiState>,
    Path(saga_id): Path<Uuid>,
) -> SagaResult<Json<serde_json::Value>> {
    let saga = state.orchestrator.get(saga_id).await?;
    Ok(Json(json!({ "success": true, "data": saga })))
}

#[derive(Debug, Deserialize)]
pub struct ListSagasQuery {
    pub status: SagaStatus,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

pub async fn list_sagas(
    State(state): State<ApiState>,
    Query(query): Query<ListSagasQuery>,
) -> SagaResult<Json<serde_json::Value>> {
    let page = Page {
        offset: query.offset.unwrap_or(0),
        limit: query.limit.unwrap_or_else(|| Page::default().limit),
    };
    let sagas: Vec<Saga> = state.orchestrator.list_by_status(query.status, page).await?;
    Ok(Json(json!({ "success": true, "data": sagas })))
}

pub async fn list_by_correlation(
    State(state): State<ApiState>,
    Path(correlation_id): Path<String>,
) -> SagaResult<Json<serde_json::Value>> {
    let sagas = state.orchestrator.list_by_correlation(&correlation_id).await?;
    Ok(Json(json!({ "success": true, "data": sagas })))
}

pub async fn retry_saga(
    State(state): State<ApiState>,
    Path(saga_id): Path<Uuid>,
) -> SagaResult<Json<serde_json::Value>> {
    let saga = state.orchestrator.retry(saga_id).await?;
    Ok(Json(json!({ "success": true, "data": saga })))
}

pub async fn compensate_saga(
    State(state): State<ApiState>,
    Path(saga_id): Path<Uuid>,
) -> SagaResult<Json<serde_json::Value>> {
    let saga = state.orchestrator.compensate(saga_id).await?;
    Ok(Json(json!({ "success": true, "data": saga })))
}

pub async fn execute_saga(
    State(state): State<ApiState>,
    Path(saga_id): Path<Uuid>,
) -> SagaResult<Json<serde_json::Value>> {
    let saga = state.orchestrator.execute(saga_id).await?;
    Ok(Json(json!({ "success": true, "data": saga })))
}
