//! Postgres-backed `SagaStore`. The saga aggregate is stored as a single
//! JSONB document per row, with the fields the store's own queries need
//! (`status`, `correlation_id`, `created_at`, `started_at`, `timeout_ms`,
//! `retry_count`, `max_retries`) promoted to real columns so the secondary
//! indexes named in the persisted-state layout are usable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{Page, SagaStore};
use crate::error::{SagaError, SagaResult};
use crate::models::{Saga, SagaStatus};

pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> SagaResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|err| SagaError::StoreError {
                operation: "connect".to_string(),
                reason: err.to_string(),
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| SagaError::StoreError {
                operation: "migrate".to_string(),
                reason: err.to_string(),
            })?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn status_str(status: SagaStatus) -> &'static str {
        match status {
            SagaStatus::Created => "CREATED",
            SagaStatus::Running => "RUNNING",
            SagaStatus::Retrying => "RETRYING",
            SagaStatus::Paused => "PAUSED",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Failed => "FAILED",
            SagaStatus::Compensated => "COMPENSATED",
            SagaStatus::Timeout => "TIMEOUT",
        }
    }

    fn row_to_saga(row: &sqlx::postgres::PgRow) -> SagaResult<Saga> {
        let document: serde_json::Value = row.try_get("document").map_err(|err| SagaError::StoreError {
            operation: "decode".to_string(),
            reason: err.to_string(),
        })?;
        serde_json::from_value(document).map_err(SagaError::from)
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn save(&self, mut saga: Saga) -> SagaResult<Saga> {
        saga.touch();
        let document = serde_json::to_value(&saga)?;
        let status = Self::status_str(saga.status);

        if saga.version == 0 {
            saga.version = 1;
            let document = serde_json::to_value(&saga)?;
            let result = sqlx::query(
                r#"
                INSERT INTO sagas (saga_id, status, correlation_id, created_at, started_at, version, document)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (saga_id) DO NOTHING
                "#,
            )
            .bind(saga.saga_id)
            .bind(status)
            .bind(&saga.correlation_id)
            .bind(saga.created_at)
            .bind(saga.started_at)
            .bind(saga.version)
            .bind(&document)
            .execute(&self.pool)
            .await
            .map_err(|err| SagaError::StoreError {
                operation: "insert".to_string(),
                reason: err.to_string(),
            })?;

            if result.rows_affected() == 0 {
                return Err(SagaError::StaleVersion {
                    saga_id: saga.saga_id,
                    expected: 0,
                    found: 0,
                });
            }
            return Ok(saga);
        }

        let expected_version = saga.version;
        saga.version += 1;
        let document = serde_json::to_value(&saga)?;

        let result = sqlx::query(
            r#"
            UPDATE sagas
            SET status = $1, correlation_id = $2, started_at = $3, version = $4, document = $5, updated_at = now()
            WHERE saga_id = $6 AND version = $7
            "#,
        )
        .bind(status)
        .bind(&saga.correlation_id)
        .bind(saga.started_at)
        .bind(saga.version)
        .bind(&document)
        .bind(saga.saga_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(|err| SagaError::StoreError {
            operation: "update".to_string(),
            reason: err.to_string(),
        })?;

        if result.rows_affected() == 0 {
            let current = self.find(saga.saga_id).await?;
            return Err(SagaError::StaleVersion {
                saga_id: saga.saga_id,
                expected: expected_version,
                found: current.map(|s| s.version).unwrap_or(-1),
            });
        }

        Ok(saga)
    }

    async fn find(&self, saga_id: Uuid) -> SagaResult<Option<Saga>> {
        let row = sqlx::query("SELECT document FROM sagas WHERE saga_id = $1")
            .bind(saga_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| SagaError::StoreError {
                operation: "find".to_string(),
                reason: err.to_string(),
            })?;

        row.as_ref().map(Self::row_to_saga).transpose()
    }

    async fn find_by_status(&self, status: SagaStatus, page: Page) -> SagaResult<Vec<Saga>> {
        let rows = sqlx::query(
            "SELECT document FROM sagas WHERE status = $1 ORDER BY created_at DESC OFFSET $2 LIMIT $3",
        )
        .bind(Self::status_str(status))
        .bind(page.offset as i64)
        .bind(page.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| SagaError::StoreError {
            operation: "find_by_status".to_string(),
            reason: err.to_string(),
        })?;

        rows.iter().map(Self::row_to_saga).collect()
    }

    async fn find_by_correlation(&self, correlation_id: &str) -> SagaResult<Vec<Saga>> {
        let rows = sqlx::query("SELECT document FROM sagas WHERE correlation_id = $1")
            .bind(correlation_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| SagaError::StoreError {
                operation: "find_by_correlation".to_string(),
                reason: err.to_string(),
            })?;

        rows.iter().map(Self::row_to_saga).collect()
    }

    async fn find_timed_out(&self, now: DateTime<Utc>) -> SagaResult<Vec<Saga>> {
        let rows = sqlx::query(
            r#"
            SELECT document FROM sagas
            WHERE status IN ('RUNNING', 'RETRYING')
              AND started_at IS NOT NULL
              AND (document->>'timeout_ms')::bigint > 0
              AND started_at + ((document->>'timeout_ms')::bigint || ' milliseconds')::interval < $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| SagaError::StoreError {
            operation: "find_timed_out".to_string(),
            reason: err.to_string(),
        })?;

        rows.iter().map(Self::row_to_saga).collect()
    }

    async fn find_retryable(&self) -> SagaResult<Vec<Saga>> {
        let rows = sqlx::query(
            r#"
            SELECT document FROM sagas
            WHERE status = 'FAILED'
              AND (document->>'retry_count')::int < (document->>'max_retries')::int
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| SagaError::StoreError {
            operation: "find_retryable".to_string(),
            reason: err.to_string(),
        })?;

        rows.iter().map(Self::row_to_saga).collect()
    }

    async fn bulk_update_status(&self, ids: &[Uuid], new_status: SagaStatus) -> SagaResult<u64> {
        // Keep the promoted `status` column and the document's embedded
        // `status` field in lockstep — a later `find()` decodes the document,
        // so patching only the column would make this op invisible to callers.
        let result = sqlx::query(
            r#"
            UPDATE sagas
            SET status = $1,
                updated_at = now(),
                document = jsonb_set(document, '{status}', to_jsonb($1::text))
            WHERE saga_id = ANY($2)
            "#,
        )
        .bind(Self::status_str(new_status))
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(|err| SagaError::StoreError {
            operation: "bulk_update_status".to_string(),
            reason: err.to_string(),
        })?;
        Ok(result.rows_affected())
    }

    async fn bulk_delete_older_than(&self, cutoff: DateTime<Utc>) -> SagaResult<u64> {
        let result = sqlx::query(
            "DELETE FROM sagas WHERE status IN ('COMPLETED', 'FAILED', 'COMPENSATED', 'TIMEOUT') AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|err| SagaError::StoreError {
            operation: "bulk_delete_older_than".to_string(),
            reason: err.to_string(),
        })?;
        Ok(result.rows_affected())
    }
}
