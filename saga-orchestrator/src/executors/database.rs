//! The `DATABASE_OP` step: executes a parameterized statement against a
//! shared connection pool. Success is driver success — the adapter does not
//! interpret rows returned, only whether the statement completed.

use async_trait::async_trait;
use std::time::Instant;

use super::StepExecutor;
use crate::models::{DataMap, Step, StepResult};

#[cfg(feature = "postgres-store")]
fn bind_param<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    value: &'q serde_json::Value,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match value {
        serde_json::Value::Null => query.bind(Option::<String>::None),
        serde_json::Value::Bool(b) => query.bind(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    }
}

/// Executes parameterized statements against a Postgres pool when the
/// `postgres-store` feature is enabled. Without a pool configured, the
/// executor fails every statement rather than silently succeeding, since a
/// database step with no backing connection is a configuration error.
pub struct DatabaseExecutor {
    #[cfg(feature = "postgres-store")]
    pool: Option<sqlx::PgPool>,
}

impl DatabaseExecutor {
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "postgres-store")]
            pool: None,
        }
    }

    #[cfg(feature = "postgres-store")]
    pub fn with_pool(pool: sqlx::PgPool) -> Self {
        Self { pool: Some(pool) }
    }
}

impl Default for DatabaseExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for DatabaseExecutor {
    async fn execute(&self, step: &Step, _saga_input: &DataMap) -> StepResult {
        let start = Instant::now();

        let Some(query) = step.config.get_str("query") else {
            return StepResult::failure(
                "missing 'query' in step config",
                start.elapsed().as_millis() as u64,
            );
        };

        #[cfg(feature = "postgres-store")]
        {
            let Some(pool) = self.pool.as_ref() else {
                return StepResult::failure(
                    "no database pool configured for DATABASE_OP executor",
                    start.elapsed().as_millis() as u64,
                );
            };

            let params = step
                .config
                .fields
                .get("query_parameters")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();

            let mut sqlx_query = sqlx::query(query);
            for param in &params {
                sqlx_query = bind_param(sqlx_query, param);
            }

            let exec = async { sqlx_query.execute(pool).await };
            let outcome = if step.timeout_ms > 0 {
                tokio::time::timeout(std::time::Duration::from_millis(step.timeout_ms), exec).await
            } else {
                Ok(exec.await)
            };

            let duration_ms = start.elapsed().as_millis() as u64;
            return match outcome {
                Ok(Ok(result)) => {
                    let mut output = DataMap::new();
                    output.insert(
                        "rows_affected".into(),
                        serde_json::json!(result.rows_affected()),
                    );
                    StepResult::success(output, duration_ms)
                }
                Ok(Err(err)) => StepResult::failure(err.to_string(), duration_ms),
                Err(_) => StepResult::failure(
                    format!("database statement exceeded {}ms", step.timeout_ms),
                    duration_ms,
                ),
            };
        }

        #[cfg(not(feature = "postgres-store"))]
        {
            let _ = query;
            StepResult::failure(
                "DATABASE_OP executor requires the 'postgres-store' feature",
                start.elapsed().as_millis() as u64,
            )
        }
    }
}
