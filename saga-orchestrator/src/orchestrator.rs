//! Public facade: the single entry point host programs and the HTTP API use
//! to create and drive sagas. Bridges the store and the execution engine and
//! owns the worker pools that bound concurrent work.

use std::sync::Arc;
use uuid::Uuid;

use crate::engine::ExecutionEngine;
use crate::error::{SagaError, SagaResult};
use crate::events::EventBus;
use crate::metrics::Metrics;
use crate::models::{DataMap, Saga, SagaStatus, Step};
use crate::pool::WorkerPools;
use crate::store::{Page, SagaStore};

/// Options accepted by [`Orchestrator::create`], layered over the built-in
/// `Saga` defaults.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub correlation_id: Option<String>,
    pub max_retries: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub priority: Option<i32>,
    /// Start execution in the background immediately after persisting.
    /// Defaults to `true` — a saga sitting in `CREATED` with nobody driving
    /// it is rarely what a caller wants.
    pub auto_start: bool,
}

impl CreateOptions {
    pub fn new() -> Self {
        Self {
            auto_start: true,
            ..Default::default()
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn SagaStore>,
    engine: Arc<ExecutionEngine>,
    pools: Arc<WorkerPools>,
    event_bus: Arc<EventBus>,
    metrics: Arc<Metrics>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn SagaStore>,
        engine: Arc<ExecutionEngine>,
        pools: Arc<WorkerPools>,
        event_bus: Arc<EventBus>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            engine,
            pools,
            event_bus,
            metrics,
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn pools(&self) -> &Arc<WorkerPools> {
        &self.pools
    }

    /// Validates and persists a new saga in `CREATED`, then — unless
    /// `auto_start` was turned off — dispatches it to the saga-exec pool for
    /// immediate background execution.
    pub async fn create(
        &self,
        name: impl Into<String>,
        steps: Vec<Step>,
        input: DataMap,
        options: CreateOptions,
    ) -> SagaResult<Saga> {
        validate_steps(&steps)?;

        let mut saga = Saga::new(name, steps, input);
        if let Some(correlation_id) = options.correlation_id {
            saga = saga.with_correlation_id(correlation_id);
        }
        if let Some(max_retries) = options.max_retries {
            saga = saga.with_max_retries(max_retries);
        }
        if let Some(timeout_ms) = options.timeout_ms {
            saga = saga.with_timeout_ms(timeout_ms);
        }
        if let Some(priority) = options.priority {
            saga = saga.with_priority(priority);
        }

        let saga = self.store.save(saga).await?;

        if options.auto_start {
            self.execute_async(saga.saga_id);
        }

        Ok(saga)
    }

    /// Synchronously drives `saga_id` to its next pause point. Idempotent
    /// once the saga has reached a terminal status. Dispatched through the
    /// saga-exec pool, the same one `execute_async` uses, since both drive
    /// one whole saga rather than a single step adapter invocation.
    pub async fn execute(&self, saga_id: Uuid) -> SagaResult<Saga> {
        let engine = self.engine.clone();
        self.pools
            .saga_exec
            .dispatch(async move { engine.execute(saga_id).await })
            .await
    }

    /// Enqueues `saga_id` onto the saga-exec pool and returns immediately.
    /// Errors surfaced during the background drive are logged, not returned
    /// — callers observe outcome through `Get`/events, as there is nobody
    /// left to hand a `Result` to once the call has returned.
    pub fn execute_async(&self, saga_id: Uuid) {
        let engine = self.engine.clone();
        let pools = self.pools.clone();
        tokio::spawn(async move {
            let result = pools
                .saga_exec
                .dispatch(async move { engine.execute(saga_id).await })
                .await;
            if let Err(err) = result {
                tracing::warn!(saga_id = %saga_id, error = %err, "background execution failed");
            }
        });
    }

    pub async fn retry(&self, saga_id: Uuid) -> SagaResult<Saga> {
        self.engine.retry(saga_id).await
    }

    pub async fn compensate(&self, saga_id: Uuid) -> SagaResult<Saga> {
        let engine = self.engine.clone();
        self.pools
            .compensation
            .dispatch(async move { engine.compensate(saga_id).await })
            .await
    }

    pub async fn get(&self, saga_id: Uuid) -> SagaResult<Saga> {
        self.store
            .find(saga_id)
            .await?
            .ok_or(SagaError::NotFound { saga_id })
    }

    pub async fn list_by_status(&self, status: SagaStatus, page: Page) -> SagaResult<Vec<Saga>> {
        self.store.find_by_status(status, page).await
    }

    pub async fn list_by_correlation(&self, correlation_id: &str) -> SagaResult<Vec<Saga>> {
        self.store.find_by_correlation(correlation_id).await
    }
}

fn validate_steps(steps: &[Step]) -> SagaResult<()> {
    if steps.is_empty() {
        return Ok(());
    }
    let mut orders: Vec<usize> = steps.iter().map(|s| s.order).collect();
    orders.sort_unstable();
    for (expected, actual) in orders.iter().enumerate() {
        if expected != *actual {
            return Err(SagaError::Validation {
                field: "steps".to_string(),
                message: format!(
                    "step orders must be a contiguous sequence starting at 0, found gap or duplicate at {actual}"
                ),
            });
        }
    }
    for step in steps {
        if step.name.trim().is_empty() {
            return Err(SagaError::Validation {
                field: "steps[].name".to_string(),
                message: "step name must not be empty".to_string(),
            });
        }
    }
    Ok(())
}
