//! The saga state machine: advances a saga one step at a time, handling
//! retries, timeouts, and the handoff into compensation. This is the
//! execution core the rest of the crate exists to support.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::compensation::CompensationDriver;
use crate::error::{SagaError, SagaResult};
use crate::events::{EventBus, SagaEvent};
use crate::executors::StepExecutorRegistry;
use crate::metrics::Metrics;
use crate::models::{Saga, SagaStatus, StepResult, StepStatus};
use crate::pool::WorkerPools;
use crate::store::{save_transition, SagaStore};

pub struct ExecutionEngine {
    store: Arc<dyn SagaStore>,
    registry: Arc<StepExecutorRegistry>,
    compensation: Arc<CompensationDriver>,
    event_bus: Arc<EventBus>,
    metrics: Arc<Metrics>,
    pools: Arc<WorkerPools>,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn SagaStore>,
        registry: Arc<StepExecutorRegistry>,
        compensation: Arc<CompensationDriver>,
        event_bus: Arc<EventBus>,
        metrics: Arc<Metrics>,
        pools: Arc<WorkerPools>,
    ) -> Self {
        Self {
            store,
            registry,
            compensation,
            event_bus,
            metrics,
            pools,
        }
    }

    /// Synchronously drives `saga_id` to its next terminal or retrying
    /// pause point. A no-op on an already-terminal saga: returns the saga
    /// unchanged and emits nothing, per the idempotence contract.
    pub async fn execute(&self, saga_id: Uuid) -> SagaResult<Saga> {
        let Some(mut saga) = self.store.find(saga_id).await? else {
            return Err(SagaError::NotFound { saga_id });
        };

        if saga.status.is_terminal() {
            return Ok(saga);
        }

        if saga.status == SagaStatus::Created {
            let (updated, applied) = save_transition(self.store.as_ref(), saga, |s| {
                if s.status != SagaStatus::Created {
                    return false;
                }
                s.status = SagaStatus::Running;
                s.started_at = Some(Utc::now());
                s.touch();
                true
            })
            .await?;
            saga = updated;

            if saga.status.is_terminal() {
                // A concurrent caller raced us to a terminal state already.
                return Ok(saga);
            }
            if applied {
                self.metrics.saga_started();
                self.event_bus.publish(SagaEvent::SagaStarted {
                    saga_id: saga.saga_id,
                    name: saga.name.clone(),
                    correlation_id: saga.correlation_id.clone(),
                    at: Utc::now(),
                });
            }
        }

        self.drive(saga).await
    }

    /// Administrative retry: requires `FAILED` with budget remaining.
    /// Resets `retry_count` and re-enters `RUNNING` from `current_step_index`
    /// — not from the start, the only coherent choice given the cursor
    /// (§9 resolves the source's ambiguity on this point).
    pub async fn retry(&self, saga_id: Uuid) -> SagaResult<Saga> {
        let Some(saga) = self.store.find(saga_id).await? else {
            return Err(SagaError::NotFound { saga_id });
        };
        if saga.status != SagaStatus::Failed {
            return Err(SagaError::InvalidStatus {
                saga_id,
                status: saga.status.to_string(),
                expected: "FAILED".to_string(),
            });
        }
        if saga.retry_count >= saga.max_retries {
            return Err(SagaError::InvalidStatus {
                saga_id,
                status: "retry budget exhausted".to_string(),
                expected: format!("retry_count < {}", saga.max_retries),
            });
        }

        let (saga, applied) = save_transition(self.store.as_ref(), saga, |s| {
            if s.status != SagaStatus::Failed || s.retry_count >= s.max_retries {
                return false;
            }
            s.retry_count = 0;
            s.error_message = None;
            s.error_trace = None;
            s.completed_at = None;
            s.status = SagaStatus::Running;
            if let Some(step) = s.current_step_mut() {
                step.status = StepStatus::Created;
                step.retry_count = 0;
                step.error_message = None;
                step.error_trace = None;
            }
            s.touch();
            true
        })
        .await?;

        if !applied {
            return Err(SagaError::InvalidStatus {
                saga_id,
                status: saga.status.to_string(),
                expected: "FAILED with retry budget remaining".to_string(),
            });
        }

        self.drive(saga).await
    }

    /// Administrative compensate: requires `FAILED` or `RUNNING`.
    pub async fn compensate(&self, saga_id: Uuid) -> SagaResult<Saga> {
        let Some(saga) = self.store.find(saga_id).await? else {
            return Err(SagaError::NotFound { saga_id });
        };
        if saga.status == SagaStatus::Compensated {
            return Ok(saga);
        }
        if !matches!(saga.status, SagaStatus::Failed | SagaStatus::Running) {
            return Err(SagaError::InvalidStatus {
                saga_id,
                status: saga.status.to_string(),
                expected: "FAILED or RUNNING".to_string(),
            });
        }

        let (saga, applied) = save_transition(self.store.as_ref(), saga, |s| {
            if s.status == SagaStatus::Compensated {
                return false;
            }
            if !matches!(s.status, SagaStatus::Failed | SagaStatus::Running) {
                return false;
            }
            s.status = SagaStatus::Compensating;
            s.touch();
            true
        })
        .await?;

        if !applied {
            if saga.status == SagaStatus::Compensated {
                return Ok(saga);
            }
            return Err(SagaError::InvalidStatus {
                saga_id,
                status: saga.status.to_string(),
                expected: "FAILED or RUNNING".to_string(),
            });
        }

        let saga = self.compensation.compensate(saga, self.store.as_ref()).await?;
        self.emit_compensation_outcome(&saga);
        Ok(saga)
    }

    /// The advancement loop of §4.8: runs until the saga reaches a terminal
    /// status. Retry backoff sleeps happen inline — a worker owns this saga
    /// exclusively for the duration of the call (§5 concurrency discipline).
    /// Every persisted write along the way is retried through
    /// [`save_transition`] so a lost version race (I7) reloads and
    /// re-derives the next transition instead of aborting the drive.
    async fn drive(&self, mut saga: Saga) -> SagaResult<Saga> {
        loop {
            if saga.status.is_terminal() {
                return Ok(saga);
            }

            if saga.is_wall_clock_exhausted(Utc::now()) {
                return self.timeout_saga(saga).await;
            }

            let Some(index) = Self::current_index(&saga) else {
                return self.complete_saga(saga).await;
            };

            let (updated, applied) = save_transition(self.store.as_ref(), saga, move |s| {
                if s.status.is_terminal() || s.current_step_index != index || index >= s.steps.len() {
                    return false;
                }
                s.steps[index].status = StepStatus::Running;
                s.steps[index].started_at = Some(Utc::now());
                s.touch();
                true
            })
            .await?;
            saga = updated;

            if !applied {
                // Someone else already moved this saga past this point (or
                // it reached a terminal status); re-derive from the
                // authoritative state instead of acting on stale assumptions.
                continue;
            }

            self.event_bus.publish(SagaEvent::StepStarted {
                saga_id: saga.saga_id,
                step_id: saga.steps[index].step_id,
                step_name: saga.steps[index].name.clone(),
                at: Utc::now(),
            });

            let step_snapshot = saga.steps[index].clone();
            let executor = self.registry.get(step_snapshot.step_type);
            let unsupported = executor.is_none();

            // The saga's own wall clock can expire while a step is in flight;
            // race the step against whichever deadline is nearer so a stuck
            // step doesn't keep the saga alive past its budget.
            let saga_remaining_ms = Self::remaining_saga_budget_ms(&saga);
            let effective_timeout_ms = match (step_snapshot.timeout_ms, saga_remaining_ms) {
                (0, None) => None,
                (0, Some(remaining)) => Some(remaining),
                (step_ms, None) => Some(step_ms),
                (step_ms, Some(remaining)) => Some(step_ms.min(remaining)),
            };
            let saga_deadline_is_limiting = matches!(
                (saga_remaining_ms, effective_timeout_ms),
                (Some(remaining), Some(effective)) if remaining <= effective
            );

            let outcome = match executor {
                Some(executor) => {
                    let pool = &self.pools.step_exec;
                    let invocation = pool.dispatch(executor.execute(&step_snapshot, &saga.input_data));
                    match effective_timeout_ms {
                        Some(timeout_ms) => {
                            match tokio::time::timeout(Duration::from_millis(timeout_ms), invocation).await {
                                Ok(result) => StepOutcomeRaw::Result(result),
                                Err(_) if saga_deadline_is_limiting => StepOutcomeRaw::SagaTimedOut,
                                Err(_) => StepOutcomeRaw::Result(StepResult::failure(
                                    format!("step '{}' exceeded {}ms", step_snapshot.name, step_snapshot.timeout_ms),
                                    timeout_ms,
                                )),
                            }
                        }
                        None => StepOutcomeRaw::Result(invocation.await),
                    }
                }
                None => StepOutcomeRaw::Result(StepResult::failure(
                    format!("UNSUPPORTED_STEP_TYPE: {}", step_snapshot.step_type),
                    0,
                )),
            };

            let result = match outcome {
                StepOutcomeRaw::SagaTimedOut => return self.timeout_saga(saga).await,
                StepOutcomeRaw::Result(result) => result,
            };

            self.metrics
                .step_executed(step_snapshot.step_type, result.duration_ms, result.success);

            if result.success {
                saga = self.complete_step(saga, index, result).await?;
                continue;
            }

            saga = match self.fail_step(saga, index, result, unsupported).await? {
                StepOutcome::Continue(saga) => saga,
                StepOutcome::Done(saga) => return Ok(saga),
            };
        }
    }

    fn current_index(saga: &Saga) -> Option<usize> {
        if saga.current_step_index < saga.steps.len() {
            Some(saga.current_step_index)
        } else {
            None
        }
    }

    /// Milliseconds left in the saga's wall-clock budget, or `None` if the
    /// saga is unbounded (`timeout_ms == 0`) or hasn't started yet.
    fn remaining_saga_budget_ms(saga: &Saga) -> Option<u64> {
        if saga.timeout_ms == 0 {
            return None;
        }
        let started_at = saga.started_at?;
        let elapsed = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
        Some(saga.timeout_ms.saturating_sub(elapsed))
    }

    async fn complete_step(&self, saga: Saga, index: usize, result: StepResult) -> SagaResult<Saga> {
        let now = Utc::now();
        let output = result.output;
        let duration_ms = result.duration_ms;

        let (saga, applied) = save_transition(self.store.as_ref(), saga, move |s| {
            if s.current_step_index != index || index >= s.steps.len() {
                return false;
            }
            for (key, value) in output.iter() {
                s.output_data.insert(key.clone(), value.clone());
            }
            {
                let step = &mut s.steps[index];
                step.output_data = output.clone();
                step.status = StepStatus::Completed;
                step.completed_at = Some(now);
                step.duration_ms = step
                    .started_at
                    .map(|started| (now - started).num_milliseconds().max(0) as u64);
            }
            s.current_step_index += 1;
            s.retry_count = 0;
            s.status = SagaStatus::Running;
            s.touch();
            true
        })
        .await?;

        if applied {
            let step = &saga.steps[index];
            self.event_bus.publish(SagaEvent::StepCompleted {
                saga_id: saga.saga_id,
                step_id: step.step_id,
                step_name: step.name.clone(),
                duration_ms,
                at: now,
            });
        }
        Ok(saga)
    }

    async fn fail_step(
        &self,
        saga: Saga,
        index: usize,
        result: StepResult,
        unsupported: bool,
    ) -> SagaResult<StepOutcome> {
        let now = Utc::now();
        let error_message = result.error_message.clone();
        let error_trace = result.error_trace.clone();

        let (saga, applied) = save_transition(self.store.as_ref(), saga, move |s| {
            if s.current_step_index != index || index >= s.steps.len() {
                return false;
            }
            {
                let step = &mut s.steps[index];
                step.error_message = error_message.clone();
                step.error_trace = error_trace.clone();
                step.completed_at = Some(now);
                step.duration_ms = step
                    .started_at
                    .map(|started| (now - started).num_milliseconds().max(0) as u64);
            }

            let retryable = !unsupported && s.steps[index].retry_count < s.steps[index].max_retries;
            if retryable {
                let step = &mut s.steps[index];
                step.retry_count += 1;
                step.status = StepStatus::Retrying;
                s.retry_count += 1;
                s.status = SagaStatus::Retrying;
            } else {
                let required = s.steps[index].required;
                s.steps[index].status = StepStatus::Failed;
                if !required {
                    s.current_step_index += 1;
                    s.status = SagaStatus::Running;
                } else {
                    s.status = SagaStatus::Compensating;
                }
            }
            s.touch();
            true
        })
        .await?;

        if !applied {
            // Someone else already recorded an outcome for this step; carry
            // on with whatever authoritative state the reload left behind.
            return Ok(StepOutcome::Continue(saga));
        }

        match saga.status {
            SagaStatus::Retrying => {
                let step = &saga.steps[index];
                self.metrics.step_retried();
                self.event_bus.publish(SagaEvent::StepRetrying {
                    saga_id: saga.saga_id,
                    step_id: step.step_id,
                    step_name: step.name.clone(),
                    retry_count: step.retry_count,
                    at: now,
                });
                let retry_delay_ms = step.retry_delay_ms;
                tokio::time::sleep(Duration::from_millis(retry_delay_ms)).await;
                Ok(StepOutcome::Continue(saga))
            }
            SagaStatus::Compensating => {
                let step = &saga.steps[index];
                warn!(saga_id = %saga.saga_id, step = %step.name, "required step exhausted retries, compensating");
                self.event_bus.publish(SagaEvent::StepFailed {
                    saga_id: saga.saga_id,
                    step_id: step.step_id,
                    step_name: step.name.clone(),
                    error_message: result.error_message.unwrap_or_default(),
                    at: now,
                });
                let saga = self.compensation.compensate(saga, self.store.as_ref()).await?;
                self.emit_compensation_outcome(&saga);
                Ok(StepOutcome::Done(saga))
            }
            _ => {
                // Non-required step exhausted retries: saga stays RUNNING
                // and advances past it.
                let step = &saga.steps[index];
                self.event_bus.publish(SagaEvent::StepFailed {
                    saga_id: saga.saga_id,
                    step_id: step.step_id,
                    step_name: step.name.clone(),
                    error_message: result.error_message.unwrap_or_default(),
                    at: now,
                });
                Ok(StepOutcome::Continue(saga))
            }
        }
    }

    async fn complete_saga(&self, saga: Saga) -> SagaResult<Saga> {
        let (saga, applied) = save_transition(self.store.as_ref(), saga, |s| {
            if s.status.is_terminal() {
                return false;
            }
            s.status = SagaStatus::Completed;
            s.completed_at = Some(Utc::now());
            s.touch();
            true
        })
        .await?;

        if applied {
            self.metrics.saga_completed();
            info!(saga_id = %saga.saga_id, "saga completed");
            self.event_bus.publish(SagaEvent::SagaCompleted {
                saga_id: saga.saga_id,
                at: Utc::now(),
            });
        }
        Ok(saga)
    }

    /// Saga-level wall clock exhausted: transitions to `TIMEOUT` even
    /// mid-step (the in-flight step is abandoned), then compensates the
    /// completed prefix without promoting the saga out of `TIMEOUT` unless
    /// a required compensation fails (§9 decision; see DESIGN.md).
    async fn timeout_saga(&self, saga: Saga) -> SagaResult<Saga> {
        let now = Utc::now();
        let timeout_ms = saga.timeout_ms;

        let (saga, applied) = save_transition(self.store.as_ref(), saga, move |s| {
            if s.status.is_terminal() {
                return false;
            }
            if let Some(step) = s.current_step_mut() {
                if step.status == StepStatus::Running {
                    step.status = StepStatus::Timeout;
                    step.error_message = Some("timeout".to_string());
                    step.completed_at = Some(now);
                }
            }
            s.status = SagaStatus::Timeout;
            s.error_message = Some(format!("saga timed out after {timeout_ms}ms"));
            s.completed_at = Some(now);
            s.touch();
            true
        })
        .await?;

        if applied {
            self.metrics.saga_timed_out();
            warn!(saga_id = %saga.saga_id, "saga timed out");
            self.event_bus.publish(SagaEvent::SagaTimedOut {
                saga_id: saga.saga_id,
                at: now,
            });
        }

        if saga.status != SagaStatus::Timeout {
            // Someone else already drove this saga to a different terminal
            // status; nothing left to compensate on our behalf.
            return Ok(saga);
        }

        let saga = self
            .compensation
            .compensate_timed_out_prefix(saga, self.store.as_ref())
            .await?;
        if saga.status == SagaStatus::Failed {
            self.event_bus.publish(SagaEvent::SagaFailed {
                saga_id: saga.saga_id,
                error_message: saga.error_message.clone().unwrap_or_default(),
                at: Utc::now(),
            });
        }
        Ok(saga)
    }

    fn emit_compensation_outcome(&self, saga: &Saga) {
        match saga.status {
            SagaStatus::Compensated => {
                self.event_bus.publish(SagaEvent::SagaCompensated {
                    saga_id: saga.saga_id,
                    at: Utc::now(),
                });
            }
            SagaStatus::Failed => {
                self.event_bus.publish(SagaEvent::SagaFailed {
                    saga_id: saga.saga_id,
                    error_message: saga.error_message.clone().unwrap_or_default(),
                    at: Utc::now(),
                });
            }
            _ => {}
        }
    }
}

enum StepOutcome {
    Continue(Saga),
    Done(Saga),
}

enum StepOutcomeRaw {
    Result(StepResult),
    SagaTimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compensation::CompensationDriver;
    use crate::executors::{StepExecutor, StepExecutorRegistry};
    use crate::models::{CompensationConfig, DataMap, Step, StepConfig, StepType};
    use crate::store::memory::InMemorySagaStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyExecutor {
        attempts: Arc<AtomicUsize>,
        fail_until: usize,
    }

    #[async_trait]
    impl StepExecutor for FlakyExecutor {
        async fn execute(&self, _step: &crate::models::Step, _saga_input: &DataMap) -> StepResult {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_until {
                StepResult::failure("transient", 1)
            } else {
                StepResult::success(DataMap::new(), 1)
            }
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl StepExecutor for AlwaysFails {
        async fn execute(&self, _step: &crate::models::Step, _saga_input: &DataMap) -> StepResult {
            StepResult::failure("nope", 1)
        }
    }

    struct AlwaysSucceeds;

    #[async_trait]
    impl StepExecutor for AlwaysSucceeds {
        async fn execute(&self, _step: &crate::models::Step, _saga_input: &DataMap) -> StepResult {
            StepResult::success(DataMap::new(), 1)
        }
    }

    fn engine_with(registry: StepExecutorRegistry) -> (ExecutionEngine, Arc<InMemorySagaStore>) {
        let store = Arc::new(InMemorySagaStore::new());
        let registry = Arc::new(registry);
        let event_bus = Arc::new(EventBus::new(64));
        let metrics = Arc::new(Metrics::new());
        let compensation = Arc::new(CompensationDriver::new(registry.clone(), event_bus.clone(), metrics.clone()));
        let pools = Arc::new(WorkerPools::default());
        let engine = ExecutionEngine::new(store.clone(), registry, compensation, event_bus, metrics, pools);
        (engine, store)
    }

    #[tokio::test]
    async fn happy_path_completes_all_steps() {
        let mut registry = StepExecutorRegistry::new();
        registry.register(StepType::Wait, Arc::new(AlwaysSucceeds));
        let (engine, store) = engine_with(registry);

        let steps = vec![
            Step::new(0, "a", StepType::Wait, StepConfig::new()),
            Step::new(1, "b", StepType::Wait, StepConfig::new()),
            Step::new(2, "c", StepType::Wait, StepConfig::new()),
        ];
        let saga = Saga::new("demo", steps, DataMap::new());
        let saga_id = saga.saga_id;
        store.save(saga).await.unwrap();

        let result = engine.execute(saga_id).await.unwrap();
        assert_eq!(result.status, SagaStatus::Completed);
        assert_eq!(result.current_step_index, 3);
        assert!(result.steps.iter().all(|s| s.status == StepStatus::Completed));
    }

    #[tokio::test]
    async fn zero_step_saga_completes_immediately() {
        let registry = StepExecutorRegistry::new();
        let (engine, store) = engine_with(registry);
        let saga = Saga::new("empty", vec![], DataMap::new());
        let saga_id = saga.saga_id;
        store.save(saga).await.unwrap();

        let result = engine.execute(saga_id).await.unwrap();
        assert_eq!(result.status, SagaStatus::Completed);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let mut registry = StepExecutorRegistry::new();
        registry.register(
            StepType::Wait,
            Arc::new(FlakyExecutor {
                attempts: Arc::new(AtomicUsize::new(0)),
                fail_until: 2,
            }),
        );
        let (engine, store) = engine_with(registry);

        let mut step = Step::new(0, "flaky", StepType::Wait, StepConfig::new());
        step.max_retries = 3;
        step.retry_delay_ms = 1;
        let saga = Saga::new("demo", vec![step], DataMap::new());
        let saga_id = saga.saga_id;
        store.save(saga).await.unwrap();

        let result = engine.execute(saga_id).await.unwrap();
        assert_eq!(result.status, SagaStatus::Completed);
        assert_eq!(result.steps[0].retry_count, 2);
    }

    #[tokio::test]
    async fn required_step_exhausted_triggers_compensation() {
        // 'a' must succeed to be a compensation candidate; 'b' always fails.
        // Two distinct step types let one executor succeed and the other fail.
        let mut registry = StepExecutorRegistry::new();
        registry.register(StepType::Wait, Arc::new(AlwaysFails));
        registry.register(StepType::DatabaseOp, Arc::new(AlwaysSucceeds));
        let (engine, store) = engine_with(registry);

        let mut step_a = Step::new(0, "a", StepType::DatabaseOp, StepConfig::new());
        step_a.max_retries = 0;
        step_a.compensation_config = Some(CompensationConfig {
            compensation_type: StepType::DatabaseOp,
            config: StepConfig::new(),
            required: true,
            max_retries: 0,
            retry_delay_ms: 1,
        });
        let mut step_b = Step::new(1, "b", StepType::Wait, StepConfig::new());
        step_b.max_retries = 0;

        let saga = Saga::new("demo", vec![step_a, step_b], DataMap::new());
        let saga_id = saga.saga_id;
        store.save(saga).await.unwrap();

        let result = engine.execute(saga_id).await.unwrap();
        assert_eq!(result.status, SagaStatus::Compensated);
        assert_eq!(result.steps[0].status, StepStatus::Compensated);
        assert_eq!(result.steps[1].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn unsupported_step_type_is_non_retryable() {
        let registry = StepExecutorRegistry::new();
        let (engine, store) = engine_with(registry);

        let mut step = Step::new(0, "mystery", StepType::Parallel, StepConfig::new());
        step.max_retries = 5;
        let saga = Saga::new("demo", vec![step], DataMap::new());
        let saga_id = saga.saga_id;
        store.save(saga).await.unwrap();

        let result = engine.execute(saga_id).await.unwrap();
        // Non-required by default test step is required=true, so it compensates
        // (trivially, with no candidates) straight to FAILED via no comp config,
        // but since nothing is compensatable it settles as COMPENSATED.
        assert!(matches!(result.status, SagaStatus::Compensated | SagaStatus::Failed));
        assert_eq!(result.steps[0].status, StepStatus::Failed);
        assert_eq!(result.steps[0].retry_count, 0);
    }

    #[tokio::test]
    async fn execute_on_terminal_saga_is_a_no_op() {
        let registry = StepExecutorRegistry::new();
        let (engine, store) = engine_with(registry);
        let mut saga = Saga::new("demo", vec![], DataMap::new());
        saga.status = SagaStatus::Completed;
        saga.completed_at = Some(Utc::now());
        let saga_id = saga.saga_id;
        store.save(saga).await.unwrap();

        let before = store.find(saga_id).await.unwrap().unwrap();
        let result = engine.execute(saga_id).await.unwrap();
        assert_eq!(result.version, before.version);
    }

    #[tokio::test]
    async fn saga_timeout_abandons_current_step() {
        let mut registry = StepExecutorRegistry::new();
        registry.register(
            StepType::Wait,
            Arc::new(crate::executors::WaitExecutor),
        );
        let (engine, store) = engine_with(registry);

        let mut step = Step::new(0, "slow", StepType::Wait, StepConfig::new().with("delay_ms", 200u64));
        step.timeout_ms = 0;
        let saga = Saga::new("demo", vec![step], DataMap::new()).with_timeout_ms(20);
        let saga_id = saga.saga_id;
        store.save(saga).await.unwrap();

        let result = engine.execute(saga_id).await.unwrap();
        assert_eq!(result.status, SagaStatus::Timeout);
    }

    #[tokio::test]
    async fn concurrent_executes_on_the_same_saga_never_double_run_a_step() {
        // I7 / scenario 7: two concurrent `Execute` calls racing the same
        // saga. One wins each step advance; the other observes a stale
        // version, reloads, and converges on the same terminal state without
        // the flaky step being invoked more times than its retry budget
        // allows for a single logical attempt.
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut registry = StepExecutorRegistry::new();
        registry.register(
            StepType::Wait,
            Arc::new(FlakyExecutor {
                attempts: attempts.clone(),
                fail_until: 0,
            }),
        );
        let (engine, store) = engine_with(registry);
        let engine = Arc::new(engine);

        let steps = vec![
            Step::new(0, "a", StepType::Wait, StepConfig::new()),
            Step::new(1, "b", StepType::Wait, StepConfig::new()),
            Step::new(2, "c", StepType::Wait, StepConfig::new()),
        ];
        let saga = Saga::new("demo", steps, DataMap::new());
        let saga_id = saga.saga_id;
        store.save(saga).await.unwrap();

        let (a, b) = tokio::join!(engine.execute(saga_id), engine.execute(saga_id));
        let a = a.unwrap();
        let b = b.unwrap();

        // Both callers observe the saga reach the same terminal outcome;
        // neither surfaces STALE_VERSION as an error to its caller.
        assert_eq!(a.status, SagaStatus::Completed);
        assert_eq!(b.status, SagaStatus::Completed);

        let stored = store.find(saga_id).await.unwrap().unwrap();
        assert!(stored.steps.iter().all(|s| s.status == StepStatus::Completed));
    }
}
