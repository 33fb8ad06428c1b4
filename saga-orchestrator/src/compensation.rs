//! Walks a saga's completed steps in reverse order, dispatching each one's
//! compensation through the same executor registry used for forward work.
//!
//! Each compensation attempt is its own persisted transition — there is no
//! overarching transaction across the whole rollback, matching §9's
//! resolution of the source's ambiguous transactional boundary.

use std::sync::Arc;
use tracing::{info, warn};

use crate::error::SagaResult;
use crate::events::{EventBus, SagaEvent};
use crate::executors::StepExecutorRegistry;
use crate::metrics::Metrics;
use crate::models::{DataMap, Saga, SagaStatus, Step, StepResult, StepStatus};
use crate::store::{save_transition, SagaStore};

pub struct CompensationDriver {
    registry: Arc<StepExecutorRegistry>,
    event_bus: Arc<EventBus>,
    metrics: Arc<Metrics>,
}

impl CompensationDriver {
    pub fn new(registry: Arc<StepExecutorRegistry>, event_bus: Arc<EventBus>, metrics: Arc<Metrics>) -> Self {
        Self {
            registry,
            event_bus,
            metrics,
        }
    }

    /// Drives `saga` (expected to already be `COMPENSATING`) through its
    /// compensation candidates, persisting after every step transition.
    /// Returns the final, persisted saga in `COMPENSATED` or `FAILED`.
    pub async fn compensate(&self, saga: Saga, store: &dyn SagaStore) -> SagaResult<Saga> {
        let (saga, stopped_on) = self.walk(saga, store).await?;

        if stopped_on.is_none() {
            let (saga, applied) = save_transition(store, saga, |s| {
                if s.status.is_terminal() {
                    return false;
                }
                s.status = SagaStatus::Compensated;
                s.completed_at = Some(chrono::Utc::now());
                s.touch();
                true
            })
            .await?;
            if applied {
                self.metrics.saga_compensated();
                info!(saga_id = %saga.saga_id, "compensation complete");
            }
            Ok(saga)
        } else {
            Ok(saga)
        }
    }

    /// Compensates the completed prefix of a saga that has already
    /// transitioned to `TIMEOUT`. `TIMEOUT` is itself a terminal status (§3
    /// lifecycle), so a clean rollback here does not promote it further to
    /// `COMPENSATED` — only a required compensation failure still escalates
    /// the saga to `FAILED`, matching §4.7's rule literally.
    pub async fn compensate_timed_out_prefix(&self, saga: Saga, store: &dyn SagaStore) -> SagaResult<Saga> {
        let (saga, _stopped_on) = self.walk(saga, store).await?;
        Ok(saga)
    }

    /// Walks the compensation candidates in reverse order, persisting after
    /// every step transition. Returns the (possibly already `FAILED`) saga
    /// and, if a required compensation failed, the name of the step that
    /// stopped the walk.
    async fn walk(&self, mut saga: Saga, store: &dyn SagaStore) -> SagaResult<(Saga, Option<String>)> {
        let candidate_indices = saga.compensation_candidates();
        info!(
            saga_id = %saga.saga_id,
            candidates = candidate_indices.len(),
            "starting compensation"
        );

        for index in candidate_indices {
            let outcome = self.compensate_one(&saga.steps[index], &saga.input_data).await;

            match outcome {
                CompensationOutcome::Succeeded => {
                    let (updated, applied) = save_transition(store, saga, move |s| {
                        if index >= s.steps.len() || s.steps[index].status == StepStatus::Compensated {
                            return false;
                        }
                        s.steps[index].status = StepStatus::Compensated;
                        s.steps[index].completed_at = Some(chrono::Utc::now());
                        s.touch();
                        true
                    })
                    .await?;
                    saga = updated;

                    if applied {
                        self.event_bus.publish(SagaEvent::StepCompensated {
                            saga_id: saga.saga_id,
                            step_id: saga.steps[index].step_id,
                            step_name: saga.steps[index].name.clone(),
                            at: chrono::Utc::now(),
                        });
                    }
                }
                CompensationOutcome::Failed { required, reason } => {
                    let reason_for_step = reason.clone();
                    let (updated, applied) = save_transition(store, saga, move |s| {
                        if index >= s.steps.len() || s.steps[index].status == StepStatus::Failed {
                            return false;
                        }
                        s.steps[index].status = StepStatus::Failed;
                        s.steps[index].error_message = Some(reason_for_step.clone());
                        s.steps[index].completed_at = Some(chrono::Utc::now());
                        s.touch();
                        true
                    })
                    .await?;
                    saga = updated;

                    let step_name = saga.steps[index].name.clone();
                    let step_id = saga.steps[index].step_id;

                    if applied {
                        self.event_bus.publish(SagaEvent::StepCompensationFailed {
                            saga_id: saga.saga_id,
                            step_id,
                            step_name: step_name.clone(),
                            error_message: reason.clone(),
                            at: chrono::Utc::now(),
                        });
                    }

                    if required {
                        warn!(saga_id = %saga.saga_id, step = %step_name, "required compensation failed, saga -> FAILED");
                        let fail_message = format!("compensation failed: {step_name}");
                        let (updated, applied) = save_transition(store, saga, move |s| {
                            if s.status.is_terminal() {
                                return false;
                            }
                            s.status = SagaStatus::Failed;
                            s.error_message = Some(fail_message.clone());
                            s.completed_at = Some(chrono::Utc::now());
                            s.touch();
                            true
                        })
                        .await?;
                        saga = updated;
                        if applied {
                            self.metrics.saga_failed();
                        }
                        return Ok((saga, Some(step_name)));
                    }
                }
            }
        }

        Ok((saga, None))
    }

    async fn compensate_one(&self, step: &Step, saga_input: &DataMap) -> CompensationOutcome {
        let Some(compensation) = step.compensation_config.as_ref() else {
            return CompensationOutcome::Succeeded;
        };

        let Some(executor) = self.registry.get(compensation.compensation_type) else {
            return CompensationOutcome::Failed {
                required: compensation.required,
                reason: format!(
                    "no executor registered for compensation type '{}'",
                    compensation.compensation_type
                ),
            };
        };

        // Substitution context: the original step's own output layered over
        // the saga's input, so a compensation config can reference either.
        let mut context = saga_input.clone();
        for (key, value) in &step.output_data {
            context.insert(key.clone(), value.clone());
        }

        let synthetic_step = Step {
            step_id: step.step_id,
            name: format!("compensate:{}", step.name),
            order: step.order,
            step_type: compensation.compensation_type,
            status: StepStatus::Running,
            config: compensation.config.clone(),
            compensation_config: None,
            input_data: context.clone(),
            output_data: DataMap::new(),
            error_message: None,
            error_trace: None,
            retry_count: 0,
            max_retries: compensation.max_retries,
            timeout_ms: step.timeout_ms,
            retry_delay_ms: compensation.retry_delay_ms,
            required: compensation.required,
            compensatable: false,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        };

        let attempts = compensation.max_retries + 1;
        let mut last_result: Option<StepResult> = None;

        for attempt in 0..attempts {
            let result = executor.execute(&synthetic_step, &context).await;
            self.metrics
                .step_executed(compensation.compensation_type, result.duration_ms, result.success);

            if result.success {
                return CompensationOutcome::Succeeded;
            }
            last_result = Some(result);

            if attempt + 1 < attempts {
                tokio::time::sleep(std::time::Duration::from_millis(compensation.retry_delay_ms)).await;
            }
        }

        CompensationOutcome::Failed {
            required: compensation.required,
            reason: last_result
                .and_then(|r| r.error_message)
                .unwrap_or_else(|| "compensation failed with no error detail".to_string()),
        }
    }
}

enum CompensationOutcome {
    Succeeded,
    Failed { required: bool, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::StepExecutor;
    use crate::models::{CompensationConfig, Step, StepConfig, StepType};
    use crate::store::memory::InMemorySagaStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExecutor {
        calls: Arc<AtomicUsize>,
        order: Arc<std::sync::Mutex<Vec<String>>>,
        fail_names: Vec<String>,
    }

    #[async_trait]
    impl StepExecutor for CountingExecutor {
        async fn execute(&self, step: &Step, _saga_input: &DataMap) -> StepResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(step.name.clone());
            if self.fail_names.iter().any(|n| step.name.contains(n)) {
                StepResult::failure("boom", 1)
            } else {
                StepResult::success(DataMap::new(), 1)
            }
        }
    }

    fn completed_step(order: usize, name: &str, required: bool) -> Step {
        let mut step = Step::new(order, name, StepType::Wait, StepConfig::new());
        step.status = StepStatus::Completed;
        step.compensation_config = Some(CompensationConfig {
            compensation_type: StepType::Wait,
            config: StepConfig::new(),
            required,
            max_retries: 1,
            retry_delay_ms: 1,
        });
        step
    }

    fn driver(executor: Arc<dyn StepExecutor>) -> CompensationDriver {
        let mut registry = StepExecutorRegistry::new();
        registry.register(StepType::Wait, executor);
        CompensationDriver::new(
            Arc::new(registry),
            Arc::new(EventBus::new(16)),
            Arc::new(Metrics::new()),
        )
    }

    #[tokio::test]
    async fn compensates_in_reverse_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let executor = Arc::new(CountingExecutor {
            calls: Arc::new(AtomicUsize::new(0)),
            order: order.clone(),
            fail_names: vec![],
        });
        let steps = vec![
            completed_step(0, "a", true),
            completed_step(1, "b", true),
            completed_step(2, "c", true),
        ];
        let mut saga = Saga::new("demo", steps, DataMap::new());
        saga.status = SagaStatus::Compensating;

        let store = InMemorySagaStore::new();
        let result = driver(executor).compensate(saga, &store).await.unwrap();

        assert_eq!(result.status, SagaStatus::Compensated);
        let calls = order.lock().unwrap().clone();
        assert_eq!(calls, vec!["compensate:c", "compensate:b", "compensate:a"]);
    }

    #[tokio::test]
    async fn required_failure_stops_and_fails_saga() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let executor = Arc::new(CountingExecutor {
            calls: Arc::new(AtomicUsize::new(0)),
            order: order.clone(),
            fail_names: vec!["b".to_string()],
        });
        let steps = vec![
            completed_step(0, "a", true),
            completed_step(1, "b", true),
            completed_step(2, "c", true),
        ];
        let mut saga = Saga::new("demo", steps, DataMap::new());
        saga.status = SagaStatus::Compensating;

        let store = InMemorySagaStore::new();
        let result = driver(executor).compensate(saga, &store).await.unwrap();

        assert_eq!(result.status, SagaStatus::Failed);
        assert!(result.error_message.unwrap().contains('b'));
        // 'a' never attempted: driver stops at the first required failure.
        let calls = order.lock().unwrap().clone();
        assert_eq!(calls, vec!["compensate:c", "compensate:b"]);
    }

    #[tokio::test]
    async fn non_required_failure_continues_rollback() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let executor = Arc::new(CountingExecutor {
            calls: Arc::new(AtomicUsize::new(0)),
            order: order.clone(),
            fail_names: vec!["b".to_string()],
        });
        let steps = vec![
            completed_step(0, "a", true),
            completed_step(1, "b", false),
            completed_step(2, "c", true),
        ];
        let mut saga = Saga::new("demo", steps, DataMap::new());
        saga.status = SagaStatus::Compensating;

        let store = InMemorySagaStore::new();
        let result = driver(executor).compensate(saga, &store).await.unwrap();

        assert_eq!(result.status, SagaStatus::Compensated);
        assert_eq!(result.steps[1].status, StepStatus::Failed);
        assert_eq!(result.steps[0].status, StepStatus::Compensated);
    }
}
