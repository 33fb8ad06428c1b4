//! Periodic background sweeps: timeout detection, optional auto-retry,
//! terminal-saga cleanup, and a metrics snapshot pushed onto the event bus.
//! Each sweep is its own named `tokio::spawn`-ed task so one slow sweep
//! never blocks another, and all of them stop together on cancellation.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::engine::ExecutionEngine;
use crate::events::{EventBus, SagaEvent};
use crate::metrics::Metrics;
use crate::models::SagaStatus;
use crate::store::SagaStore;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub timeout_sweep_interval: Duration,
    pub retry_sweep_interval: Duration,
    pub cleanup_sweep_interval: Duration,
    pub metrics_sweep_interval: Duration,
    pub retention: Duration,
    /// Whether `FindRetryable` sagas are automatically re-queued. Disabled
    /// by default — auto-retry without an operator in the loop can mask a
    /// persistently failing downstream dependency.
    pub auto_retry_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timeout_sweep_interval: Duration::from_secs(10),
            retry_sweep_interval: Duration::from_secs(60),
            cleanup_sweep_interval: Duration::from_secs(3600),
            metrics_sweep_interval: Duration::from_secs(5),
            retention: Duration::from_secs(7 * 24 * 3600),
            auto_retry_enabled: false,
        }
    }
}

/// Owns the scheduler's named periodic jobs. `run` spawns them all and
/// returns their handles; dropping the returned `CancellationToken` guard
/// (or calling `cancel()`) stops every sweep at its next tick boundary.
pub struct Scheduler {
    store: Arc<dyn SagaStore>,
    engine: Arc<ExecutionEngine>,
    event_bus: Arc<EventBus>,
    metrics: Arc<Metrics>,
    config: SchedulerConfig,
    cancellation: CancellationToken,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn SagaStore>,
        engine: Arc<ExecutionEngine>,
        event_bus: Arc<EventBus>,
        metrics: Arc<Metrics>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            engine,
            event_bus,
            metrics,
            config,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn shutdown(&self) {
        self.cancellation.cancel();
    }

    /// Spawns all four sweeps and returns immediately; the sweeps run until
    /// `shutdown()` is called or the returned token is cancelled.
    pub fn run(&self) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.spawn_timeout_sweep(),
            self.spawn_retry_sweep(),
            self.spawn_cleanup_sweep(),
            self.spawn_metrics_sweep(),
        ]
    }

    fn spawn_timeout_sweep(&self) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let engine = self.engine.clone();
        let interval = self.config.timeout_sweep_interval;
        let cancellation = self.cancellation.clone();

        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = cancellation.cancelled() => {
                            info!("timeout sweep stopping");
                            return;
                        }
                        _ = ticker.tick() => {}
                    }

                    match store.find_timed_out(Utc::now()).await {
                        Ok(sagas) => {
                            for saga in sagas {
                                if let Err(err) = engine.execute(saga.saga_id).await {
                                    warn!(saga_id = %saga.saga_id, error = %err, "timeout sweep failed to finalize saga");
                                }
                            }
                        }
                        Err(err) => warn!(error = %err, "timeout sweep query failed"),
                    }
                }
            }
            .instrument(info_span!("scheduler.sweep", name = "timeout")),
        )
    }

    fn spawn_retry_sweep(&self) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let engine = self.engine.clone();
        let interval = self.config.retry_sweep_interval;
        let auto_retry_enabled = self.config.auto_retry_enabled;
        let cancellation = self.cancellation.clone();

        tokio::spawn(
            async move {
                if !auto_retry_enabled {
                    info!("auto-retry sweep disabled, exiting");
                    return;
                }
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = cancellation.cancelled() => {
                            info!("retry sweep stopping");
                            return;
                        }
                        _ = ticker.tick() => {}
                    }

                    match store.find_retryable().await {
                        Ok(sagas) => {
                            for saga in sagas {
                                if let Err(err) = engine.retry(saga.saga_id).await {
                                    warn!(saga_id = %saga.saga_id, error = %err, "auto-retry failed");
                                }
                            }
                        }
                        Err(err) => warn!(error = %err, "retry sweep query failed"),
                    }
                }
            }
            .instrument(info_span!("scheduler.sweep", name = "retry")),
        )
    }

    fn spawn_cleanup_sweep(&self) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let interval = self.config.cleanup_sweep_interval;
        let retention = self.config.retention;
        let cancellation = self.cancellation.clone();

        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = cancellation.cancelled() => {
                            info!("cleanup sweep stopping");
                            return;
                        }
                        _ = ticker.tick() => {}
                    }

                    let cutoff = Utc::now()
                        - ChronoDuration::from_std(retention).unwrap_or(ChronoDuration::zero());
                    match store.bulk_delete_older_than(cutoff).await {
                        Ok(deleted) if deleted > 0 => info!(deleted, "cleanup sweep deleted terminal sagas"),
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "cleanup sweep failed"),
                    }
                }
            }
            .instrument(info_span!("scheduler.sweep", name = "cleanup")),
        )
    }

    fn spawn_metrics_sweep(&self) -> tokio::task::JoinHandle<()> {
        let metrics = self.metrics.clone();
        let event_bus = self.event_bus.clone();
        let interval = self.config.metrics_sweep_interval;
        let cancellation = self.cancellation.clone();

        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = cancellation.cancelled() => {
                            info!("metrics sweep stopping");
                            return;
                        }
                        _ = ticker.tick() => {}
                    }

                    event_bus.publish(SagaEvent::MetricsSnapshot {
                        snapshot: metrics.snapshot(),
                        at: Utc::now(),
                    });
                }
            }
            .instrument(info_span!("scheduler.sweep", name = "metrics")),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compensation::CompensationDriver;
    use crate::executors::StepExecutorRegistry;
    use crate::models::{DataMap, Saga};
    use crate::store::memory::InMemorySagaStore;

    fn scheduler_with(config: SchedulerConfig) -> (Scheduler, Arc<InMemorySagaStore>) {
        let store = Arc::new(InMemorySagaStore::new());
        let registry = Arc::new(StepExecutorRegistry::new());
        let event_bus = Arc::new(EventBus::new(64));
        let metrics = Arc::new(Metrics::new());
        let compensation = Arc::new(CompensationDriver::new(registry.clone(), event_bus.clone(), metrics.clone()));
        let pools = Arc::new(crate::pool::WorkerPools::default());
        let engine = Arc::new(ExecutionEngine::new(
            store.clone(),
            registry,
            compensation,
            event_bus.clone(),
            metrics.clone(),
            pools,
        ));
        let scheduler = Scheduler::new(store.clone(), engine, event_bus, metrics, config);
        (scheduler, store)
    }

    #[tokio::test]
    async fn timeout_sweep_finalizes_expired_sagas() {
        let mut config = SchedulerConfig::default();
        config.timeout_sweep_interval = Duration::from_millis(10);
        let (scheduler, store) = scheduler_with(config);

        let mut saga = Saga::new("demo", vec![], DataMap::new()).with_timeout_ms(1);
        saga.status = SagaStatus::Running;
        saga.started_at = Some(Utc::now() - chrono::Duration::seconds(5));
        let saga_id = saga.saga_id;
        store.save(saga).await.unwrap();

        let handles = scheduler.run();
        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.shutdown();
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;
        }

        let found = store.find(saga_id).await.unwrap().unwrap();
        assert_eq!(found.status, SagaStatus::Timeout);
    }

    #[tokio::test]
    async fn auto_retry_disabled_by_default_leaves_failed_sagas_alone() {
        let mut config = SchedulerConfig::default();
        config.retry_sweep_interval = Duration::from_millis(10);
        assert!(!config.auto_retry_enabled);
        let (scheduler, store) = scheduler_with(config);

        let mut saga = Saga::new("demo", vec![], DataMap::new());
        saga.status = SagaStatus::Failed;
        let saga_id = saga.saga_id;
        store.save(saga).await.unwrap();

        let handles = scheduler.run();
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.shutdown();
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;
        }

        let found = store.find(saga_id).await.unwrap().unwrap();
        assert_eq!(found.status, SagaStatus::Failed);
    }
}
