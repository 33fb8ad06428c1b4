//! Bounded worker pools for the three resource groups described in §5:
//! saga dispatch, step execution, and compensation. Each pool is a
//! `tokio::sync::Semaphore` sized to `max` concurrent permits; when none are
//! immediately available the submitter runs the task inline instead of
//! queueing behind it — the `CallerRunsPolicy` rejection strategy, which
//! backpressures the producer instead of piling up unbounded work.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub core: usize,
    pub max: usize,
    pub queue: usize,
}

impl PoolConfig {
    pub fn new(core: usize, max: usize, queue: usize) -> Self {
        Self { core, max, queue }
    }
}

/// A named, bounded pool of concurrent permits. `dispatch` either acquires a
/// permit and runs the future under it, or — if the pool is saturated — runs
/// it on the calling task without a permit, exactly as the source's
/// caller-runs rejection policy would.
pub struct WorkerPool {
    name: &'static str,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    dispatched: AtomicU64,
    caller_ran: AtomicU64,
}

impl WorkerPool {
    pub fn new(name: &'static str, config: PoolConfig) -> Self {
        Self {
            name,
            config,
            semaphore: Arc::new(Semaphore::new(config.max)),
            dispatched: AtomicU64::new(0),
            caller_ran: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    /// Permits currently in use, for dashboard/metrics reporting.
    pub fn in_flight(&self) -> usize {
        self.config.max - self.semaphore.available_permits()
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            name: self.name,
            in_flight: self.in_flight(),
            max: self.config.max,
            dispatched: self.dispatched.load(Ordering::Relaxed),
            caller_ran: self.caller_ran.load(Ordering::Relaxed),
        }
    }

    /// Runs `task` under a permit if one is immediately available, otherwise
    /// runs it inline on the calling task. Never blocks waiting for a permit.
    pub async fn dispatch<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
                let result = task.await;
                drop(permit);
                result
            }
            Err(_) => {
                self.caller_ran.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(pool = self.name, "pool saturated, running inline");
                task.await
            }
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct WorkerPoolStats {
    pub name: &'static str,
    pub in_flight: usize,
    pub max: usize,
    pub dispatched: u64,
    pub caller_ran: u64,
}

/// The three named pools of §5, sized from configuration at startup.
pub struct WorkerPools {
    pub saga_exec: WorkerPool,
    pub step_exec: WorkerPool,
    pub compensation: WorkerPool,
}

impl WorkerPools {
    pub fn new(saga_exec: PoolConfig, step_exec: PoolConfig, compensation: PoolConfig) -> Self {
        Self {
            saga_exec: WorkerPool::new("saga-exec", saga_exec),
            step_exec: WorkerPool::new("step-exec", step_exec),
            compensation: WorkerPool::new("compensation", compensation),
        }
    }

    pub fn stats(&self) -> Vec<WorkerPoolStats> {
        vec![
            self.saga_exec.stats(),
            self.step_exec.stats(),
            self.compensation.stats(),
        ]
    }
}

impl Default for WorkerPools {
    fn default() -> Self {
        Self::new(
            PoolConfig::new(50, 200, 2000),
            PoolConfig::new(100, 400, 2000),
            PoolConfig::new(10, 50, 200),
        )
    }
}
