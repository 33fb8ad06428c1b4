//! The `WAIT` step: sleeps `delay_ms` and always succeeds unless cancelled.

use async_trait::async_trait;
use std::time::Instant;

use super::StepExecutor;
use crate::models::{DataMap, Step, StepResult};

pub struct WaitExecutor;

#[async_trait]
impl StepExecutor for WaitExecutor {
    async fn execute(&self, step: &Step, _saga_input: &DataMap) -> StepResult {
        let delay_ms = step.config.get_u64("delay_ms").unwrap_or(0);
        let start = Instant::now();
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        StepResult::success(DataMap::new(), start.elapsed().as_millis() as u64)
    }
}
