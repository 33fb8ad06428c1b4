//! Step executor capability interface and the registry that dispatches by
//! `StepType`.

pub mod business_logic;
pub mod database;
pub mod http;
pub mod wait;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::metrics::Metrics;
use crate::models::{DataMap, Step, StepResult, StepType};

pub use business_logic::{BusinessLogicExecutor, BusinessLogicHandler};
pub use database::DatabaseExecutor;
pub use http::HttpExecutor;
pub use wait::WaitExecutor;

/// The single-function capability interface every step adapter implements.
/// Deliberately not an inheritance hierarchy: one method is all the engine
/// needs, and `StepType` dispatch is handled by the registry, not by the
/// trait object's own type.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, step: &Step, saga_input: &DataMap) -> StepResult;
}

/// Maps `StepType -> StepExecutor`. Built once at startup; adapters for the
/// optional step types (`MESSAGE_QUEUE`, `FILE_OP`, `CONDITIONAL`,
/// `PARALLEL`, `SUB_SAGA`) may be registered by the host program, but absent
/// registration the engine observes `UNSUPPORTED_STEP_TYPE`.
pub struct StepExecutorRegistry {
    executors: HashMap<StepType, Arc<dyn StepExecutor>>,
    business_logic: Option<Arc<BusinessLogicExecutor>>,
}

impl StepExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
            business_logic: None,
        }
    }

    /// A registry with the four required variants plus `Wait` registered
    /// using their default adapters.
    pub fn with_defaults(
        http_client: reqwest::Client,
        breakers: Arc<saga_circuit_breaker::CircuitBreakerRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(StepType::HttpCall, Arc::new(HttpExecutor::new(http_client, breakers, metrics)));
        registry.register(StepType::DatabaseOp, Arc::new(DatabaseExecutor::new()));

        let business_logic = Arc::new(BusinessLogicExecutor::new());
        registry.business_logic = Some(business_logic.clone());
        registry.register(StepType::BusinessLogic, business_logic);

        registry.register(StepType::Wait, Arc::new(WaitExecutor));
        registry
    }

    pub fn register(&mut self, step_type: StepType, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(step_type, executor);
    }

    pub fn get(&self, step_type: StepType) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(&step_type).cloned()
    }

    /// Exposes the `BusinessLogicExecutor` for host programs that want to
    /// register named in-process handlers, when the registry was built via
    /// [`Self::with_defaults`].
    pub fn business_logic(&self) -> Option<&Arc<BusinessLogicExecutor>> {
        self.business_logic.as_ref()
    }
}

impl Default for StepExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
