//! The `BUSINESS_LOGIC` step: invokes a named in-process handler registered
//! by the host program at startup. Unlike the other built-in executors this
//! one carries no external dependency of its own — it only dispatches.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;

use super::StepExecutor;
use crate::models::{DataMap, Step, StepResult};

/// A single named handler a host program registers for `BUSINESS_LOGIC`
/// steps. The handler key is looked up from `step.config`'s `method_name`
/// (falling back to `class_name` for compatibility with configs authored
/// against the source system's naming).
#[async_trait]
pub trait BusinessLogicHandler: Send + Sync {
    async fn handle(&self, properties: &DataMap, saga_input: &DataMap) -> Result<DataMap, String>;
}

pub struct BusinessLogicExecutor {
    handlers: DashMap<String, Arc<dyn BusinessLogicHandler>>,
}

impl BusinessLogicExecutor {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn BusinessLogicHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    fn handler_key(step: &Step) -> Option<&str> {
        step.config
            .get_str("method_name")
            .or_else(|| step.config.get_str("class_name"))
    }
}

impl Default for BusinessLogicExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for BusinessLogicExecutor {
    async fn execute(&self, step: &Step, saga_input: &DataMap) -> StepResult {
        let start = Instant::now();

        let Some(key) = Self::handler_key(step) else {
            return StepResult::failure(
                "missing 'method_name' (or 'class_name') in step config",
                start.elapsed().as_millis() as u64,
            );
        };

        let Some(handler) = self.handlers.get(key).map(|entry| entry.value().clone()) else {
            return StepResult::failure(
                format!("no business logic handler registered for '{key}'"),
                start.elapsed().as_millis() as u64,
            );
        };

        let properties = step
            .config
            .fields
            .get("properties")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();

        let invocation = handler.handle(&properties, saga_input);
        let outcome = if step.timeout_ms > 0 {
            tokio::time::timeout(std::time::Duration::from_millis(step.timeout_ms), invocation)
                .await
                .map_err(|_| format!("handler '{key}' exceeded {}ms", step.timeout_ms))
                .and_then(|inner| inner)
        } else {
            invocation.await
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(output) => StepResult::success(output, duration_ms),
            Err(reason) => StepResult::failure(reason, duration_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StepConfig, StepType};

    struct Echo;

    #[async_trait]
    impl BusinessLogicHandler for Echo {
        async fn handle(&self, properties: &DataMap, _saga_input: &DataMap) -> Result<DataMap, String> {
            Ok(properties.clone())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl BusinessLogicHandler for AlwaysFails {
        async fn handle(&self, _properties: &DataMap, _saga_input: &DataMap) -> Result<DataMap, String> {
            Err("business rule rejected".into())
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_handler_by_method_name() {
        let executor = BusinessLogicExecutor::new();
        executor.register("ApplyDiscount", Arc::new(Echo));

        let mut props = serde_json::Map::new();
        props.insert("percent".into(), serde_json::json!(10));
        let step = Step::new(
            0,
            "discount",
            StepType::BusinessLogic,
            StepConfig::new()
                .with("method_name", "ApplyDiscount")
                .with("properties", serde_json::Value::Object(props)),
        );

        let result = executor.execute(&step, &DataMap::new()).await;
        assert!(result.success);
        assert_eq!(result.output.get("percent"), Some(&serde_json::json!(10)));
    }

    #[tokio::test]
    async fn unregistered_handler_fails() {
        let executor = BusinessLogicExecutor::new();
        let step = Step::new(
            0,
            "unknown",
            StepType::BusinessLogic,
            StepConfig::new().with("method_name", "DoesNotExist"),
        );
        let result = executor.execute(&step, &DataMap::new()).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn handler_error_surfaces_as_failure() {
        let executor = BusinessLogicExecutor::new();
        executor.register("Reject", Arc::new(AlwaysFails));
        let step = Step::new(
            0,
            "reject",
            StepType::BusinessLogic,
            StepConfig::new().with("method_name", "Reject"),
        );
        let result = executor.execute(&step, &DataMap::new()).await;
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("business rule rejected"));
    }
}
