//! `BUSINESS_LOGIC` step dispatch against a `mockall`-generated handler,
//! covering the `method_name` / `class_name` fallback lookup and per-step
//! timeout enforcement.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;
use saga_orchestrator::executors::business_logic::BusinessLogicHandler;
use saga_orchestrator::executors::{BusinessLogicExecutor, StepExecutor};
use saga_orchestrator::models::{DataMap, Step, StepConfig, StepType};

mock! {
    Handler {}

    #[async_trait]
    impl BusinessLogicHandler for Handler {
        async fn handle(&self, properties: &DataMap, saga_input: &DataMap) -> Result<DataMap, String>;
    }
}

#[tokio::test]
async fn dispatches_using_class_name_when_method_name_is_absent() {
    let mut handler = MockHandler::new();
    handler
        .expect_handle()
        .times(1)
        .returning(|properties, _saga_input| Ok(properties.clone()));

    let executor = BusinessLogicExecutor::new();
    executor.register("LegacyDiscountRule", Arc::new(handler));

    let mut props = serde_json::Map::new();
    props.insert("percent".into(), serde_json::json!(15));
    let step = Step::new(
        0,
        "discount",
        StepType::BusinessLogic,
        StepConfig::new()
            .with("class_name", "LegacyDiscountRule")
            .with("properties", serde_json::Value::Object(props)),
    );

    let result = executor.execute(&step, &DataMap::new()).await;

    assert!(result.success);
    assert_eq!(result.output.get("percent"), Some(&serde_json::json!(15)));
}

#[tokio::test]
async fn mocked_handler_rejection_surfaces_as_step_failure() {
    let mut handler = MockHandler::new();
    handler
        .expect_handle()
        .times(1)
        .returning(|_, _| Err("business rule rejected".to_string()));

    let executor = BusinessLogicExecutor::new();
    executor.register("RejectRule", Arc::new(handler));
    let step = Step::new(
        0,
        "reject",
        StepType::BusinessLogic,
        StepConfig::new().with("method_name", "RejectRule"),
    );

    let result = executor.execute(&step, &DataMap::new()).await;

    assert!(!result.success);
    assert_eq!(result.error_message.as_deref(), Some("business rule rejected"));
}

struct SlowHandler;

#[async_trait]
impl BusinessLogicHandler for SlowHandler {
    async fn handle(&self, _properties: &DataMap, _saga_input: &DataMap) -> Result<DataMap, String> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(DataMap::new())
    }
}

#[tokio::test]
async fn handler_exceeding_its_timeout_fails_the_step() {
    let executor = BusinessLogicExecutor::new();
    executor.register("SlowRule", Arc::new(SlowHandler));

    let step = Step::new(
        0,
        "slow",
        StepType::BusinessLogic,
        StepConfig::new().with("method_name", "SlowRule"),
    )
    .with_timeout(5);

    let result = executor.execute(&step, &DataMap::new()).await;

    assert!(!result.success);
    assert!(result.error_message.unwrap().contains("exceeded"));
}
