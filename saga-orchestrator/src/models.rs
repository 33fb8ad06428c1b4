//! Core data model: sagas, steps, and the enums that drive the state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use uuid::Uuid;

/// Lifecycle status of a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    Created,
    Running,
    Retrying,
    Paused,
    Compensating,
    Completed,
    Failed,
    Compensated,
    Timeout,
}

impl SagaStatus {
    /// Terminal statuses are immutable except via administrative retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed
                | SagaStatus::Failed
                | SagaStatus::Compensated
                | SagaStatus::Timeout
        )
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SagaStatus::Created => "CREATED",
            SagaStatus::Running => "RUNNING",
            SagaStatus::Retrying => "RETRYING",
            SagaStatus::Paused => "PAUSED",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Failed => "FAILED",
            SagaStatus::Compensated => "COMPENSATED",
            SagaStatus::Timeout => "TIMEOUT",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle status of a single step within a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Created,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
    Timeout,
    Retrying,
    Skipped,
}

/// The kind of side effect a step performs.
///
/// Only `Http`, `Database`, `BusinessLogic`, and `Wait` have a built-in
/// executor; the remainder are reserved and resolve to
/// `UNSUPPORTED_STEP_TYPE` unless a host program registers its own handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    HttpCall,
    DatabaseOp,
    BusinessLogic,
    MessageQueue,
    FileOp,
    Wait,
    Conditional,
    Parallel,
    SubSaga,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

pub type DataMap = Map<String, Value>;

/// Type-specific configuration for executing (or compensating) a step.
///
/// Kept as an opaque JSON object at the engine boundary — adapters are
/// responsible for interpreting the fields relevant to their `StepType`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(flatten)]
    pub fields: DataMap,
}

impl StepConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(Value::as_u64)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Compensation-specific configuration: the compensation's own execution
/// config plus the policy governing how its failure is handled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationConfig {
    pub compensation_type: StepType,
    pub config: StepConfig,
    pub required: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// A single unit of forward work inside a saga.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: Uuid,
    pub name: String,
    pub order: usize,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub status: StepStatus,
    pub config: StepConfig,
    pub compensation_config: Option<CompensationConfig>,
    pub input_data: DataMap,
    pub output_data: DataMap,
    pub error_message: Option<String>,
    pub error_trace: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub required: bool,
    pub compensatable: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl Step {
    pub fn new(order: usize, name: impl Into<String>, step_type: StepType, config: StepConfig) -> Self {
        Self {
            step_id: Uuid::new_v4(),
            name: name.into(),
            order,
            step_type,
            status: StepStatus::Created,
            config,
            compensation_config: None,
            input_data: DataMap::new(),
            output_data: DataMap::new(),
            error_message: None,
            error_trace: None,
            retry_count: 0,
            max_retries: 3,
            timeout_ms: 30_000,
            retry_delay_ms: 1_000,
            required: true,
            compensatable: true,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    pub fn with_compensation(mut self, compensation: CompensationConfig) -> Self {
        self.compensation_config = Some(compensation);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn compensatable(mut self, compensatable: bool) -> Self {
        self.compensatable = compensatable;
        self
    }

    pub fn is_compensation_candidate(&self) -> bool {
        self.status == StepStatus::Completed
            && self.compensatable
            && self.compensation_config.is_some()
    }
}

/// The aggregate: an ordered sequence of steps executed as a single logical
/// transaction, with compensating rollback on terminal failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Saga {
    pub saga_id: Uuid,
    pub name: String,
    pub correlation_id: Option<String>,
    pub status: SagaStatus,
    pub steps: Vec<Step>,
    pub current_step_index: usize,
    pub input_data: DataMap,
    pub output_data: DataMap,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub error_message: Option<String>,
    pub error_trace: Option<String>,
    pub metadata: DataMap,
    pub tags: HashSet<String>,
}

impl Saga {
    pub fn new(name: impl Into<String>, steps: Vec<Step>, input_data: DataMap) -> Self {
        let now = Utc::now();
        Self {
            saga_id: Uuid::new_v4(),
            name: name.into(),
            correlation_id: None,
            status: SagaStatus::Created,
            steps,
            current_step_index: 0,
            input_data,
            output_data: DataMap::new(),
            retry_count: 0,
            max_retries: 3,
            timeout_ms: 30_000,
            priority: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            version: 0,
            error_message: None,
            error_trace: None,
            metadata: DataMap::new(),
            tags: HashSet::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.steps.get(self.current_step_index)
    }

    pub fn current_step_mut(&mut self) -> Option<&mut Step> {
        self.steps.get_mut(self.current_step_index)
    }

    /// Wall-clock budget exhausted, per the saga-level `timeout_ms` contract.
    /// `timeout_ms == 0` means unbounded.
    pub fn is_wall_clock_exhausted(&self, now: DateTime<Utc>) -> bool {
        if self.timeout_ms == 0 {
            return false;
        }
        match self.started_at {
            Some(started_at) => {
                let elapsed = (now - started_at).num_milliseconds().max(0) as u64;
                elapsed >= self.timeout_ms
            }
            None => false,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Steps eligible for compensation, in reverse execution order.
    pub fn compensation_candidates(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .steps
            .iter()
            .enumerate()
            .filter(|(_, step)| step.is_compensation_candidate())
            .map(|(idx, _)| idx)
            .collect();
        indices.sort_unstable_by(|a, b| b.cmp(a));
        indices
    }
}

/// The outcome of a single `StepExecutor::execute` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub output: DataMap,
    pub error_message: Option<String>,
    pub error_trace: Option<String>,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn success(output: DataMap, duration_ms: u64) -> Self {
        Self {
            success: true,
            output,
            error_message: None,
            error_trace: None,
            duration_ms,
        }
    }

    pub fn failure(message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            output: DataMap::new(),
            error_message: Some(message.into()),
            error_trace: None,
            duration_ms,
        }
    }
}
