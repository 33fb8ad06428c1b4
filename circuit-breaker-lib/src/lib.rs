//! Per-service circuit breaker guarding calls to external dependencies.
//!
//! One [`CircuitBreaker`] tracks the health of a single external service
//! identity (a URL host, a database DSN label, or any caller-supplied name).
//! It transitions `Closed -> Open -> HalfOpen -> Closed` based on consecutive
//! failure and success counts, so that a failing dependency stops being
//! hammered while it recovers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u64,
    pub success_threshold: u64,
    pub cooldown: Duration,
    pub request_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            cooldown: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    failure_count: u64,
    success_count: u64,
    last_failure_at: Option<Instant>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitOpenError {
    pub service: String,
}

impl std::fmt::Display for CircuitOpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "circuit open for service '{}'", self.service)
    }
}

impl std::error::Error for CircuitOpenError {}

/// Guards calls to a single external service identity.
///
/// Transitions are serialized behind a single `RwLock`, which acts as the
/// compare-and-set point referenced by the design: a writer observes the
/// current state and decides the next one atomically with respect to other
/// callers.
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    state: Arc<RwLock<State>>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let service = service.into();
        info!(service = %service, "creating circuit breaker");
        Self {
            service,
            config,
            state: Arc::new(RwLock::new(State::default())),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns whether a call may currently proceed, performing the
    /// `Open -> HalfOpen` transition as a side effect when the cooldown has
    /// elapsed.
    pub async fn allow(&self) -> Result<(), CircuitOpenError> {
        let mut state = self.state.write().await;
        match state.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed_enough = state
                    .last_failure_at
                    .map(|t| t.elapsed() >= self.config.cooldown)
                    .unwrap_or(false);
                if elapsed_enough {
                    info!(service = %self.service, "circuit half-open");
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        service: self.service.clone(),
                    })
                }
            }
        }
    }

    /// Runs `operation`, guarded by the breaker state and bounded by
    /// `request_timeout`. Returns [`CircuitOpenError`] without invoking the
    /// closure if the circuit currently rejects calls.
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CallError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        self.allow().await.map_err(CallError::CircuitOpen)?;

        match tokio::time::timeout(self.config.request_timeout, operation).await {
            Ok(Ok(value)) => {
                self.on_success().await;
                Ok(value)
            }
            Ok(Err(err)) => {
                self.on_failure().await;
                Err(CallError::Operation(err))
            }
            Err(_) => {
                self.on_failure().await;
                Err(CallError::Timeout)
            }
        }
    }

    pub async fn on_success(&self) {
        let mut state = self.state.write().await;
        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    info!(service = %self.service, "circuit closed (recovered)");
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.last_failure_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn on_failure(&self) {
        let mut state = self.state.write().await;
        state.last_failure_at = Some(Instant::now());
        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    warn!(service = %self.service, "circuit open (failure threshold reached)");
                    state.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!(service = %self.service, "circuit re-opened (half-open probe failed)");
                state.state = CircuitState::Open;
                state.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }

    pub async fn snapshot(&self) -> CircuitBreakerSnapshot {
        let state = self.state.read().await;
        CircuitBreakerSnapshot {
            service: self.service.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
        }
    }

    /// Administrative reset: forces `Closed` and zeroes counters.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        info!(service = %self.service, "circuit breaker reset");
        *state = State::default();
    }

    pub async fn force_open(&self) {
        let mut state = self.state.write().await;
        warn!(service = %self.service, "circuit breaker forced open");
        state.state = CircuitState::Open;
        state.last_failure_at = Some(Instant::now());
    }
}

#[derive(Debug)]
pub enum CallError<E> {
    CircuitOpen(CircuitOpenError),
    Timeout,
    Operation(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::CircuitOpen(e) => write!(f, "{e}"),
            CallError::Timeout => write!(f, "operation timed out"),
            CallError::Operation(e) => write!(f, "{e}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u64,
    pub success_count: u64,
}

/// Keeps one breaker per service identity, created lazily on first use.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
        }
    }

    /// Returns the breaker for `service`, creating it with the registry's
    /// default config if it doesn't exist yet.
    pub async fn get_or_create(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().await.get(service) {
            return existing.clone();
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    service.to_string(),
                    self.default_config.clone(),
                ))
            })
            .clone()
    }

    pub async fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().await.get(service).cloned()
    }

    pub async fn reset(&self, service: &str) {
        if let Some(breaker) = self.get(service).await {
            breaker.reset().await;
        }
    }

    pub async fn reset_all(&self) {
        let breakers = self.breakers.read().await;
        for breaker in breakers.values() {
            breaker.reset().await;
        }
    }

    pub async fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let breakers = self.breakers.read().await;
        let mut out = Vec::with_capacity(breakers.len());
        for breaker in breakers.values() {
            out.push(breaker.snapshot().await);
        }
        out
    }
}
