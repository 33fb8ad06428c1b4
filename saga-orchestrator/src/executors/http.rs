//! The `HTTP_CALL` step: executes an HTTP request, guarded by a per-host
//! circuit breaker.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

use saga_circuit_breaker::{CallError, CircuitBreakerRegistry, CircuitState};

use super::StepExecutor;
use crate::metrics::Metrics;
use crate::models::{DataMap, Step, StepResult};

/// Service identity for the circuit breaker is the URL's host, per the
/// component design's `§4.5` contract.
fn service_identity(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

pub struct HttpExecutor {
    client: reqwest::Client,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<Metrics>,
}

impl HttpExecutor {
    pub fn new(client: reqwest::Client, breakers: Arc<CircuitBreakerRegistry>, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            breakers,
            metrics,
        }
    }

    fn expected_status_codes(step: &Step) -> Vec<u16> {
        step.config
            .fields
            .get("expected_status_codes")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_u64()).map(|v| v as u16).collect())
            .unwrap_or_default()
    }

    fn is_success_status(status: u16, expected: &[u16]) -> bool {
        if expected.is_empty() {
            (200..300).contains(&status)
        } else {
            expected.contains(&status)
        }
    }

    fn render_body(step: &Step, saga_input: &DataMap) -> Option<serde_json::Value> {
        let template = step.config.fields.get("request_body_template")?;
        // The template is substituted with saga input values for any string
        // field of the form "{{key}}"; anything else passes through as-is.
        Some(substitute(template, saga_input))
    }
}

fn substitute(value: &serde_json::Value, context: &DataMap) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => {
            if let Some(key) = s.strip_prefix("{{").and_then(|s| s.strip_suffix("}}")) {
                context
                    .get(key.trim())
                    .cloned()
                    .unwrap_or_else(|| serde_json::Value::String(s.clone()))
            } else {
                serde_json::Value::String(s.clone())
            }
        }
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), substitute(v, context));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(|v| substitute(v, context)).collect())
        }
        other => other.clone(),
    }
}

#[async_trait]
impl StepExecutor for HttpExecutor {
    async fn execute(&self, step: &Step, saga_input: &DataMap) -> StepResult {
        let start = Instant::now();

        let Some(url) = step.config.get_str("url") else {
            return StepResult::failure("missing 'url' in step config", start.elapsed().as_millis() as u64);
        };
        let method = step
            .config
            .get_str("http_method")
            .unwrap_or("GET")
            .to_uppercase();
        let expected = Self::expected_status_codes(step);
        let service = service_identity(url);
        let breaker = self.breakers.get_or_create(&service).await;

        let request = {
            let method = reqwest::Method::from_bytes(method.as_bytes())
                .unwrap_or(reqwest::Method::GET);
            let mut builder = self.client.request(method, url);

            if let Some(headers) = step.config.fields.get("headers").and_then(|v| v.as_object()) {
                for (key, value) in headers {
                    if let Some(value) = value.as_str() {
                        builder = builder.header(key, value);
                    }
                }
            }
            if let Some(body) = Self::render_body(step, saga_input) {
                builder = builder.json(&body);
            }
            if step.timeout_ms > 0 {
                builder = builder.timeout(std::time::Duration::from_millis(step.timeout_ms));
            }
            builder
        };

        let state_before = breaker.state().await;
        let result = breaker.call(request.send()).await;
        let state_after = breaker.state().await;
        // The breaker's own Closed/Open/HalfOpen transitions aren't observable
        // from outside saga_circuit_breaker, so trip/reset are inferred here
        // from the before/after snapshot around the call (§4.4 per-service
        // breaker trip and reset counts).
        if state_after == CircuitState::Open && state_before != CircuitState::Open {
            self.metrics.breaker_tripped(&service);
        } else if state_after == CircuitState::Closed && state_before != CircuitState::Closed {
            self.metrics.breaker_reset(&service);
        }
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                if !Self::is_success_status(status, &expected) {
                    return StepResult::failure(
                        format!("unexpected status code {status}"),
                        duration_ms,
                    );
                }
                let output = match response.json::<serde_json::Value>().await {
                    Ok(serde_json::Value::Object(map)) => map,
                    _ => DataMap::new(),
                };
                StepResult::success(output, duration_ms)
            }
            Err(CallError::CircuitOpen(err)) => StepResult::failure(err.to_string(), duration_ms),
            Err(CallError::Timeout) => {
                StepResult::failure(format!("request to '{url}' timed out"), duration_ms)
            }
            Err(CallError::Operation(err)) => StepResult::failure(err.to_string(), duration_ms),
        }
    }
}
