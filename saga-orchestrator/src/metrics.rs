//! Lock-free counters for saga/step/breaker/rate-limit activity, mirrored
//! into the global `metrics` registry for Prometheus scraping.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::StepType;

#[derive(Debug, Default)]
struct StepTypeCounters {
    executions: AtomicU64,
    failures: AtomicU64,
    /// Bits of an f64 moving average, stored atomically so reads never tear.
    avg_duration_ms_bits: AtomicU64,
}

impl StepTypeCounters {
    fn record(&self, duration_ms: u64, success: bool) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        loop {
            let current_bits = self.avg_duration_ms_bits.load(Ordering::Relaxed);
            let current = f64::from_bits(current_bits);
            let updated = if current == 0.0 {
                duration_ms as f64
            } else {
                (current + duration_ms as f64) / 2.0
            };
            if self
                .avg_duration_ms_bits
                .compare_exchange_weak(
                    current_bits,
                    updated.to_bits(),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }
    }

    fn avg_duration_ms(&self) -> f64 {
        f64::from_bits(self.avg_duration_ms_bits.load(Ordering::Relaxed))
    }
}

/// Process-wide counters for the saga engine. Intended to be constructed
/// once and shared behind an `Arc`.
#[derive(Default)]
pub struct Metrics {
    sagas_total: AtomicU64,
    sagas_successful: AtomicU64,
    sagas_failed: AtomicU64,
    sagas_compensated: AtomicU64,
    sagas_timed_out: AtomicU64,

    steps_total: AtomicU64,
    steps_successful: AtomicU64,
    steps_failed: AtomicU64,
    steps_retried: AtomicU64,

    per_step_type: DashMap<StepType, StepTypeCounters>,
    breaker_trips: DashMap<String, AtomicU64>,
    breaker_resets: DashMap<String, AtomicU64>,
    rate_limit_exceeded: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saga_started(&self) {
        self.sagas_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("saga_started_total").increment(1);
    }

    pub fn saga_completed(&self) {
        self.sagas_successful.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("saga_completed_total").increment(1);
    }

    pub fn saga_failed(&self) {
        self.sagas_failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("saga_failed_total").increment(1);
    }

    pub fn saga_compensated(&self) {
        self.sagas_compensated.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("saga_compensated_total").increment(1);
    }

    pub fn saga_timed_out(&self) {
        self.sagas_timed_out.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("saga_timed_out_total").increment(1);
    }

    pub fn step_retried(&self) {
        self.steps_retried.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("saga_step_retried_total").increment(1);
    }

    pub fn step_executed(&self, step_type: StepType, duration_ms: u64, success: bool) {
        self.steps_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.steps_successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.steps_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.per_step_type
            .entry(step_type)
            .or_default()
            .record(duration_ms, success);

        let label = format!("{step_type}");
        metrics::histogram!("saga_step_duration_ms", "step_type" => label)
            .record(duration_ms as f64);
    }

    pub fn breaker_tripped(&self, service: &str) {
        self.breaker_trips
            .entry(service.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        metrics::counter!("saga_circuit_breaker_trips_total", "service" => service.to_string())
            .increment(1);
    }

    pub fn breaker_reset(&self, service: &str) {
        self.breaker_resets
            .entry(service.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_limited(&self) {
        self.rate_limit_exceeded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("saga_rate_limited_total").increment(1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let sagas_total = self.sagas_total.load(Ordering::Relaxed);
        let sagas_successful = self.sagas_successful.load(Ordering::Relaxed);

        let per_step_type = self
            .per_step_type
            .iter()
            .map(|entry| {
                let counters = entry.value();
                (
                    format!("{}", entry.key()),
                    StepTypeSnapshot {
                        executions: counters.executions.load(Ordering::Relaxed),
                        failures: counters.failures.load(Ordering::Relaxed),
                        avg_duration_ms: counters.avg_duration_ms(),
                    },
                )
            })
            .collect();

        let breaker_trips = self
            .breaker_trips
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        let breaker_resets = self
            .breaker_resets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();

        MetricsSnapshot {
            sagas_total,
            sagas_successful,
            sagas_failed: self.sagas_failed.load(Ordering::Relaxed),
            sagas_compensated: self.sagas_compensated.load(Ordering::Relaxed),
            sagas_timed_out: self.sagas_timed_out.load(Ordering::Relaxed),
            saga_success_rate_pct: if sagas_total == 0 {
                0.0
            } else {
                (sagas_successful as f64 / sagas_total as f64) * 100.0
            },
            steps_total: self.steps_total.load(Ordering::Relaxed),
            steps_successful: self.steps_successful.load(Ordering::Relaxed),
            steps_failed: self.steps_failed.load(Ordering::Relaxed),
            steps_retried: self.steps_retried.load(Ordering::Relaxed),
            per_step_type,
            breaker_trips,
            breaker_resets,
            rate_limit_exceeded: self.rate_limit_exceeded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTypeSnapshot {
    pub executions: u64,
    pub failures: u64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub sagas_total: u64,
    pub sagas_successful: u64,
    pub sagas_failed: u64,
    pub sagas_compensated: u64,
    pub sagas_timed_out: u64,
    pub saga_success_rate_pct: f64,
    pub steps_total: u64,
    pub steps_successful: u64,
    pub steps_failed: u64,
    pub steps_retried: u64,
    pub per_step_type: std::collections::HashMap<String, StepTypeSnapshot>,
    /// Breaker trip/reset counts keyed by service identity (§4.4).
    pub breaker_trips: std::collections::HashMap<String, u64>,
    pub breaker_resets: std::collections::HashMap<String, u64>,
    pub rate_limit_exceeded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_derives_success_rate() {
        let metrics = Metrics::new();
        metrics.saga_started();
        metrics.saga_started();
        metrics.saga_completed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sagas_total, 2);
        assert_eq!(snapshot.saga_success_rate_pct, 50.0);
    }

    #[test]
    fn ema_moves_toward_latest_observation() {
        let metrics = Metrics::new();
        metrics.step_executed(StepType::Wait, 100, true);
        metrics.step_executed(StepType::Wait, 300, true);

        let snapshot = metrics.snapshot();
        let wait = &snapshot.per_step_type["Wait"];
        assert_eq!(wait.avg_duration_ms, 200.0);
    }

    #[test]
    fn empty_metrics_report_zero_success_rate() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot().saga_success_rate_pct, 0.0);
    }

    #[test]
    fn breaker_trips_and_resets_are_tracked_per_service() {
        let metrics = Metrics::new();
        metrics.breaker_tripped("payments.svc");
        metrics.breaker_tripped("payments.svc");
        metrics.breaker_reset("payments.svc");
        metrics.breaker_tripped("shipping.svc");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.breaker_trips["payments.svc"], 2);
        assert_eq!(snapshot.breaker_resets["payments.svc"], 1);
        assert_eq!(snapshot.breaker_trips["shipping.svc"], 1);
        assert!(!snapshot.breaker_resets.contains_key("shipping.svc"));
    }
}
