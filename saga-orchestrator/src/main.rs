use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use saga_circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use saga_orchestrator::api::{self, ApiState};
use saga_orchestrator::compensation::CompensationDriver;
use saga_orchestrator::config::AppConfig;
use saga_orchestrator::events::EventBus;
use saga_orchestrator::executors::StepExecutorRegistry;
use saga_orchestrator::metrics::Metrics;
use saga_orchestrator::pool::{PoolConfig, WorkerPools};
use saga_orchestrator::rate_limiter::{RateLimiter, RateLimiterConfig};
use saga_orchestrator::scheduler::{Scheduler, SchedulerConfig};
use saga_orchestrator::store::SagaStore;
use saga_orchestrator::{ExecutionEngine, Orchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!("saga_orchestrator={}", config.tracing.level))
            }),
        )
        .with(if config.tracing.json {
            tracing_subscriber::fmt::layer().json().boxed()
        } else {
            tracing_subscriber::fmt::layer().boxed()
        })
        .init();

    info!("starting saga orchestrator");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| anyhow::anyhow!("failed to install Prometheus recorder: {err}"))?;

    let store: Arc<dyn SagaStore> = build_store(&config).await?;
    info!("saga store ready");

    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: config.circuit_breaker.failure_threshold as u64,
        success_threshold: config.circuit_breaker.success_threshold as u64,
        cooldown: std::time::Duration::from_secs(config.circuit_breaker.cooldown_secs),
        request_timeout: std::time::Duration::from_millis(config.execution.timeout_ms),
    }));

    let event_bus = Arc::new(EventBus::default());
    let metrics = Arc::new(Metrics::new());

    let http_client = reqwest::Client::new();
    let registry = Arc::new(StepExecutorRegistry::with_defaults(http_client, breakers, metrics.clone()));

    let pools = Arc::new(WorkerPools::new(
        PoolConfig::new(
            config.pools.saga_exec.core,
            config.pools.saga_exec.max,
            config.pools.saga_exec.queue,
        ),
        PoolConfig::new(
            config.pools.step_exec.core,
            config.pools.step_exec.max,
            config.pools.step_exec.queue,
        ),
        PoolConfig::new(
            config.pools.compensation.core,
            config.pools.compensation.max,
            config.pools.compensation.queue,
        ),
    ));

    let compensation = Arc::new(CompensationDriver::new(
        registry.clone(),
        event_bus.clone(),
        metrics.clone(),
    ));
    let engine = Arc::new(ExecutionEngine::new(
        store.clone(),
        registry,
        compensation,
        event_bus.clone(),
        metrics.clone(),
        pools.clone(),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        engine.clone(),
        pools,
        event_bus,
        metrics,
    ));

    let scheduler = Scheduler::new(
        store,
        engine,
        orchestrator.event_bus().clone(),
        orchestrator.metrics().clone(),
        SchedulerConfig::default(),
    );
    let _sweep_handles = scheduler.run();
    info!("background sweeps started");

    let rate_limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
        burst_limit: config.rate_limit.burst.limit,
        burst_window: std::time::Duration::from_secs(config.rate_limit.burst.window_secs),
        minute_limit: config.rate_limit.minute.limit,
        hour_limit: config.rate_limit.hour.limit,
    }));

    let api_state = ApiState::new(
        orchestrator,
        config.server.admin_username.clone(),
        config.server.admin_password.clone(),
        prometheus_handle,
        rate_limiter,
    );
    let app = api::router(api_state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!(%addr, "saga orchestrator listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    scheduler.shutdown();
    Ok(())
}

#[cfg(feature = "postgres-store")]
async fn build_store(config: &AppConfig) -> Result<Arc<dyn SagaStore>> {
    use saga_orchestrator::store::PostgresSagaStore;
    let store = PostgresSagaStore::connect(&config.database.url, config.database.max_connections).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres-store"))]
async fn build_store(_config: &AppConfig) -> Result<Arc<dyn SagaStore>> {
    use saga_orchestrator::store::InMemorySagaStore;
    Ok(Arc::new(InMemorySagaStore::new()))
}
