//! Durable persistence contract for sagas, with optimistic concurrency by
//! version. Two implementations ship: an in-memory store for tests and
//! simple deployments, and a Postgres-backed store for production use.

pub mod memory;
#[cfg(feature = "postgres-store")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{SagaError, SagaResult};
use crate::models::{Saga, SagaStatus};

pub use memory::InMemorySagaStore;
#[cfg(feature = "postgres-store")]
pub use postgres::PostgresSagaStore;

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: u64,
    pub limit: u64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// The persistence contract the execution engine and scheduler depend on.
/// Implementations must be safe under concurrent callers and must never
/// expose a partially-written saga.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Inserts a new saga (`saga.version == 0`) or updates an existing one,
    /// requiring the stored version to match `saga.version`. Returns the
    /// stored record with its version incremented.
    async fn save(&self, saga: Saga) -> SagaResult<Saga>;

    async fn find(&self, saga_id: uuid::Uuid) -> SagaResult<Option<Saga>>;

    async fn find_by_status(&self, status: SagaStatus, page: Page) -> SagaResult<Vec<Saga>>;

    async fn find_by_correlation(&self, correlation_id: &str) -> SagaResult<Vec<Saga>>;

    /// Sagas in `RUNNING`/`RETRYING` whose wall-clock budget has elapsed.
    async fn find_timed_out(&self, now: DateTime<Utc>) -> SagaResult<Vec<Saga>>;

    /// `FAILED` sagas with `retry_count < max_retries`.
    async fn find_retryable(&self) -> SagaResult<Vec<Saga>>;

    async fn bulk_update_status(
        &self,
        ids: &[uuid::Uuid],
        new_status: SagaStatus,
    ) -> SagaResult<u64>;

    async fn bulk_delete_older_than(&self, cutoff: DateTime<Utc>) -> SagaResult<u64>;
}

/// Persists a saga transition, reloading and re-applying `apply` whenever
/// the write loses a version race (§5: "conflicts cause the engine to
/// reload and re-apply its transition"; §7: `STALE_VERSION` is retried by
/// the engine, never surfaced to a caller).
///
/// `apply` must derive the target state purely from the `&mut Saga` it's
/// given rather than from anything closed over, and must return `false`
/// when its precondition no longer holds (e.g. the saga already left the
/// status it expected) so a concurrent winner's transition isn't clobbered.
/// The returned `bool` reports whether this call actually performed the
/// transition — `false` means a reload observed the precondition already
/// satisfied by someone else, and the saga is returned as found.
pub async fn save_transition<F>(
    store: &dyn SagaStore,
    mut saga: Saga,
    apply: F,
) -> SagaResult<(Saga, bool)>
where
    F: Fn(&mut Saga) -> bool,
{
    if !apply(&mut saga) {
        return Ok((saga, false));
    }

    loop {
        match store.save(saga).await {
            Ok(saved) => return Ok((saved, true)),
            Err(SagaError::StaleVersion { saga_id, .. }) => {
                tracing::warn!(saga_id = %saga_id, "stale version on save, reloading and re-applying transition");
                let Some(mut reloaded) = store.find(saga_id).await? else {
                    return Err(SagaError::NotFound { saga_id });
                };
                if !apply(&mut reloaded) {
                    return Ok((reloaded, false));
                }
                saga = reloaded;
            }
            Err(err) => return Err(err),
        }
    }
}
