//! In-memory `SagaStore`, used by tests and by deployments that don't need
//! cross-restart durability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::{Page, SagaStore};
use crate::error::{SagaError, SagaResult};
use crate::models::{Saga, SagaStatus};

#[derive(Default)]
pub struct InMemorySagaStore {
    sagas: DashMap<Uuid, Saga>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn save(&self, mut saga: Saga) -> SagaResult<Saga> {
        saga.touch();
        match self.sagas.entry(saga.saga_id) {
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                if saga.version != 0 {
                    return Err(SagaError::StaleVersion {
                        saga_id: saga.saga_id,
                        expected: 0,
                        found: saga.version,
                    });
                }
                saga.version = 1;
                entry.insert(saga.clone());
                Ok(saga)
            }
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let stored_version = entry.get().version;
                if stored_version != saga.version {
                    return Err(SagaError::StaleVersion {
                        saga_id: saga.saga_id,
                        expected: stored_version,
                        found: saga.version,
                    });
                }
                saga.version += 1;
                entry.insert(saga.clone());
                Ok(saga)
            }
        }
    }

    async fn find(&self, saga_id: Uuid) -> SagaResult<Option<Saga>> {
        Ok(self.sagas.get(&saga_id).map(|entry| entry.value().clone()))
    }

    async fn find_by_status(&self, status: SagaStatus, page: Page) -> SagaResult<Vec<Saga>> {
        let mut matches: Vec<Saga> = self
            .sagas
            .iter()
            .filter(|entry| entry.value().status == status)
            .map(|entry| entry.value().clone())
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matches
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn find_by_correlation(&self, correlation_id: &str) -> SagaResult<Vec<Saga>> {
        Ok(self
            .sagas
            .iter()
            .filter(|entry| entry.value().correlation_id.as_deref() == Some(correlation_id))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn find_timed_out(&self, now: DateTime<Utc>) -> SagaResult<Vec<Saga>> {
        Ok(self
            .sagas
            .iter()
            .filter(|entry| {
                let saga = entry.value();
                matches!(saga.status, SagaStatus::Running | SagaStatus::Retrying)
                    && saga.is_wall_clock_exhausted(now)
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn find_retryable(&self) -> SagaResult<Vec<Saga>> {
        Ok(self
            .sagas
            .iter()
            .filter(|entry| {
                let saga = entry.value();
                saga.status == SagaStatus::Failed && saga.retry_count < saga.max_retries
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn bulk_update_status(&self, ids: &[Uuid], new_status: SagaStatus) -> SagaResult<u64> {
        let mut updated = 0;
        for id in ids {
            if let Some(mut entry) = self.sagas.get_mut(id) {
                entry.status = new_status;
                entry.version += 1;
                entry.touch();
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn bulk_delete_older_than(&self, cutoff: DateTime<Utc>) -> SagaResult<u64> {
        let to_delete: Vec<Uuid> = self
            .sagas
            .iter()
            .filter(|entry| {
                let saga = entry.value();
                saga.status.is_terminal() && saga.created_at < cutoff
            })
            .map(|entry| *entry.key())
            .collect();
        let count = to_delete.len() as u64;
        for id in to_delete {
            self.sagas.remove(&id);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DataMap;

    #[tokio::test]
    async fn save_then_find_round_trips() {
        let store = InMemorySagaStore::new();
        let saga = Saga::new("demo", vec![], DataMap::new());
        let saga_id = saga.saga_id;

        let saved = store.save(saga).await.unwrap();
        assert_eq!(saved.version, 1);

        let found = store.find(saga_id).await.unwrap().unwrap();
        assert_eq!(found.saga_id, saga_id);
        assert_eq!(found.version, 1);
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = InMemorySagaStore::new();
        let saga = Saga::new("demo", vec![], DataMap::new());
        let saved = store.save(saga.clone()).await.unwrap();

        // `saga` still carries version 0; saving it again races the first save.
        let result = store.save(saga).await;
        assert!(matches!(result, Err(SagaError::StaleVersion { .. })));

        // But replaying with the correct version succeeds.
        let mut resaved = saved;
        resaved.name = "renamed".into();
        assert!(store.save(resaved).await.is_ok());
    }

    #[tokio::test]
    async fn find_by_status_orders_newest_first() {
        let store = InMemorySagaStore::new();
        let mut first = Saga::new("first", vec![], DataMap::new());
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let mut second = Saga::new("second", vec![], DataMap::new());
        second.created_at = Utc::now();

        store.save(first).await.unwrap();
        store.save(second).await.unwrap();

        let page = store
            .find_by_status(SagaStatus::Created, Page::default())
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].name, "second");
    }

    #[tokio::test]
    async fn bulk_delete_only_removes_terminal_sagas_past_cutoff() {
        let store = InMemorySagaStore::new();
        let mut old_terminal = Saga::new("old", vec![], DataMap::new());
        old_terminal.status = SagaStatus::Completed;
        old_terminal.created_at = Utc::now() - chrono::Duration::days(30);
        let old_id = old_terminal.saga_id;

        let mut recent = Saga::new("recent", vec![], DataMap::new());
        recent.status = SagaStatus::Completed;

        store.save(old_terminal).await.unwrap();
        store.save(recent).await.unwrap();

        let deleted = store
            .bulk_delete_older_than(Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.find(old_id).await.unwrap().is_none());
    }
}
