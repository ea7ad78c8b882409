use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leasehold_application::{LeaseStore, ensure_version_advances};
use leasehold_core::AppResult;
use leasehold_domain::StoredRecord;
use tokio::sync::RwLock;

/// Process-local lease store.
///
/// Every operation runs under one lock, so conditional writes are
/// linearizable among tasks sharing the same instance.
pub struct InMemoryLeaseStore<R> {
    records: RwLock<BTreeMap<String, R>>,
}

impl<R> Default for InMemoryLeaseStore<R> {
    fn default() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<R: StoredRecord> InMemoryLeaseStore<R> {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<R: StoredRecord> LeaseStore<R> for InMemoryLeaseStore<R> {
    async fn create_if_absent(&self, key: &str, record: R) -> AppResult<bool> {
        let mut records = self.records.write().await;
        if records.contains_key(key) {
            return Ok(false);
        }

        records.insert(key.to_owned(), record);
        Ok(true)
    }

    async fn update_if_version_matches(
        &self,
        key: &str,
        expected_version: u64,
        record: R,
    ) -> AppResult<bool> {
        ensure_version_advances(key, expected_version, &record)?;

        let mut records = self.records.write().await;
        let Some(current) = records.get_mut(key) else {
            return Ok(false);
        };
        if current.version() != expected_version {
            return Ok(false);
        }

        *current = record;
        Ok(true)
    }

    async fn get(&self, key: &str) -> AppResult<Option<R>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn delete_if_owner(&self, key: &str, owner_id: &str) -> AppResult<u64> {
        let mut records = self.records.write().await;
        if records
            .get(key)
            .is_some_and(|record| record.owner_id() == Some(owner_id))
        {
            records.remove(key);
            return Ok(1);
        }

        Ok(0)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| {
            record
                .sweep_deadline()
                .is_none_or(|deadline| deadline >= now)
        });

        Ok(u64::try_from(before - records.len()).unwrap_or(u64::MAX))
    }

    async fn list(&self, limit: usize) -> AppResult<Vec<R>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_by_status(&self, statuses: &[&str], limit: usize) -> AppResult<Vec<R>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|record| {
                record
                    .index_status()
                    .is_some_and(|status| statuses.contains(&status))
            })
            .take(limit)
            .cloned()
            .collect())
    }
}
