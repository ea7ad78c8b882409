use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leasehold_core::{AppError, AppResult};
use leasehold_domain::StoredRecord;
use tokio::sync::Mutex;

use crate::{LeaseStore, NodeHealthCheck, ensure_version_advances};

/// In-process store with failure and stale-read injection.
pub(crate) struct FakeLeaseStore<R> {
    records: Mutex<BTreeMap<String, R>>,
    stale_reads: Mutex<VecDeque<Option<R>>>,
    failures_remaining: AtomicU32,
    lost_acks_remaining: AtomicU32,
}

impl<R: StoredRecord> FakeLeaseStore<R> {
    pub(crate) fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            stale_reads: Mutex::new(VecDeque::new()),
            failures_remaining: AtomicU32::new(0),
            lost_acks_remaining: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` calls fail with `StoreUnavailable`.
    pub(crate) fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Applies the next `count` successful conditional updates, then reports
    /// them as `StoreUnavailable`.
    pub(crate) fn lose_next_update_acks(&self, count: u32) {
        self.lost_acks_remaining.store(count, Ordering::SeqCst);
    }

    /// Serves `snapshot` to the next `get` instead of the stored record.
    pub(crate) async fn push_stale_read(&self, snapshot: Option<R>) {
        self.stale_reads.lock().await.push_back(snapshot);
    }

    pub(crate) async fn seed(&self, key: &str, record: R) {
        self.records.lock().await.insert(key.to_owned(), record);
    }

    pub(crate) async fn snapshot(&self, key: &str) -> Option<R> {
        self.records.lock().await.get(key).cloned()
    }

    fn injected_failure(&self) -> AppResult<()> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(AppError::StoreUnavailable(
                "injected store failure".to_owned(),
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl<R: StoredRecord> LeaseStore<R> for FakeLeaseStore<R> {
    async fn create_if_absent(&self, key: &str, record: R) -> AppResult<bool> {
        self.injected_failure()?;
        let mut records = self.records.lock().await;
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
        self.injected_failure()?;
        ensure_version_advances(key, expected_version, &record)?;

        let mut records = self.records.lock().await;
        match records.get_mut(key) {
            Some(current) if current.version() == expected_version => {
                *current = record;
                let lost = self.lost_acks_remaining.load(Ordering::SeqCst);
                if lost > 0 {
                    self.lost_acks_remaining.store(lost - 1, Ordering::SeqCst);
                    return Err(AppError::StoreUnavailable(
                        "connection reset after commit".to_owned(),
                    ));
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> AppResult<Option<R>> {
        self.injected_failure()?;
        if let Some(snapshot) = self.stale_reads.lock().await.pop_front() {
            return Ok(snapshot);
        }

        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn delete_if_owner(&self, key: &str, owner_id: &str) -> AppResult<u64> {
        self.injected_failure()?;
        let mut records = self.records.lock().await;
        let owned = records
            .get(key)
            .is_some_and(|record| record.owner_id() == Some(owner_id));
        if !owned {
            return Ok(0);
        }

        records.remove(key);
        Ok(1)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        self.injected_failure()?;
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| {
            record
                .sweep_deadline()
                .is_none_or(|deadline| deadline >= now)
        });

        Ok(u64::try_from(before - records.len()).unwrap_or(u64::MAX))
    }

    async fn list(&self, limit: usize) -> AppResult<Vec<R>> {
        self.injected_failure()?;
        Ok(self
            .records
            .lock()
            .await
            .values()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_by_status(&self, statuses: &[&str], limit: usize) -> AppResult<Vec<R>> {
        self.injected_failure()?;
        Ok(self
            .records
            .lock()
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

/// Health check answering from a fixed table; unknown nodes are healthy.
#[derive(Default)]
pub(crate) struct FakeHealthCheck {
    statuses: Mutex<HashMap<String, AppResult<bool>>>,
}

impl FakeHealthCheck {
    pub(crate) async fn set_healthy(&self, node_id: &str, healthy: bool) {
        self.statuses
            .lock()
            .await
            .insert(node_id.to_owned(), Ok(healthy));
    }

    pub(crate) async fn set_error(&self, node_id: &str) {
        self.statuses.lock().await.insert(
            node_id.to_owned(),
            Err(AppError::Internal("health endpoint timed out".to_owned())),
        );
    }
}

#[async_trait]
impl NodeHealthCheck for FakeHealthCheck {
    async fn is_node_healthy(&self, node_id: &str) -> AppResult<bool> {
        match self.statuses.lock().await.get(node_id) {
            Some(Ok(healthy)) => Ok(*healthy),
            Some(Err(error)) => Err(AppError::Internal(error.to_string())),
            None => Ok(true),
        }
    }
}
