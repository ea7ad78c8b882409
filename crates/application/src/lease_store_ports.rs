use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leasehold_core::{AppError, AppResult};
use leasehold_domain::StoredRecord;

/// Shared store offering atomic conditional operations over one record kind.
///
/// Losing a race is reported as `false`/`0`, never as an error. Transient I/O
/// failures surface as [`AppError::StoreUnavailable`].
#[async_trait]
pub trait LeaseStore<R: StoredRecord>: Send + Sync {
    /// Inserts `record` only when no record exists for `key`.
    async fn create_if_absent(&self, key: &str, record: R) -> AppResult<bool>;

    /// Replaces the record for `key` only when its stored version equals
    /// `expected_version`.
    async fn update_if_version_matches(
        &self,
        key: &str,
        expected_version: u64,
        record: R,
    ) -> AppResult<bool>;

    /// Returns the current record for `key`.
    async fn get(&self, key: &str) -> AppResult<Option<R>>;

    /// Deletes the record for `key` only when `owner_id` owns it. Returns the
    /// number of deleted records.
    async fn delete_if_owner(&self, key: &str, owner_id: &str) -> AppResult<u64>;

    /// Deletes records whose sweep deadline is before `now`.
    async fn delete_expired(&self, now: DateTime<Utc>) -> AppResult<u64>;

    /// Lists up to `limit` records ordered by key.
    async fn list(&self, limit: usize) -> AppResult<Vec<R>>;

    /// Lists up to `limit` records whose index status is one of `statuses`,
    /// ordered by key.
    async fn list_by_status(&self, statuses: &[&str], limit: usize) -> AppResult<Vec<R>>;
}

/// Rejects a replacement record whose version does not advance past `expected_version`.
pub fn ensure_version_advances<R: StoredRecord>(
    key: &str,
    expected_version: u64,
    record: &R,
) -> AppResult<()> {
    if record.version() <= expected_version {
        return Err(AppError::Validation(format!(
            "{} record '{key}' version {} must be greater than expected version {expected_version}",
            R::NAMESPACE,
            record.version()
        )));
    }

    Ok(())
}
