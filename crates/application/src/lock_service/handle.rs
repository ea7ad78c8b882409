use std::time::Duration;

use chrono::{DateTime, Utc};
use leasehold_core::{AppError, AppResult};
use leasehold_domain::{LeaseMetadata, LeaseRecord, StoredRecord};
use tracing::warn;

use super::LockManager;

/// Parameters of one lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    /// Resource to lock.
    pub key: String,
    /// Lease lifetime granted on acquisition.
    pub hold_duration: Duration,
    /// Maximum time spent waiting for the lock.
    pub wait_timeout: Duration,
    /// Description stored with the lease.
    pub metadata: LeaseMetadata,
}

impl LockRequest {
    /// Creates a request without metadata.
    #[must_use]
    pub fn new(key: impl Into<String>, hold_duration: Duration, wait_timeout: Duration) -> Self {
        Self {
            key: key.into(),
            hold_duration,
            wait_timeout,
            metadata: LeaseMetadata::default(),
        }
    }

    /// Tags the lease with the task type it guards.
    #[must_use]
    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.metadata.task_type = Some(task_type.into());
        self
    }

    /// Attaches a human-readable description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = Some(description.into());
        self
    }

    pub(super) fn validate(&self) -> AppResult<()> {
        if self.key.trim().is_empty() {
            return Err(AppError::Validation("lock key must not be empty".to_owned()));
        }

        if self.hold_duration.is_zero() {
            return Err(AppError::Validation(format!(
                "lock '{}' hold_duration must be greater than zero",
                self.key
            )));
        }

        Ok(())
    }
}

/// Proof of one successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    key: String,
    owner_id: String,
    version: u64,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl LockHandle {
    pub(super) fn from_record(record: &LeaseRecord) -> Self {
        Self {
            key: record.key().as_str().to_owned(),
            owner_id: record.owner().as_str().to_owned(),
            version: record.version(),
            acquired_at: record.acquired_at(),
            expires_at: record.expires_at(),
        }
    }

    pub(super) fn refresh(&mut self, record: &LeaseRecord) {
        self.version = record.version();
        self.expires_at = record.expires_at();
    }

    /// Returns locked resource key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the acquisition token.
    #[must_use]
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Returns the lease version this handle last wrote.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Returns acquisition time.
    #[must_use]
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Returns lease expiry known to this handle.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Held lock released on [`LockGuard::release`] or drop.
///
/// Dropping an unreleased guard schedules the release on the current tokio
/// runtime. Outside a runtime the lease is left to expire.
pub struct LockGuard {
    manager: LockManager,
    handle: LockHandle,
    released: bool,
}

impl LockGuard {
    pub(super) fn new(manager: LockManager, handle: LockHandle) -> Self {
        Self {
            manager,
            handle,
            released: false,
        }
    }

    /// Returns the underlying handle.
    #[must_use]
    pub fn handle(&self) -> &LockHandle {
        &self.handle
    }

    /// Extends the held lease.
    pub async fn extend(&mut self, hold_duration: Duration) -> AppResult<bool> {
        self.manager
            .extend_lock(&mut self.handle, hold_duration)
            .await
    }

    /// Releases the lock now.
    pub async fn release(mut self) -> AppResult<bool> {
        let result = self.manager.release(&self.handle).await;
        self.released = true;
        result
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                key = %self.handle.key(),
                "lock guard dropped outside a runtime, lease will expire"
            );
            return;
        };

        let manager = self.manager.clone();
        let handle = self.handle.clone();
        runtime.spawn(async move {
            if let Err(error) = manager.release(&handle).await {
                warn!(key = %handle.key(), error = %error, "deferred lock release failed");
            }
        });
    }
}
