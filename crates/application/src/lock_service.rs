use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use leasehold_core::{AppError, AppResult, Clock, InstanceId};
use leasehold_domain::{LeaseRecord, LeaseRecordInput, StoredRecord};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::StoreRetryPolicy;
use crate::lease_store_ports::LeaseStore;

mod handle;
mod statistics;

#[cfg(test)]
mod tests;

pub use handle::{LockGuard, LockHandle, LockRequest};
pub use statistics::LockStatistics;

use statistics::LockCounters;

/// Tunables for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockManagerOptions {
    /// Sleep between attempts while another owner holds the lock.
    pub poll_interval: Duration,
    /// Sleep after losing a takeover race.
    pub conflict_retry_delay: Duration,
    /// Retry policy for transient store failures.
    pub store_retry: StoreRetryPolicy,
}

impl Default for LockManagerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            conflict_retry_delay: Duration::from_millis(50),
            store_retry: StoreRetryPolicy::default(),
        }
    }
}

impl LockManagerOptions {
    /// Validates option bounds.
    pub fn validate(&self) -> AppResult<()> {
        if self.poll_interval.is_zero() {
            return Err(AppError::Validation(
                "lock poll_interval must be greater than zero".to_owned(),
            ));
        }

        self.store_retry.validate()
    }
}

enum AcquireAttempt {
    Acquired { handle: LockHandle, takeover: bool },
    Held,
    LostRace,
    Vanished,
}

/// Distributed mutual exclusion over named leases.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LeaseStore<LeaseRecord>>,
    clock: Arc<dyn Clock>,
    instance_id: InstanceId,
    options: LockManagerOptions,
    counters: Arc<LockCounters>,
}

impl LockManager {
    /// Creates a lock manager.
    pub fn new(
        store: Arc<dyn LeaseStore<LeaseRecord>>,
        clock: Arc<dyn Clock>,
        instance_id: InstanceId,
        options: LockManagerOptions,
    ) -> AppResult<Self> {
        options.validate()?;

        Ok(Self {
            store,
            clock,
            instance_id,
            options,
            counters: Arc::new(LockCounters::default()),
        })
    }

    /// Returns the instance acquiring locks through this manager.
    #[must_use]
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Acquires `key` for `hold_duration`, waiting up to `wait_timeout`.
    ///
    /// Returns `None` when the wait elapses. At least one attempt is made
    /// even with a zero timeout.
    pub async fn acquire_lock(
        &self,
        key: &str,
        hold_duration: Duration,
        wait_timeout: Duration,
    ) -> AppResult<Option<LockHandle>> {
        self.acquire_lock_with(LockRequest::new(key, hold_duration, wait_timeout))
            .await
    }

    /// Acquires a lock described by `request`.
    pub async fn acquire_lock_with(&self, request: LockRequest) -> AppResult<Option<LockHandle>> {
        request.validate()?;
        let deadline = Instant::now() + request.wait_timeout;

        loop {
            let delay = match self.try_acquire_once(&request).await {
                Ok(AcquireAttempt::Acquired { handle, takeover }) => {
                    self.counters.record_acquisition(takeover);
                    info!(
                        key = %handle.key(),
                        owner_id = %handle.owner_id(),
                        version = handle.version(),
                        takeover,
                        "lock acquired"
                    );
                    return Ok(Some(handle));
                }
                Ok(AcquireAttempt::Held) => self.options.poll_interval,
                Ok(AcquireAttempt::LostRace) => self.options.conflict_retry_delay,
                Ok(AcquireAttempt::Vanished) => Duration::ZERO,
                Err(error) => {
                    self.counters.record_failure();
                    warn!(key = %request.key, error = %error, "lock acquisition failed");
                    return Err(error);
                }
            };

            let now = Instant::now();
            if now >= deadline {
                self.counters.record_timeout();
                debug!(
                    key = %request.key,
                    wait_ms = request.wait_timeout.as_millis(),
                    "lock wait timed out"
                );
                return Ok(None);
            }

            if !delay.is_zero() {
                tokio::time::sleep(delay.min(deadline - now)).await;
            }
        }
    }

    async fn try_acquire_once(&self, request: &LockRequest) -> AppResult<AcquireAttempt> {
        let now = self.clock.now();
        let owner_id = self.instance_id.acquisition_token();
        let record = LeaseRecord::new(LeaseRecordInput {
            key: request.key.clone(),
            owner_id: owner_id.clone(),
            holder_id: self.instance_id.as_str().to_owned(),
            acquired_at: now,
            hold_duration: request.hold_duration,
            metadata: request.metadata.clone(),
        })?;

        let created = self
            .options
            .store_retry
            .run("create_if_absent", || {
                self.store.create_if_absent(&request.key, record.clone())
            })
            .await?;
        if created {
            return Ok(AcquireAttempt::Acquired {
                handle: LockHandle::from_record(&record),
                takeover: false,
            });
        }

        let Some(existing) = self.fetch(&request.key).await? else {
            return Ok(AcquireAttempt::Vanished);
        };

        // A retried create may have landed before the transport error surfaced.
        if existing.is_owned_by(&owner_id) {
            return Ok(AcquireAttempt::Acquired {
                handle: LockHandle::from_record(&existing),
                takeover: false,
            });
        }

        if existing.is_active(now) {
            return Ok(AcquireAttempt::Held);
        }

        let successor = existing.taken_over_by(
            &owner_id,
            self.instance_id.as_str(),
            now,
            request.hold_duration,
            request.metadata.clone(),
        )?;
        let replaced = self
            .options
            .store_retry
            .run("update_if_version_matches", || {
                self.store.update_if_version_matches(
                    &request.key,
                    existing.version(),
                    successor.clone(),
                )
            })
            .await?;

        if replaced {
            debug!(
                key = %request.key,
                previous_owner = %existing.owner(),
                "took over expired lock"
            );
            return Ok(AcquireAttempt::Acquired {
                handle: LockHandle::from_record(&successor),
                takeover: true,
            });
        }

        // A retried takeover may also have landed before its error surfaced.
        if let Some(current) = self.fetch(&request.key).await?
            && current.is_owned_by(&owner_id)
        {
            return Ok(AcquireAttempt::Acquired {
                handle: LockHandle::from_record(&current),
                takeover: true,
            });
        }

        Ok(AcquireAttempt::LostRace)
    }

    /// Releases `handle`. Returns false when the lock was already released
    /// or has been taken over by another owner.
    pub async fn release(&self, handle: &LockHandle) -> AppResult<bool> {
        let deleted = self
            .options
            .store_retry
            .run("delete_if_owner", || {
                self.store.delete_if_owner(handle.key(), handle.owner_id())
            })
            .await
            .inspect_err(|_| self.counters.record_failure())?;

        if deleted == 0 {
            debug!(key = %handle.key(), owner_id = %handle.owner_id(), "lock already released");
            return Ok(false);
        }

        self.counters.record_release();
        info!(key = %handle.key(), owner_id = %handle.owner_id(), "lock released");
        Ok(true)
    }

    /// Pushes the expiry of a held lock to `now + hold_duration`.
    ///
    /// Returns false when `handle` no longer owns the lock.
    pub async fn extend_lock(
        &self,
        handle: &mut LockHandle,
        hold_duration: Duration,
    ) -> AppResult<bool> {
        let Some(existing) = self.fetch(handle.key()).await? else {
            return Ok(false);
        };
        if !existing.is_owned_by(handle.owner_id()) {
            return Ok(false);
        }

        let extended = existing.extended(self.clock.now(), hold_duration)?;
        let replaced = self
            .options
            .store_retry
            .run("update_if_version_matches", || {
                self.store
                    .update_if_version_matches(handle.key(), existing.version(), extended.clone())
            })
            .await?;

        if replaced {
            handle.refresh(&extended);
            debug!(
                key = %handle.key(),
                expires_at = %extended.expires_at(),
                "lock extended"
            );
        }

        Ok(replaced)
    }

    /// Acquires a lock and returns a guard that releases it when dropped.
    pub async fn lock_guard(&self, request: LockRequest) -> AppResult<Option<LockGuard>> {
        Ok(self
            .acquire_lock_with(request)
            .await?
            .map(|handle| LockGuard::new(self.clone(), handle)))
    }

    /// Runs `action` while holding `key`.
    ///
    /// Returns `None` without running `action` when the lock could not be
    /// acquired in time. The lock is released on every exit path.
    pub async fn execute_with_lock<T, F, Fut>(
        &self,
        key: &str,
        hold_duration: Duration,
        wait_timeout: Duration,
        action: F,
    ) -> AppResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let Some(guard) = self
            .lock_guard(LockRequest::new(key, hold_duration, wait_timeout))
            .await?
        else {
            return Ok(None);
        };

        let result = action().await;
        let released = guard.release().await;
        let value = result?;
        released?;

        Ok(Some(value))
    }

    /// Returns whether any owner currently holds `key`.
    pub async fn is_lock_held(&self, key: &str) -> AppResult<bool> {
        let now = self.clock.now();
        Ok(self
            .fetch(key)
            .await?
            .is_some_and(|record| record.is_active(now)))
    }

    /// Returns the active lease for `key`, if any.
    pub async fn lock_info(&self, key: &str) -> AppResult<Option<LeaseRecord>> {
        let now = self.clock.now();
        Ok(self
            .fetch(key)
            .await?
            .filter(|record| record.is_active(now)))
    }

    /// Deletes every expired lease. Returns the number removed.
    pub async fn cleanup_expired_locks(&self) -> AppResult<u64> {
        let now = self.clock.now();
        let removed = self
            .options
            .store_retry
            .run("delete_expired", || self.store.delete_expired(now))
            .await?;

        if removed > 0 {
            info!(removed, "removed expired locks");
        }

        Ok(removed)
    }

    /// Returns counters accumulated by this manager and its clones.
    #[must_use]
    pub fn statistics(&self) -> LockStatistics {
        self.counters.snapshot()
    }

    async fn fetch(&self, key: &str) -> AppResult<Option<LeaseRecord>> {
        self.options
            .store_retry
            .run("get", || self.store.get(key))
            .await
    }
}
