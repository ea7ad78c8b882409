use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use leasehold_core::{AppError, AppResult, Clock, InstanceId};
use leasehold_domain::{StoredRecord, TaskFailure, WorkItem, WorkItemInput, WorkItemStatus};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backoff::{BackoffPolicy, StoreRetryPolicy};
use crate::lease_store_ports::LeaseStore;
use crate::task_handler_registry::TaskHandlerRegistry;


/// Tunables for optimistic claiming.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClaimOptions {
    /// Conditional-update attempts before giving up.
    pub max_attempts: u32,
    /// Delay schedule between conflicting attempts.
    pub backoff: BackoffPolicy,
    /// Records scanned per `process_available` pass.
    pub scan_limit: usize,
    /// Retry policy for transient store failures.
    pub store_retry: StoreRetryPolicy,
}

impl Default for ClaimOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(100),
                multiplier: 2.0,
                max_delay: Duration::from_secs(5),
            },
            scan_limit: 500,
            store_retry: StoreRetryPolicy::default(),
        }
    }
}

impl ClaimOptions {
    /// Validates option bounds.
    pub fn validate(&self) -> AppResult<()> {
        if self.max_attempts == 0 {
            return Err(AppError::Validation(
                "claim max_attempts must be greater than zero".to_owned(),
            ));
        }

        if self.scan_limit == 0 {
            return Err(AppError::Validation(
                "claim scan_limit must be greater than zero".to_owned(),
            ));
        }

        self.backoff.validate()?;
        self.store_retry.validate()
    }
}

/// Work item held by this worker after a successful claim.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedWorkItem {
    item: WorkItem,
}

impl ClaimedWorkItem {
    /// Returns the claimed item as written to the store.
    #[must_use]
    pub fn item(&self) -> &WorkItem {
        &self.item
    }

    /// Returns the claimed version stamp.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.item.version()
    }

    /// Consumes the claim and returns the item.
    #[must_use]
    pub fn into_item(self) -> WorkItem {
        self.item
    }
}

/// Tally of one `process_available` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingSummary {
    /// Items this worker claimed.
    pub claimed: usize,
    /// Claimed items that completed.
    pub completed: usize,
    /// Claimed items scheduled for retry.
    pub retrying: usize,
    /// Claimed items that failed for good.
    pub failed: usize,
    /// Candidates lost to other workers.
    pub skipped: usize,
}

/// Optimistic-concurrency work claiming.
#[derive(Clone)]
pub struct ClaimEngine {
    store: Arc<dyn LeaseStore<WorkItem>>,
    clock: Arc<dyn Clock>,
    worker_id: InstanceId,
    options: ClaimOptions,
}

impl ClaimEngine {
    /// Creates a claim engine.
    pub fn new(
        store: Arc<dyn LeaseStore<WorkItem>>,
        clock: Arc<dyn Clock>,
        worker_id: InstanceId,
        options: ClaimOptions,
    ) -> AppResult<Self> {
        options.validate()?;

        Ok(Self {
            store,
            clock,
            worker_id,
            options,
        })
    }

    /// Returns the worker identity written into claims.
    #[must_use]
    pub fn worker_id(&self) -> &InstanceId {
        &self.worker_id
    }

    /// Stores a new pending item. Returns false when the id is taken.
    pub async fn submit(&self, input: WorkItemInput) -> AppResult<bool> {
        let item = WorkItem::new(input, self.clock.now())?;
        let created = self
            .options
            .store_retry
            .run("create_if_absent", || {
                self.store.create_if_absent(item.id().as_str(), item.clone())
            })
            .await?;

        if created {
            debug!(item_id = %item.id(), task_type = %item.task_type(), "work item submitted");
        }

        Ok(created)
    }

    /// Returns the stored item.
    pub async fn find(&self, item_id: &str) -> AppResult<Option<WorkItem>> {
        self.fetch(item_id).await
    }

    /// Claims `item_id` for this worker.
    ///
    /// Fails fast with [`AppError::Conflict`] when the first observation is
    /// not claimable, and with [`AppError::ClaimExhausted`] once every attempt
    /// lost a race.
    pub async fn claim(&self, item_id: &str) -> AppResult<ClaimedWorkItem> {
        let mut current = self.fetch_existing(item_id).await?;
        if !current.status().is_claimable() {
            return Err(AppError::Conflict(format!(
                "work item '{item_id}' is {} and cannot be claimed",
                current.status().as_str()
            )));
        }

        let max_attempts = self.options.max_attempts;
        for attempt in 1..=max_attempts {
            if current.status().is_claimable() {
                let claimed = current.claim(self.worker_id.as_str(), self.clock.now())?;
                let replaced = self
                    .options
                    .store_retry
                    .run("update_if_version_matches", || {
                        self.store
                            .update_if_version_matches(item_id, current.version(), claimed.clone())
                    })
                    .await?;

                if replaced {
                    info!(
                        item_id,
                        worker_id = %self.worker_id,
                        version = claimed.version(),
                        attempt,
                        "work item claimed"
                    );
                    return Ok(ClaimedWorkItem { item: claimed });
                }

                // A retried write may have landed before its acknowledgement was lost.
                current = self.fetch_existing(item_id).await?;
                if current.is_claimed_by(self.worker_id.as_str())
                    && current.version() == claimed.version()
                {
                    info!(
                        item_id,
                        worker_id = %self.worker_id,
                        version = current.version(),
                        attempt,
                        "work item claim confirmed on re-read"
                    );
                    return Ok(ClaimedWorkItem { item: current });
                }
            }

            debug!(
                item_id,
                worker_id = %self.worker_id,
                attempt,
                observed_status = current.status().as_str(),
                "claim attempt conflicted"
            );

            if attempt < max_attempts {
                tokio::time::sleep(self.options.backoff.jittered(attempt)).await;
                current = self.fetch_existing(item_id).await?;
            }
        }

        warn!(item_id, worker_id = %self.worker_id, max_attempts, "claim attempts exhausted");
        Err(AppError::ClaimExhausted(format!(
            "work item '{item_id}' could not be claimed after {max_attempts} attempts"
        )))
    }

    /// Marks a claimed item completed.
    ///
    /// Returns [`AppError::Conflict`] when the claim went stale.
    pub async fn complete(&self, claimed: &ClaimedWorkItem) -> AppResult<WorkItem> {
        let completed = claimed.item.completed(self.clock.now())?;
        self.finalize(claimed, completed).await
    }

    /// Records a failed execution of a claimed item.
    ///
    /// Returns [`AppError::Conflict`] when the claim went stale.
    pub async fn fail(
        &self,
        claimed: &ClaimedWorkItem,
        failure: &TaskFailure,
    ) -> AppResult<WorkItem> {
        let failed = claimed.item.failed_with(failure, self.clock.now())?;
        self.finalize(claimed, failed).await
    }

    /// Runs `task` for a claimed item and records its outcome.
    pub async fn execute_claimed<F, Fut>(
        &self,
        claimed: ClaimedWorkItem,
        task: F,
    ) -> AppResult<WorkItem>
    where
        F: FnOnce(WorkItem) -> Fut,
        Fut: Future<Output = Result<(), TaskFailure>>,
    {
        match task(claimed.item.clone()).await {
            Ok(()) => self.complete(&claimed).await,
            Err(failure) => self.fail(&claimed, &failure).await,
        }
    }

    /// Claims `item_id`, runs `task` and records its outcome.
    pub async fn claim_and_execute<F, Fut>(&self, item_id: &str, task: F) -> AppResult<WorkItem>
    where
        F: FnOnce(WorkItem) -> Fut,
        Fut: Future<Output = Result<(), TaskFailure>>,
    {
        let claimed = self.claim(item_id).await?;
        self.execute_claimed(claimed, task).await
    }

    /// Claims up to `limit` claimable items and runs them through `registry`.
    pub async fn process_available(
        &self,
        limit: usize,
        registry: &TaskHandlerRegistry,
    ) -> AppResult<ProcessingSummary> {
        let scan_limit = self.options.scan_limit;
        let claimable = [
            WorkItemStatus::Pending.as_str(),
            WorkItemStatus::Retrying.as_str(),
        ];
        let candidates = self
            .options
            .store_retry
            .run("list_by_status", || {
                self.store.list_by_status(&claimable, scan_limit)
            })
            .await?;

        let mut summary = ProcessingSummary::default();
        for candidate in candidates
            .into_iter()
            .filter(|item| item.status().is_claimable())
            .take(limit)
        {
            let item_id = candidate.id().as_str();
            let claimed = match self.claim(item_id).await {
                Ok(claimed) => claimed,
                Err(AppError::Conflict(_) | AppError::ClaimExhausted(_) | AppError::NotFound(_)) => {
                    summary.skipped += 1;
                    continue;
                }
                Err(error) => return Err(error),
            };
            summary.claimed += 1;

            let outcome = match registry.dispatch(claimed.item()).await {
                Ok(()) => self.complete(&claimed).await,
                Err(failure) => {
                    warn!(
                        item_id,
                        kind = ?failure.kind,
                        message = %failure.message,
                        "work item handler failed"
                    );
                    self.fail(&claimed, &failure).await
                }
            };

            match outcome {
                Ok(item) => match item.status() {
                    WorkItemStatus::Completed => summary.completed += 1,
                    WorkItemStatus::Retrying => summary.retrying += 1,
                    _ => summary.failed += 1,
                },
                Err(AppError::Conflict(message)) => {
                    warn!(item_id, %message, "claim went stale before the outcome was recorded");
                    summary.skipped += 1;
                }
                Err(error) => return Err(error),
            }
        }

        if summary.claimed > 0 || summary.skipped > 0 {
            info!(
                worker_id = %self.worker_id,
                claimed = summary.claimed,
                completed = summary.completed,
                retrying = summary.retrying,
                failed = summary.failed,
                skipped = summary.skipped,
                "processed available work items"
            );
        }

        Ok(summary)
    }

    /// Returns items claimed for at least `older_than`, up to the scan limit.
    pub async fn find_stuck(&self, older_than: Duration) -> AppResult<Vec<WorkItem>> {
        let scan_limit = self.options.scan_limit;
        let claimed = [WorkItemStatus::Claimed.as_str()];
        let now = self.clock.now();
        let candidates = self
            .options
            .store_retry
            .run("list_by_status", || {
                self.store.list_by_status(&claimed, scan_limit)
            })
            .await?;

        Ok(candidates
            .into_iter()
            .filter(|item| item.is_stuck(now, older_than))
            .collect())
    }

    /// Releases claims held for at least `older_than` back to the retry path.
    ///
    /// Each release is conditioned on the stuck version, so a worker that
    /// finishes in the meantime keeps its result. Returns the number of
    /// released items.
    pub async fn recover_stuck(&self, older_than: Duration) -> AppResult<usize> {
        let mut recovered = 0;
        for item in self.find_stuck(older_than).await? {
            let item_id = item.id().as_str();
            let released = item.abandoned(self.clock.now())?;
            let replaced = self
                .options
                .store_retry
                .run("update_if_version_matches", || {
                    self.store
                        .update_if_version_matches(item_id, item.version(), released.clone())
                })
                .await?;

            if replaced {
                recovered += 1;
                warn!(
                    item_id,
                    previous_worker = item.claimed_by().unwrap_or_default(),
                    status = released.status().as_str(),
                    retry_count = released.retry_count(),
                    "stuck claim released"
                );
            } else {
                debug!(item_id, "stuck claim changed before release");
            }
        }

        Ok(recovered)
    }

    async fn finalize(&self, claimed: &ClaimedWorkItem, next: WorkItem) -> AppResult<WorkItem> {
        let item_id = claimed.item.id().as_str();
        let replaced = self
            .options
            .store_retry
            .run("update_if_version_matches", || {
                self.store
                    .update_if_version_matches(item_id, claimed.version(), next.clone())
            })
            .await?;

        if !replaced {
            let landed = self.fetch(item_id).await?.is_some_and(|stored| {
                stored.version() == next.version()
                    && stored.status() == next.status()
                    && stored.claimed_by() == next.claimed_by()
            });
            if !landed {
                return Err(AppError::Conflict(format!(
                    "claim on work item '{item_id}' at version {} is stale",
                    claimed.version()
                )));
            }
        }

        debug!(
            item_id,
            status = next.status().as_str(),
            version = next.version(),
            "work item updated"
        );
        Ok(next)
    }

    async fn fetch(&self, item_id: &str) -> AppResult<Option<WorkItem>> {
        self.options
            .store_retry
            .run("get", || self.store.get(item_id))
            .await
    }

    async fn fetch_existing(&self, item_id: &str) -> AppResult<WorkItem> {
        self.fetch(item_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("work item '{item_id}' does not exist")))
    }
}
