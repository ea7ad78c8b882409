use std::time::Duration;

use chrono::{DateTime, Utc};
use leasehold_core::{AppError, AppResult, NonEmptyString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::{StoredRecord, next_version};

/// Lifecycle status of one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Waiting for its first claim.
    Pending,
    /// Held by exactly one worker.
    Claimed,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully with no retries left.
    Failed,
    /// Failed once and waiting to be claimed again.
    Retrying,
}

impl WorkItemStatus {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }

    /// Parses storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            _ => Err(AppError::Validation(format!(
                "unknown work item status '{value}'"
            ))),
        }
    }

    /// Returns whether a worker may claim an item in this status.
    #[must_use]
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }

    /// Returns whether the status is final.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Whether a failed task should be attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient failure; the item may be retried.
    Retriable,
    /// The item can never succeed.
    Permanent,
}

/// Typed failure returned by task handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Retry classification.
    pub kind: FailureKind,
    /// Human-readable cause recorded on the item.
    pub message: String,
}

impl TaskFailure {
    /// Creates a retriable failure.
    #[must_use]
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retriable,
            message: message.into(),
        }
    }

    /// Creates a permanent failure.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }
}

/// Input payload for a new work item.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItemInput {
    /// Stable item identifier.
    pub id: String,
    /// Task type tag resolved by the handler registry.
    pub task_type: String,
    /// Handler-specific payload.
    pub payload: Value,
    /// Version stamp the item starts at. Imported items keep their existing stamp.
    pub version: u64,
    /// Retries allowed after retriable failures.
    pub max_retries: u32,
}

/// Unit of work claimed by exactly one worker at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    id: NonEmptyString,
    task_type: NonEmptyString,
    payload: Value,
    version: u64,
    status: WorkItemStatus,
    claimed_by: Option<String>,
    #[serde(default)]
    claimed_at: Option<DateTime<Utc>>,
    retry_count: u32,
    max_retries: u32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// Creates a pending work item.
    pub fn new(input: WorkItemInput, now: DateTime<Utc>) -> AppResult<Self> {
        Ok(Self {
            id: NonEmptyString::new(input.id)
                .map_err(|_| AppError::Validation("work item id must not be empty".to_owned()))?,
            task_type: NonEmptyString::new(input.task_type).map_err(|_| {
                AppError::Validation("work item task_type must not be empty".to_owned())
            })?,
            payload: input.payload,
            version: input.version,
            status: WorkItemStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            retry_count: 0,
            max_retries: input.max_retries,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Returns the successor record claimed by `worker_id`.
    pub fn claim(&self, worker_id: &str, now: DateTime<Utc>) -> AppResult<Self> {
        if worker_id.trim().is_empty() {
            return Err(AppError::Validation(
                "claiming worker_id must not be empty".to_owned(),
            ));
        }

        if !self.status.is_claimable() {
            return Err(AppError::Validation(format!(
                "work item '{}' is {} and cannot be claimed",
                self.id,
                self.status.as_str()
            )));
        }

        Ok(Self {
            version: next_version(self.version)?,
            status: WorkItemStatus::Claimed,
            claimed_by: Some(worker_id.to_owned()),
            claimed_at: Some(now),
            updated_at: now,
            ..self.clone()
        })
    }

    /// Returns the completed successor record.
    pub fn completed(&self, now: DateTime<Utc>) -> AppResult<Self> {
        self.require_claimed("completed")?;

        Ok(Self {
            version: next_version(self.version)?,
            status: WorkItemStatus::Completed,
            claimed_by: None,
            claimed_at: None,
            updated_at: now,
            ..self.clone()
        })
    }

    /// Returns the successor record after a failed execution.
    ///
    /// Retriable failures move the item to `retrying` while retries remain;
    /// permanent failures and exhausted retries end in `failed`.
    pub fn failed_with(&self, failure: &TaskFailure, now: DateTime<Utc>) -> AppResult<Self> {
        self.require_claimed("failed")?;

        let retry = failure.kind == FailureKind::Retriable && self.retry_count < self.max_retries;
        let (status, retry_count) = if retry {
            (WorkItemStatus::Retrying, self.retry_count + 1)
        } else {
            (WorkItemStatus::Failed, self.retry_count)
        };

        Ok(Self {
            version: next_version(self.version)?,
            status,
            claimed_by: None,
            claimed_at: None,
            retry_count,
            last_error: Some(failure.message.clone()),
            updated_at: now,
            ..self.clone()
        })
    }

    /// Returns the successor record after the claiming worker went silent.
    ///
    /// Counts as a retriable failure, so the item is retried while budget
    /// remains.
    pub fn abandoned(&self, now: DateTime<Utc>) -> AppResult<Self> {
        let failure = TaskFailure::retriable(format!(
            "claim by '{}' abandoned",
            self.claimed_by.as_deref().unwrap_or("unknown")
        ));
        self.failed_with(&failure, now)
    }

    /// Returns whether the item has been claimed for at least `older_than`.
    #[must_use]
    pub fn is_stuck(&self, now: DateTime<Utc>, older_than: Duration) -> bool {
        if self.status != WorkItemStatus::Claimed {
            return false;
        }

        let Ok(older_than) = chrono::Duration::from_std(older_than) else {
            return false;
        };
        self.claimed_at
            .and_then(|claimed_at| claimed_at.checked_add_signed(older_than))
            .is_some_and(|deadline| deadline <= now)
    }

    fn require_claimed(&self, target: &str) -> AppResult<()> {
        if self.status != WorkItemStatus::Claimed {
            return Err(AppError::Validation(format!(
                "work item '{}' is {} and cannot move to {target}",
                self.id,
                self.status.as_str()
            )));
        }

        Ok(())
    }

    /// Returns whether `worker_id` currently holds the claim.
    #[must_use]
    pub fn is_claimed_by(&self, worker_id: &str) -> bool {
        self.status == WorkItemStatus::Claimed && self.claimed_by.as_deref() == Some(worker_id)
    }

    /// Returns item identifier.
    #[must_use]
    pub fn id(&self) -> &NonEmptyString {
        &self.id
    }

    /// Returns task type tag.
    #[must_use]
    pub fn task_type(&self) -> &NonEmptyString {
        &self.task_type
    }

    /// Returns handler payload.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Returns current status.
    #[must_use]
    pub fn status(&self) -> WorkItemStatus {
        self.status
    }

    /// Returns claiming worker while claimed.
    #[must_use]
    pub fn claimed_by(&self) -> Option<&str> {
        self.claimed_by.as_deref()
    }

    /// Returns when the current claim was taken.
    #[must_use]
    pub fn claimed_at(&self) -> Option<DateTime<Utc>> {
        self.claimed_at
    }

    /// Returns retries consumed so far.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Returns retry budget.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the last recorded failure message.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Returns creation time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns last transition time.
    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl StoredRecord for WorkItem {
    const NAMESPACE: &'static str = "work_item";

    fn version(&self) -> u64 {
        self.version
    }

    fn owner_id(&self) -> Option<&str> {
        self.claimed_by.as_deref()
    }

    fn index_status(&self) -> Option<&'static str> {
        Some(self.status.as_str())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use proptest::prelude::*;
    use serde_json::json;

    use super::{TaskFailure, WorkItem, WorkItemInput, WorkItemStatus};
    use crate::StoredRecord;

    fn item(version: u64, max_retries: u32) -> WorkItem {
        let item = WorkItem::new(
            WorkItemInput {
                id: "42".to_owned(),
                task_type: "email".to_owned(),
                payload: json!({"to": "ops@example.com"}),
                version,
                max_retries,
            },
            Utc::now(),
        );
        assert!(item.is_ok());
        item.unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn status_round_trips_storage_values() {
        for status in [
            WorkItemStatus::Pending,
            WorkItemStatus::Claimed,
            WorkItemStatus::Completed,
            WorkItemStatus::Failed,
            WorkItemStatus::Retrying,
        ] {
            assert_eq!(WorkItemStatus::parse(status.as_str()).ok(), Some(status));
        }
        assert!(WorkItemStatus::parse("running").is_err());
    }

    #[test]
    fn claim_moves_pending_item_to_claimed_with_next_version() {
        let claimed = item(3, 3).claim("worker-a", Utc::now());

        assert!(claimed.is_ok());
        let claimed = claimed.unwrap_or_else(|_| unreachable!());
        assert_eq!(claimed.status(), WorkItemStatus::Claimed);
        assert_eq!(claimed.version(), 4);
        assert!(claimed.is_claimed_by("worker-a"));
        assert_eq!(claimed.owner_id(), Some("worker-a"));
    }

    #[test]
    fn claimed_item_cannot_be_claimed_again() {
        let claimed = item(3, 3)
            .claim("worker-a", Utc::now())
            .unwrap_or_else(|_| unreachable!());

        assert!(claimed.claim("worker-b", Utc::now()).is_err());
    }

    #[test]
    fn pending_item_cannot_complete_without_claim() {
        assert!(item(0, 3).completed(Utc::now()).is_err());
    }

    #[test]
    fn retriable_failure_clears_claim_and_counts_retry() {
        let claimed = item(0, 2)
            .claim("worker-a", Utc::now())
            .unwrap_or_else(|_| unreachable!());
        let retrying = claimed.failed_with(&TaskFailure::retriable("smtp timeout"), Utc::now());

        assert!(retrying.is_ok());
        let retrying = retrying.unwrap_or_else(|_| unreachable!());
        assert_eq!(retrying.status(), WorkItemStatus::Retrying);
        assert_eq!(retrying.retry_count(), 1);
        assert_eq!(retrying.claimed_by(), None);
        assert_eq!(retrying.last_error(), Some("smtp timeout"));
        assert_eq!(retrying.version(), 2);
    }

    #[test]
    fn permanent_failure_is_terminal_even_with_retries_left() {
        let claimed = item(0, 5)
            .claim("worker-a", Utc::now())
            .unwrap_or_else(|_| unreachable!());
        let failed = claimed
            .failed_with(&TaskFailure::permanent("bad address"), Utc::now())
            .unwrap_or_else(|_| unreachable!());

        assert_eq!(failed.status(), WorkItemStatus::Failed);
        assert!(failed.status().is_terminal());
        assert!(failed.claim("worker-b", Utc::now()).is_err());
    }

    #[test]
    fn retriable_failure_without_budget_fails_item() {
        let claimed = item(0, 0)
            .claim("worker-a", Utc::now())
            .unwrap_or_else(|_| unreachable!());
        let failed = claimed
            .failed_with(&TaskFailure::retriable("smtp timeout"), Utc::now())
            .unwrap_or_else(|_| unreachable!());

        assert_eq!(failed.status(), WorkItemStatus::Failed);
        assert_eq!(failed.retry_count(), 0);
    }

    #[test]
    fn claim_older_than_threshold_is_stuck() {
        let claimed_at = Utc::now();
        let claimed = item(0, 1)
            .claim("worker-a", claimed_at)
            .unwrap_or_else(|_| unreachable!());
        let threshold = Duration::from_secs(300);

        assert_eq!(claimed.claimed_at(), Some(claimed_at));
        assert!(!claimed.is_stuck(claimed_at + chrono::Duration::seconds(299), threshold));
        assert!(claimed.is_stuck(claimed_at + chrono::Duration::seconds(300), threshold));

        let completed = claimed
            .completed(claimed_at)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(completed.claimed_at(), None);
        assert!(!completed.is_stuck(claimed_at + chrono::Duration::hours(1), threshold));
    }

    #[test]
    fn abandoned_claim_is_retried_then_failed() {
        let now = Utc::now();
        let claimed = item(0, 1)
            .claim("worker-a", now)
            .unwrap_or_else(|_| unreachable!());

        let retrying = claimed.abandoned(now);
        assert!(retrying.is_ok());
        let retrying = retrying.unwrap_or_else(|_| unreachable!());
        assert_eq!(retrying.status(), WorkItemStatus::Retrying);
        assert_eq!(retrying.claimed_by(), None);
        assert_eq!(retrying.last_error(), Some("claim by 'worker-a' abandoned"));

        let failed = retrying
            .claim("worker-b", now)
            .and_then(|reclaimed| reclaimed.abandoned(now))
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(failed.status(), WorkItemStatus::Failed);
        assert!(item(0, 1).abandoned(now).is_err());
    }

    #[test]
    fn index_status_follows_lifecycle() {
        let pending = item(0, 1);
        assert_eq!(pending.index_status(), Some("pending"));

        let claimed = pending
            .claim("worker-a", Utc::now())
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(claimed.index_status(), Some("claimed"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Accepted transitions bump the version by exactly one and rejected
        /// ones leave the item untouched.
        #[test]
        fn prop_accepted_transitions_bump_version_by_one(
            steps in prop::collection::vec(0_u8..4, 0..40),
            max_retries in 0_u32..4,
        ) {
            let mut current = item(0, max_retries);

            for step in steps {
                let next = match step {
                    0 => current.claim("worker-a", Utc::now()),
                    1 => current.completed(Utc::now()),
                    2 => current.failed_with(&TaskFailure::retriable("transient"), Utc::now()),
                    _ => current.failed_with(&TaskFailure::permanent("fatal"), Utc::now()),
                };

                if let Ok(next) = next {
                    prop_assert_eq!(next.version(), current.version() + 1);
                    prop_assert!(!current.status().is_terminal());
                    prop_assert!(next.retry_count() <= next.max_retries());
                    current = next;
                }
            }
        }
    }
}
