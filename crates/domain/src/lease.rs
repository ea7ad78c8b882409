use std::time::Duration;

use chrono::{DateTime, Utc};
use leasehold_core::{AppError, AppResult, NonEmptyString};
use serde::{Deserialize, Serialize};

use crate::record::{StoredRecord, deadline_after, next_version};

/// Free-form description attached to a lease.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseMetadata {
    /// Optional task type tag of the guarded work.
    pub task_type: Option<String>,
    /// Optional human-readable description.
    pub description: Option<String>,
}

/// Input payload for a freshly acquired lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecordInput {
    /// Identity of the contended resource.
    pub key: String,
    /// Token unique to this acquisition.
    pub owner_id: String,
    /// Instance that performed the acquisition.
    pub holder_id: String,
    /// Acquisition instant.
    pub acquired_at: DateTime<Utc>,
    /// How long the lease stays active without renewal.
    pub hold_duration: Duration,
    /// Free-form description.
    pub metadata: LeaseMetadata,
}

/// Named, time-bounded exclusion token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    key: NonEmptyString,
    owner_id: NonEmptyString,
    holder_id: NonEmptyString,
    version: u64,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    metadata: LeaseMetadata,
}

impl LeaseRecord {
    /// Creates the first version of a lease.
    pub fn new(input: LeaseRecordInput) -> AppResult<Self> {
        let expires_at = deadline_after(input.acquired_at, input.hold_duration)?;

        Ok(Self {
            key: NonEmptyString::new(input.key)
                .map_err(|_| AppError::Validation("lease key must not be empty".to_owned()))?,
            owner_id: NonEmptyString::new(input.owner_id)
                .map_err(|_| AppError::Validation("lease owner_id must not be empty".to_owned()))?,
            holder_id: NonEmptyString::new(input.holder_id).map_err(|_| {
                AppError::Validation("lease holder_id must not be empty".to_owned())
            })?,
            version: 1,
            acquired_at: input.acquired_at,
            expires_at,
            metadata: input.metadata,
        })
    }

    /// Returns the successor record when another owner takes over an expired lease.
    pub fn taken_over_by(
        &self,
        owner_id: &str,
        holder_id: &str,
        now: DateTime<Utc>,
        hold_duration: Duration,
        metadata: LeaseMetadata,
    ) -> AppResult<Self> {
        if self.is_active(now) {
            return Err(AppError::Conflict(format!(
                "lease '{}' is still held by '{}' until {}",
                self.key, self.owner_id, self.expires_at
            )));
        }

        let mut successor = Self::new(LeaseRecordInput {
            key: self.key.as_str().to_owned(),
            owner_id: owner_id.to_owned(),
            holder_id: holder_id.to_owned(),
            acquired_at: now,
            hold_duration,
            metadata,
        })?;
        successor.version = next_version(self.version)?;

        Ok(successor)
    }

    /// Returns the successor record with the expiry pushed to `now + hold_duration`.
    pub fn extended(&self, now: DateTime<Utc>, hold_duration: Duration) -> AppResult<Self> {
        Ok(Self {
            expires_at: deadline_after(now, hold_duration)?,
            version: next_version(self.version)?,
            ..self.clone()
        })
    }

    /// Returns whether the lease is active at `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Returns whether the lease has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_active(now)
    }

    /// Returns whether `owner_id` holds this lease.
    #[must_use]
    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner_id.as_str() == owner_id
    }

    /// Returns remaining active time, if any.
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.expires_at - now).to_std().ok().filter(|value| !value.is_zero())
    }

    /// Returns the resource key.
    #[must_use]
    pub fn key(&self) -> &NonEmptyString {
        &self.key
    }

    /// Returns the acquisition token.
    #[must_use]
    pub fn owner(&self) -> &NonEmptyString {
        &self.owner_id
    }

    /// Returns the instance that holds the lease.
    #[must_use]
    pub fn holder_id(&self) -> &NonEmptyString {
        &self.holder_id
    }

    /// Returns acquisition time.
    #[must_use]
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Returns expiry time.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Returns lease metadata.
    #[must_use]
    pub fn metadata(&self) -> &LeaseMetadata {
        &self.metadata
    }
}

impl StoredRecord for LeaseRecord {
    const NAMESPACE: &'static str = "lease";

    fn version(&self) -> u64 {
        self.version
    }

    fn owner_id(&self) -> Option<&str> {
        Some(self.owner_id.as_str())
    }

    fn sweep_deadline(&self) -> Option<DateTime<Utc>> {
        Some(self.expires_at)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::{LeaseMetadata, LeaseRecord, LeaseRecordInput};
    use crate::StoredRecord;

    fn lease(hold_seconds: u64) -> LeaseRecord {
        let lease = LeaseRecord::new(LeaseRecordInput {
            key: "job-1".to_owned(),
            owner_id: "node-a:token".to_owned(),
            holder_id: "node-a".to_owned(),
            acquired_at: Utc::now(),
            hold_duration: Duration::from_secs(hold_seconds),
            metadata: LeaseMetadata::default(),
        });
        assert!(lease.is_ok());
        lease.unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn lease_requires_positive_hold_duration() {
        let lease = LeaseRecord::new(LeaseRecordInput {
            key: "job-1".to_owned(),
            owner_id: "node-a:token".to_owned(),
            holder_id: "node-a".to_owned(),
            acquired_at: Utc::now(),
            hold_duration: Duration::ZERO,
            metadata: LeaseMetadata::default(),
        });

        assert!(lease.is_err());
    }

    #[test]
    fn lease_is_active_until_expiry() {
        let lease = lease(5);

        assert_eq!(lease.version(), 1);
        assert!(lease.is_active(lease.acquired_at()));
        assert!(lease.is_expired(lease.expires_at()));
        assert_eq!(lease.sweep_deadline(), Some(lease.expires_at()));
    }

    #[test]
    fn takeover_of_active_lease_is_rejected() {
        let lease = lease(5);
        let takeover = lease.taken_over_by(
            "node-b:token",
            "node-b",
            lease.acquired_at(),
            Duration::from_secs(5),
            LeaseMetadata::default(),
        );

        assert!(takeover.is_err());
    }

    #[test]
    fn takeover_of_expired_lease_bumps_version_and_owner() {
        let lease = lease(5);
        let takeover = lease.taken_over_by(
            "node-b:token",
            "node-b",
            lease.expires_at(),
            Duration::from_secs(5),
            LeaseMetadata::default(),
        );

        assert!(takeover.is_ok());
        let takeover = takeover.unwrap_or_else(|_| unreachable!());
        assert_eq!(takeover.version(), 2);
        assert!(takeover.is_owned_by("node-b:token"));
        assert_eq!(takeover.holder_id().as_str(), "node-b");
        assert_eq!(takeover.key(), lease.key());
    }

    #[test]
    fn extension_moves_expiry_and_keeps_owner() {
        let lease = lease(5);
        let later = lease.acquired_at() + chrono::Duration::seconds(3);
        let extended = lease.extended(later, Duration::from_secs(5));

        assert!(extended.is_ok());
        let extended = extended.unwrap_or_else(|_| unreachable!());
        assert_eq!(extended.version(), 2);
        assert_eq!(extended.expires_at(), later + chrono::Duration::seconds(5));
        assert!(extended.is_owned_by("node-a:token"));
    }
}
