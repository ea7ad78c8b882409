use std::time::Duration;

use chrono::{DateTime, Utc};
use leasehold_core::{AppError, AppResult, NonEmptyString};
use serde::{Deserialize, Serialize};

use crate::record::{StoredRecord, deadline_after, next_version};

/// Role an elector instance currently plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderRole {
    /// Not the leader.
    Follower,
    /// Holds the leadership lease.
    Leader,
}

impl LeaderRole {
    /// Returns stable log value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follower => "follower",
            Self::Leader => "leader",
        }
    }
}

/// Input payload used to restore a leader record as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderRecordInput {
    /// Coordinated service name.
    pub service_name: String,
    /// Current leader, `None` for a vacancy.
    pub leader_id: Option<String>,
    /// Leadership term.
    pub generation: u64,
    /// Version stamp.
    pub version: u64,
    /// Leadership lease expiry.
    pub lease_expires_at: DateTime<Utc>,
    /// Last successful renewal.
    pub last_heartbeat_at: DateTime<Utc>,
}

/// Singleton leadership record per service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
    service_name: NonEmptyString,
    leader_id: Option<NonEmptyString>,
    generation: u64,
    version: u64,
    lease_expires_at: DateTime<Utc>,
    last_heartbeat_at: DateTime<Utc>,
}

impl LeaderRecord {
    /// Restores a record from its persisted fields.
    pub fn new(input: LeaderRecordInput) -> AppResult<Self> {
        let service_name = NonEmptyString::new(input.service_name).map_err(|_| {
            AppError::Validation("leader service_name must not be empty".to_owned())
        })?;
        let leader_id = input
            .leader_id
            .map(NonEmptyString::new)
            .transpose()
            .map_err(|_| AppError::Validation("leader_id must not be empty".to_owned()))?;

        if input.generation == 0 {
            return Err(AppError::Validation(
                "leader generation must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            service_name,
            leader_id,
            generation: input.generation,
            version: input.version,
            lease_expires_at: input.lease_expires_at,
            last_heartbeat_at: input.last_heartbeat_at,
        })
    }

    /// Creates the record for the very first leader of a service.
    pub fn first_term(
        service_name: &str,
        leader_id: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> AppResult<Self> {
        Self::new(LeaderRecordInput {
            service_name: service_name.to_owned(),
            leader_id: Some(leader_id.to_owned()),
            generation: 1,
            version: 1,
            lease_expires_at: deadline_after(now, lease_duration)?,
            last_heartbeat_at: now,
        })
    }

    /// Returns the successor record after the current leader renews its lease.
    pub fn renewed(&self, now: DateTime<Utc>, lease_duration: Duration) -> AppResult<Self> {
        if self.leader_id.is_none() {
            return Err(AppError::Validation(format!(
                "service '{}' has no leader to renew",
                self.service_name
            )));
        }

        Ok(Self {
            version: next_version(self.version)?,
            lease_expires_at: deadline_after(now, lease_duration)?,
            last_heartbeat_at: now,
            ..self.clone()
        })
    }

    /// Returns the successor record electing `leader_id`.
    ///
    /// Claiming an expired term starts a new generation. Claiming a vacancy
    /// takes the generation the vacancy already reserved.
    pub fn succeeded_by(
        &self,
        leader_id: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> AppResult<Self> {
        if let Some(current) = self.active_leader(now) {
            return Err(AppError::Validation(format!(
                "service '{}' is still led by '{current}' until {}",
                self.service_name, self.lease_expires_at
            )));
        }

        let generation = if self.is_vacant() {
            self.generation
        } else {
            next_version(self.generation)?
        };

        Self::new(LeaderRecordInput {
            service_name: self.service_name.as_str().to_owned(),
            leader_id: Some(leader_id.to_owned()),
            generation,
            version: next_version(self.version)?,
            lease_expires_at: deadline_after(now, lease_duration)?,
            last_heartbeat_at: now,
        })
    }

    /// Returns the vacated successor record, ending the current term at `now`.
    pub fn vacated(&self, now: DateTime<Utc>) -> AppResult<Self> {
        if self.is_vacant() {
            return Err(AppError::Validation(format!(
                "service '{}' is already vacant",
                self.service_name
            )));
        }

        Ok(Self {
            leader_id: None,
            generation: next_version(self.generation)?,
            version: next_version(self.version)?,
            lease_expires_at: now,
            ..self.clone()
        })
    }

    /// Returns the authoritative leader at `now`.
    #[must_use]
    pub fn active_leader(&self, now: DateTime<Utc>) -> Option<&str> {
        self.leader_id
            .as_ref()
            .filter(|_| now < self.lease_expires_at)
            .map(NonEmptyString::as_str)
    }

    /// Returns whether `node_id` is named as leader, regardless of expiry.
    #[must_use]
    pub fn is_led_by(&self, node_id: &str) -> bool {
        self.leader_id.as_ref().map(NonEmptyString::as_str) == Some(node_id)
    }

    /// Returns whether the record holds no leader.
    #[must_use]
    pub fn is_vacant(&self) -> bool {
        self.leader_id.is_none()
    }

    /// Returns whether the leadership lease has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.lease_expires_at
    }

    /// Returns service name.
    #[must_use]
    pub fn service_name(&self) -> &NonEmptyString {
        &self.service_name
    }

    /// Returns named leader, if any.
    #[must_use]
    pub fn leader_id(&self) -> Option<&str> {
        self.leader_id.as_ref().map(NonEmptyString::as_str)
    }

    /// Returns leadership term.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns lease expiry.
    #[must_use]
    pub fn lease_expires_at(&self) -> DateTime<Utc> {
        self.lease_expires_at
    }

    /// Returns last renewal time.
    #[must_use]
    pub fn last_heartbeat_at(&self) -> DateTime<Utc> {
        self.last_heartbeat_at
    }
}

impl StoredRecord for LeaderRecord {
    const NAMESPACE: &'static str = "leader";

    fn version(&self) -> u64 {
        self.version
    }

    fn owner_id(&self) -> Option<&str> {
        self.leader_id()
    }
}
