use std::time::Duration;

use chrono::{DateTime, Utc};
use leasehold_core::{AppError, AppResult};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Record kept in a lease store under optimistic-concurrency control.
pub trait StoredRecord: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Storage partition shared by every record of this kind.
    const NAMESPACE: &'static str;

    /// Version stamp compared by conditional updates.
    fn version(&self) -> u64;

    /// Identity consulted by owner-conditioned deletes.
    fn owner_id(&self) -> Option<&str>;

    /// Instant after which a cleanup sweep may delete the record.
    fn sweep_deadline(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Lifecycle tag that stores index for `list_by_status`.
    fn index_status(&self) -> Option<&'static str> {
        None
    }
}

/// Returns the version stamp that follows `version`.
pub fn next_version(version: u64) -> AppResult<u64> {
    version
        .checked_add(1)
        .ok_or_else(|| AppError::Validation(format!("version {version} cannot be incremented")))
}

/// Returns `start + duration`, rejecting zero and out-of-range durations.
pub fn deadline_after(start: DateTime<Utc>, duration: Duration) -> AppResult<DateTime<Utc>> {
    if duration.is_zero() {
        return Err(AppError::Validation(
            "lease duration must be greater than zero".to_owned(),
        ));
    }

    let delta = chrono::Duration::from_std(duration).map_err(|error| {
        AppError::Validation(format!("lease duration {duration:?} is out of range: {error}"))
    })?;

    start.checked_add_signed(delta).ok_or_else(|| {
        AppError::Validation(format!(
            "lease duration {duration:?} overflows the timestamp range"
        ))
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::{deadline_after, next_version};

    #[test]
    fn next_version_increments_by_one() {
        assert_eq!(next_version(41).unwrap_or_default(), 42);
        assert!(next_version(u64::MAX).is_err());
    }

    #[test]
    fn deadline_after_rejects_zero_duration() {
        assert!(deadline_after(Utc::now(), Duration::ZERO).is_err());
    }

    #[test]
    fn deadline_after_adds_duration() {
        let now = Utc::now();
        let deadline = deadline_after(now, Duration::from_secs(5));
        assert!(deadline.is_ok());
        assert_eq!(
            deadline.unwrap_or(now) - now,
            chrono::Duration::seconds(5)
        );
    }
}
