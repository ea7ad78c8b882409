//! Shared primitives for all Rust crates in Leasehold.

#![forbid(unsafe_code)]

/// Time sources used for lease arithmetic.
pub mod clock;

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use clock::{Clock, ManualClock, SystemClock};

/// Result type used across Leasehold crates.
pub type AppResult<T> = Result<T, AppError>;

/// A validated non-empty UTF-8 string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NonEmptyString(String);

impl NonEmptyString {
    /// Creates a validated non-empty string.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(AppError::Validation(
                "value must not be empty or whitespace".to_owned(),
            ));
        }

        Ok(Self(value))
    }

    /// Returns the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<NonEmptyString> for String {
    fn from(value: NonEmptyString) -> Self {
        value.0
    }
}

impl Display for NonEmptyString {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

/// Identity of one running process instance competing for shared work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(NonEmptyString);

impl InstanceId {
    /// Creates an instance identifier from a configured value.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        let value = NonEmptyString::new(value).map_err(|_| {
            AppError::Validation("instance id must not be empty".to_owned())
        })?;

        Ok(Self(value))
    }

    /// Generates a random instance identifier with the given prefix.
    #[must_use]
    pub fn generate(prefix: &str) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        let prefix = if prefix.trim().is_empty() {
            "instance"
        } else {
            prefix.trim()
        };

        Self(NonEmptyString(format!("{prefix}-{}", &suffix[..8])))
    }

    /// Returns the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Creates a token unique to one acquisition by this instance.
    #[must_use]
    pub fn acquisition_token(&self) -> String {
        format!("{}:{}", self.as_str(), Uuid::new_v4())
    }
}

impl Display for InstanceId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Common application error categories.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid input or violated invariant.
    #[error("validation error: {0}")]
    Validation(String),

    /// Requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Write operation conflicts with existing state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Transient I/O failure talking to the shared lease store.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Every optimistic claim attempt on a work item lost the race.
    #[error("claim exhausted: {0}")]
    ClaimExhausted(String),

    /// This instance is no longer the authoritative leader.
    #[error("leadership lost: {0}")]
    LeadershipLost(String),

    /// Internal unexpected error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns true when the error is transient and the call may be retried.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}
