//! Backoff schedules and store-call retries.

use std::future::Future;
use std::time::Duration;

use leasehold_core::{AppError, AppResult};
use tracing::warn;

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Upper bound applied before jitter.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Validates policy bounds.
    pub fn validate(&self) -> AppResult<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(AppError::Validation(format!(
                "backoff multiplier must be a finite value >= 1.0, got {}",
                self.multiplier
            )));
        }

        if self.max_delay < self.base_delay {
            return Err(AppError::Validation(
                "backoff max_delay must not be smaller than base_delay".to_owned(),
            ));
        }

        Ok(())
    }

    /// Returns the delay after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let seconds = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);

        if !seconds.is_finite() || seconds >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        Duration::from_secs_f64(seconds).min(self.max_delay)
    }

    /// Returns [`Self::delay`] plus uniform jitter in `[0, delay / 2]`.
    #[must_use]
    pub fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        delay + uniform_duration(delay / 2)
    }
}

/// Returns a uniformly distributed duration in `[0, upper]`.
///
/// Falls back to zero when the entropy source is unavailable.
pub(crate) fn uniform_duration(upper: Duration) -> Duration {
    let upper_nanos = u64::try_from(upper.as_nanos()).unwrap_or(u64::MAX);
    if upper_nanos == 0 {
        return Duration::ZERO;
    }

    let mut bytes = [0_u8; 8];
    if getrandom::fill(&mut bytes).is_err() {
        return Duration::ZERO;
    }

    let sample = u64::from_le_bytes(bytes) % upper_nanos.saturating_add(1);
    Duration::from_nanos(sample)
}

/// Retry policy wrapped around every lease store call.
///
/// Only [`AppError::StoreUnavailable`] is retried.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreRetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    /// Delay schedule between attempts.
    pub backoff: BackoffPolicy,
}

impl Default for StoreRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(50),
                multiplier: 2.0,
                max_delay: Duration::from_secs(1),
            },
        }
    }
}

impl StoreRetryPolicy {
    /// Policy performing exactly one attempt.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Validates policy bounds.
    pub fn validate(&self) -> AppResult<()> {
        if self.max_attempts == 0 {
            return Err(AppError::Validation(
                "store retry max_attempts must be greater than zero".to_owned(),
            ));
        }

        self.backoff.validate()
    }

    /// Runs `call`, retrying transient store failures.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Err(error) if error.is_retriable() && attempt < self.max_attempts => {
                    let delay = self.backoff.jittered(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "lease store call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use leasehold_core::AppError;

    use super::{BackoffPolicy, StoreRetryPolicy, uniform_duration};

    #[test]
    fn delay_grows_exponentially_until_cap() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(350));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_half_delay() {
        let policy = BackoffPolicy::default();

        for attempt in 1..=6 {
            let delay = policy.delay(attempt);
            let jittered = policy.jittered(attempt);
            assert!(jittered >= delay);
            assert!(jittered <= delay + delay / 2);
        }
    }

    #[test]
    fn uniform_duration_of_zero_is_zero() {
        assert_eq!(uniform_duration(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn validation_rejects_shrinking_multiplier() {
        let policy = BackoffPolicy {
            multiplier: 0.5,
            ..BackoffPolicy::default()
        };

        assert!(policy.validate().is_err());
        assert!(BackoffPolicy::default().validate().is_ok());
        assert!(
            StoreRetryPolicy {
                max_attempts: 0,
                ..StoreRetryPolicy::default()
            }
            .validate()
            .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_retries_only_store_unavailable() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = StoreRetryPolicy::default();

        let counter = Arc::clone(&calls);
        let result = policy
            .run("get", || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(AppError::StoreUnavailable("connection reset".to_owned()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.ok(), Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        calls.store(0, Ordering::SeqCst);
        let counter = Arc::clone(&calls);
        let result: Result<u32, AppError> = policy
            .run("get", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::Validation("bad key".to_owned()))
                }
            })
            .await;

        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), AppError> = StoreRetryPolicy::default()
            .run("get", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::StoreUnavailable("down".to_owned()))
                }
            })
            .await;

        assert!(matches!(result, Err(AppError::StoreUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
