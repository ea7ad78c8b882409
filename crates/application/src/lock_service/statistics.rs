use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time lock counters for one manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockStatistics {
    /// Successful acquisitions, takeovers included.
    pub acquisitions: u64,
    /// Acquisitions that replaced an expired lease.
    pub takeovers: u64,
    /// Releases that deleted a lease.
    pub releases: u64,
    /// Acquisitions that gave up after the wait timeout.
    pub timeouts: u64,
    /// Store errors surfaced to callers.
    pub failures: u64,
}

#[derive(Debug, Default)]
pub(super) struct LockCounters {
    acquisitions: AtomicU64,
    takeovers: AtomicU64,
    releases: AtomicU64,
    timeouts: AtomicU64,
    failures: AtomicU64,
}

impl LockCounters {
    pub(super) fn record_acquisition(&self, takeover: bool) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        if takeover {
            self.takeovers.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(super) fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn snapshot(&self) -> LockStatistics {
        LockStatistics {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            takeovers: self.takeovers.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
