//! Application services and ports.

#![forbid(unsafe_code)]

mod backoff;
mod claim_service;
mod health_ports;
mod leader_election_service;
mod lease_store_ports;
mod lock_service;
mod task_handler_registry;

#[cfg(test)]
mod test_support;

pub use backoff::{BackoffPolicy, StoreRetryPolicy};
pub use claim_service::{ClaimEngine, ClaimOptions, ClaimedWorkItem, ProcessingSummary};
pub use health_ports::{AssumeHealthy, NodeHealthCheck};
pub use leader_election_service::{LeaderElectionOptions, LeaderElector};
pub use lease_store_ports::{LeaseStore, ensure_version_advances};
pub use lock_service::{
    LockGuard, LockHandle, LockManager, LockManagerOptions, LockRequest, LockStatistics,
};
pub use task_handler_registry::{TaskHandler, TaskHandlerRegistry};
