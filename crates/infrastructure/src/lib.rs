//! Infrastructure adapters.

#![forbid(unsafe_code)]

mod http_node_health_check;
mod in_memory_lease_store;
mod postgres_errors;
mod postgres_lease_store;
mod postgres_node_health_registry;
mod redis_lease_store;

pub use http_node_health_check::HttpNodeHealthCheck;
pub use in_memory_lease_store::InMemoryLeaseStore;
pub use postgres_lease_store::PostgresLeaseStore;
pub use postgres_node_health_registry::{NodeHealthStatus, PostgresNodeHealthRegistry};
pub use redis_lease_store::RedisLeaseStore;
