use async_trait::async_trait;
use leasehold_core::AppResult;

/// External collaborator reporting whether a node is alive.
#[async_trait]
pub trait NodeHealthCheck: Send + Sync {
    /// Returns whether `node_id` is healthy enough to keep leadership.
    async fn is_node_healthy(&self, node_id: &str) -> AppResult<bool>;
}

/// Health check that reports every node healthy.
///
/// Leadership then changes hands only through lease expiry or step-down.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeHealthy;

#[async_trait]
impl NodeHealthCheck for AssumeHealthy {
    async fn is_node_healthy(&self, _node_id: &str) -> AppResult<bool> {
        Ok(true)
    }
}
