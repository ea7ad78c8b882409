use async_trait::async_trait;
use leasehold_application::TaskHandler;
use leasehold_domain::{TaskFailure, WorkItem};
use tracing::info;

/// Task type handled by [`LogMessageHandler`].
pub const LOG_MESSAGE_TASK: &str = "log_message";

/// Logs `payload.message` for each claimed item.
///
/// Items without a string message fail permanently.
pub struct LogMessageHandler;

#[async_trait]
impl TaskHandler for LogMessageHandler {
    async fn handle(&self, item: &WorkItem) -> Result<(), TaskFailure> {
        let Some(message) = item
            .payload()
            .get("message")
            .and_then(serde_json::Value::as_str)
        else {
            return Err(TaskFailure::permanent(
                "log_message payload requires a string 'message'",
            ));
        };

        info!(
            item_id = %item.id(),
            retry_count = item.retry_count(),
            message,
            "work item message"
        );
        Ok(())
    }
}
