use std::time::Duration;

use async_trait::async_trait;
use leasehold_application::NodeHealthCheck;
use leasehold_core::{AppError, AppResult};
use tracing::debug;

/// Node health check against an HTTP endpoint.
///
/// Requests `GET {base_url}/{node_id}`; any 2xx answer means healthy and any
/// other status means unhealthy. Transport failures are returned as errors.
pub struct HttpNodeHealthCheck {
    http_client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpNodeHealthCheck {
    /// Creates a health check rooted at `base_url`.
    #[must_use]
    pub fn new(
        http_client: reqwest::Client,
        base_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            request_timeout: request_timeout.max(Duration::from_millis(50)),
        }
    }

    fn endpoint_for(&self, node_id: &str) -> String {
        format!("{}/{node_id}", self.base_url)
    }
}

#[async_trait]
impl NodeHealthCheck for HttpNodeHealthCheck {
    async fn is_node_healthy(&self, node_id: &str) -> AppResult<bool> {
        if node_id.trim().is_empty() {
            return Err(AppError::Validation(
                "health check node_id must not be empty".to_owned(),
            ));
        }

        let endpoint = self.endpoint_for(node_id);
        let response = self
            .http_client
            .get(endpoint.as_str())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|error| {
                AppError::Internal(format!(
                    "health check request to '{endpoint}' failed: {error}"
                ))
            })?;

        let status = response.status();
        debug!(node_id, status = status.as_u16(), "node health checked");
        Ok(status.is_success())
    }
}
