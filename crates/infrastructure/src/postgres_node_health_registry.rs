use std::time::Duration;

use async_trait::async_trait;
use leasehold_application::NodeHealthCheck;
use leasehold_core::{AppError, AppResult};
use sqlx::{FromRow, PgPool};
use tracing::debug;

use crate::postgres_errors::store_error;

/// Self-reported node condition stored with each heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeHealthStatus {
    /// Fully operational.
    Healthy,
    /// Operational with reduced capacity.
    Degraded,
    /// Not able to serve.
    Unhealthy,
}

impl NodeHealthStatus {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }

    /// Parses storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "healthy" => Ok(Self::Healthy),
            "degraded" => Ok(Self::Degraded),
            "unhealthy" => Ok(Self::Unhealthy),
            _ => Err(AppError::Validation(format!(
                "unknown node health status '{value}'"
            ))),
        }
    }

    /// Returns whether a node in this status may keep leadership.
    #[must_use]
    pub fn can_lead(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

/// PostgreSQL heartbeat table used as a node health source.
///
/// A node is healthy when its latest heartbeat is fresher than the staleness
/// window and reports `healthy` or `degraded`. Unknown nodes are unhealthy.
#[derive(Clone)]
pub struct PostgresNodeHealthRegistry {
    pool: PgPool,
    staleness_window: Duration,
}

#[derive(Debug, FromRow)]
struct NodeHeartbeatRow {
    status: String,
    is_fresh: bool,
}

impl PostgresNodeHealthRegistry {
    /// Creates a registry treating heartbeats older than `staleness_window` as stale.
    #[must_use]
    pub fn new(pool: PgPool, staleness_window: Duration) -> Self {
        Self {
            pool,
            staleness_window,
        }
    }

    /// Records a heartbeat for `node_id`.
    pub async fn record_heartbeat(&self, node_id: &str, status: NodeHealthStatus) -> AppResult<()> {
        if node_id.trim().is_empty() {
            return Err(AppError::Validation(
                "node heartbeat node_id must not be empty".to_owned(),
            ));
        }

        sqlx::query(
            r#"
            INSERT INTO node_heartbeats (
                node_id,
                status,
                last_seen_at,
                updated_at
            )
            VALUES ($1, $2, now(), now())
            ON CONFLICT (node_id)
            DO UPDATE SET
                status = EXCLUDED.status,
                last_seen_at = now(),
                updated_at = now()
            "#,
        )
        .bind(node_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|error| store_error(error, &format!("upsert node heartbeat for '{node_id}'")))?;

        Ok(())
    }
}

#[async_trait]
impl NodeHealthCheck for PostgresNodeHealthRegistry {
    async fn is_node_healthy(&self, node_id: &str) -> AppResult<bool> {
        let row = sqlx::query_as::<_, NodeHeartbeatRow>(
            r#"
            SELECT
                status,
                last_seen_at >= now() - make_interval(secs => $2::DOUBLE PRECISION) AS is_fresh
            FROM node_heartbeats
            WHERE node_id = $1
            "#,
        )
        .bind(node_id)
        .bind(self.staleness_window.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| store_error(error, &format!("load node heartbeat for '{node_id}'")))?;

        let Some(row) = row else {
            debug!(node_id, "no heartbeat recorded");
            return Ok(false);
        };

        let status = NodeHealthStatus::parse(row.status.as_str())?;
        Ok(row.is_fresh && status.can_lead())
    }
}
