use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leasehold_application::{LeaseStore, ensure_version_advances};
use leasehold_core::{AppError, AppResult};
use leasehold_domain::StoredRecord;
use serde_json::Value;
use sqlx::{FromRow, PgPool};

use crate::postgres_errors::store_error;


/// PostgreSQL-backed lease store over the `lease_records` table.
///
/// Records of one kind share a namespace; conditional writes rely on single
/// statement atomicity.
pub struct PostgresLeaseStore<R> {
    pool: PgPool,
    record_kind: PhantomData<fn() -> R>,
}

impl<R> Clone for PostgresLeaseStore<R> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            record_kind: PhantomData,
        }
    }
}

impl<R: StoredRecord> PostgresLeaseStore<R> {
    /// Creates a lease store with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            record_kind: PhantomData,
        }
    }
}

#[derive(Debug, FromRow)]
struct LeaseRecordRow {
    key: String,
    payload: Value,
}

fn stored_version(key: &str, version: u64) -> AppResult<i64> {
    i64::try_from(version).map_err(|error| {
        AppError::Validation(format!("version {version} of record '{key}' is out of range: {error}"))
    })
}

fn encode<R: StoredRecord>(key: &str, record: &R) -> AppResult<Value> {
    serde_json::to_value(record).map_err(|error| {
        AppError::Internal(format!(
            "failed to encode {} record '{key}': {error}",
            R::NAMESPACE
        ))
    })
}

fn decode<R: StoredRecord>(row: LeaseRecordRow) -> AppResult<R> {
    serde_json::from_value(row.payload).map_err(|error| {
        AppError::Internal(format!(
            "failed to decode {} record '{}': {error}",
            R::NAMESPACE,
            row.key
        ))
    })
}

#[async_trait]
impl<R: StoredRecord> LeaseStore<R> for PostgresLeaseStore<R> {
    async fn create_if_absent(&self, key: &str, record: R) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO lease_records (
                namespace,
                key,
                owner_id,
                version,
                sweep_deadline,
                status,
                payload,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, now(), now())
            ON CONFLICT (namespace, key)
            DO NOTHING
            "#,
        )
        .bind(R::NAMESPACE)
        .bind(key)
        .bind(record.owner_id())
        .bind(stored_version(key, record.version())?)
        .bind(record.sweep_deadline())
        .bind(record.index_status())
        .bind(encode(key, &record)?)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            store_error(error, &format!("create {} record '{key}'", R::NAMESPACE))
        })?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_if_version_matches(
        &self,
        key: &str,
        expected_version: u64,
        record: R,
    ) -> AppResult<bool> {
        ensure_version_advances(key, expected_version, &record)?;

        let result = sqlx::query(
            r#"
            UPDATE lease_records
            SET
                owner_id = $4,
                version = $5,
                sweep_deadline = $6,
                status = $7,
                payload = $8,
                updated_at = now()
            WHERE namespace = $1
              AND key = $2
              AND version = $3
            "#,
        )
        .bind(R::NAMESPACE)
        .bind(key)
        .bind(stored_version(key, expected_version)?)
        .bind(record.owner_id())
        .bind(stored_version(key, record.version())?)
        .bind(record.sweep_deadline())
        .bind(record.index_status())
        .bind(encode(key, &record)?)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            store_error(error, &format!("update {} record '{key}'", R::NAMESPACE))
        })?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, key: &str) -> AppResult<Option<R>> {
        let row = sqlx::query_as::<_, LeaseRecordRow>(
            r#"
            SELECT key, payload
            FROM lease_records
            WHERE namespace = $1 AND key = $2
            "#,
        )
        .bind(R::NAMESPACE)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| {
            store_error(error, &format!("load {} record '{key}'", R::NAMESPACE))
        })?;

        row.map(decode).transpose()
    }

    async fn delete_if_owner(&self, key: &str, owner_id: &str) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM lease_records
            WHERE namespace = $1 AND key = $2 AND owner_id = $3
            "#,
        )
        .bind(R::NAMESPACE)
        .bind(key)
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            store_error(error, &format!("delete {} record '{key}'", R::NAMESPACE))
        })?;

        Ok(result.rows_affected())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM lease_records
            WHERE namespace = $1
              AND sweep_deadline IS NOT NULL
              AND sweep_deadline < $2
            "#,
        )
        .bind(R::NAMESPACE)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            store_error(error, &format!("delete expired {} records", R::NAMESPACE))
        })?;

        Ok(result.rows_affected())
    }

    async fn list(&self, limit: usize) -> AppResult<Vec<R>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, LeaseRecordRow>(
            r#"
            SELECT key, payload
            FROM lease_records
            WHERE namespace = $1
            ORDER BY key ASC
            LIMIT $2
            "#,
        )
        .bind(R::NAMESPACE)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| {
            store_error(error, &format!("list {} records", R::NAMESPACE))
        })?;

        rows.into_iter().map(decode).collect()
    }

    async fn list_by_status(&self, statuses: &[&str], limit: usize) -> AppResult<Vec<R>> {
        if statuses.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let statuses: Vec<String> = statuses.iter().map(|status| (*status).to_owned()).collect();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, LeaseRecordRow>(
            r#"
            SELECT key, payload
            FROM lease_records
            WHERE namespace = $1
              AND status = ANY($2)
            ORDER BY key ASC
            LIMIT $3
            "#,
        )
        .bind(R::NAMESPACE)
        .bind(statuses)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| {
            store_error(error, &format!("list {} records by status", R::NAMESPACE))
        })?;

        rows.into_iter().map(decode).collect()
    }
}
