//! Redis-backed lease store.
//!
//! Each record lives in one hash (`version`, `owner`, `status`, `payload`).
//! Sorted sets per namespace index the records: one by sweep deadline in epoch
//! milliseconds, one by key for ordered listing, and one per status for
//! status-filtered listing. Every conditional write is a Lua script, so it
//! runs atomically on the server.

use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leasehold_application::{LeaseStore, ensure_version_advances};
use leasehold_core::{AppError, AppResult};
use leasehold_domain::StoredRecord;
use redis::{AsyncCommands, Script};

// Status index keys are derived inside the scripts, so this store needs a
// single-node deployment.
const CREATE_RECORD_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], 'version', ARGV[1], 'owner', ARGV[2], 'payload', ARGV[3], 'status', ARGV[6])
if ARGV[4] ~= '' then
  redis.call('ZADD', KEYS[2], ARGV[4], ARGV[5])
end
redis.call('ZADD', KEYS[3], 0, ARGV[5])
if ARGV[6] ~= '' then
  redis.call('ZADD', ARGV[7] .. ARGV[6], 0, ARGV[5])
end
return 1
"#;

const UPDATE_RECORD_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if not current or current ~= ARGV[1] then
  return 0
end
local previous_status = redis.call('HGET', KEYS[1], 'status')
if previous_status and previous_status ~= '' and previous_status ~= ARGV[7] then
  redis.call('ZREM', ARGV[8] .. previous_status, ARGV[6])
end
redis.call('HSET', KEYS[1], 'version', ARGV[2], 'owner', ARGV[3], 'payload', ARGV[4], 'status', ARGV[7])
if ARGV[5] ~= '' then
  redis.call('ZADD', KEYS[2], ARGV[5], ARGV[6])
else
  redis.call('ZREM', KEYS[2], ARGV[6])
end
if ARGV[7] ~= '' then
  redis.call('ZADD', ARGV[8] .. ARGV[7], 0, ARGV[6])
end
return 1
"#;

const DELETE_IF_OWNER_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'owner') == ARGV[1] then
  local status = redis.call('HGET', KEYS[1], 'status')
  if status and status ~= '' then
    redis.call('ZREM', ARGV[3] .. status, ARGV[2])
  end
  redis.call('DEL', KEYS[1])
  redis.call('ZREM', KEYS[2], ARGV[2])
  redis.call('ZREM', KEYS[3], ARGV[2])
  return 1
end
return 0
"#;

const DELETE_EXPIRED_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
for _, member in ipairs(expired) do
  local status = redis.call('HGET', ARGV[2] .. member, 'status')
  if status and status ~= '' then
    redis.call('ZREM', ARGV[3] .. status, member)
  end
  redis.call('DEL', ARGV[2] .. member)
  redis.call('ZREM', KEYS[1], member)
  redis.call('ZREM', KEYS[2], member)
end
return #expired
"#;

/// Redis implementation of [`LeaseStore`].
pub struct RedisLeaseStore<R> {
    client: redis::Client,
    key_prefix: String,
    record_kind: PhantomData<fn() -> R>,
}

impl<R> Clone for RedisLeaseStore<R> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            key_prefix: self.key_prefix.clone(),
            record_kind: PhantomData,
        }
    }
}

impl<R: StoredRecord> RedisLeaseStore<R> {
    /// Creates one store adapter.
    #[must_use]
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            record_kind: PhantomData,
        }
    }

    fn record_key_prefix(&self) -> String {
        format!("{}:{}:record:", self.key_prefix, R::NAMESPACE)
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}{key}", self.record_key_prefix())
    }

    fn deadline_index_key(&self) -> String {
        format!("{}:{}:deadlines", self.key_prefix, R::NAMESPACE)
    }

    fn key_index_key(&self) -> String {
        format!("{}:{}:keys", self.key_prefix, R::NAMESPACE)
    }

    fn status_index_prefix(&self) -> String {
        format!("{}:{}:status:", self.key_prefix, R::NAMESPACE)
    }

    async fn load_payloads(
        &self,
        connection: &mut redis::aio::MultiplexedConnection,
        keys: &[String],
    ) -> AppResult<Vec<R>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipeline = redis::pipe();
        for key in keys {
            pipeline.hget(self.record_key(key), "payload");
        }
        let payloads: Vec<Option<String>> =
            pipeline.query_async(connection).await.map_err(|error| {
                AppError::StoreUnavailable(format!(
                    "failed to list {} records: {error}",
                    R::NAMESPACE
                ))
            })?;

        keys.iter()
            .zip(payloads)
            .filter_map(|(key, payload)| payload.map(|payload| (key, payload)))
            .map(|(key, payload)| Self::decode(key, payload.as_str()))
            .collect()
    }

    async fn connection(&self) -> AppResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!("failed to connect to redis: {error}"))
            })
    }

    fn decode(key: &str, payload: &str) -> AppResult<R> {
        serde_json::from_str(payload).map_err(|error| {
            AppError::Internal(format!(
                "failed to decode {} record '{key}': {error}",
                R::NAMESPACE
            ))
        })
    }
}

fn encode<R: StoredRecord>(key: &str, record: &R) -> AppResult<String> {
    serde_json::to_string(record).map_err(|error| {
        AppError::Internal(format!(
            "failed to encode {} record '{key}': {error}",
            R::NAMESPACE
        ))
    })
}

fn deadline_score<R: StoredRecord>(record: &R) -> String {
    record
        .sweep_deadline()
        .map(|deadline| deadline.timestamp_millis().to_string())
        .unwrap_or_default()
}

#[async_trait]
impl<R: StoredRecord> LeaseStore<R> for RedisLeaseStore<R> {
    async fn create_if_absent(&self, key: &str, record: R) -> AppResult<bool> {
        let payload = encode(key, &record)?;
        let mut connection = self.connection().await?;

        let created = Script::new(CREATE_RECORD_SCRIPT)
            .key(self.record_key(key))
            .key(self.deadline_index_key())
            .key(self.key_index_key())
            .arg(record.version())
            .arg(record.owner_id().unwrap_or_default())
            .arg(payload)
            .arg(deadline_score(&record))
            .arg(key)
            .arg(record.index_status().unwrap_or_default())
            .arg(self.status_index_prefix())
            .invoke_async::<i32>(&mut connection)
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!(
                    "failed to create {} record '{key}': {error}",
                    R::NAMESPACE
                ))
            })?;

        Ok(created == 1)
    }

    async fn update_if_version_matches(
        &self,
        key: &str,
        expected_version: u64,
        record: R,
    ) -> AppResult<bool> {
        ensure_version_advances(key, expected_version, &record)?;
        let payload = encode(key, &record)?;
        let mut connection = self.connection().await?;

        let replaced = Script::new(UPDATE_RECORD_SCRIPT)
            .key(self.record_key(key))
            .key(self.deadline_index_key())
            .arg(expected_version.to_string())
            .arg(record.version())
            .arg(record.owner_id().unwrap_or_default())
            .arg(payload)
            .arg(deadline_score(&record))
            .arg(key)
            .arg(record.index_status().unwrap_or_default())
            .arg(self.status_index_prefix())
            .invoke_async::<i32>(&mut connection)
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!(
                    "failed to update {} record '{key}': {error}",
                    R::NAMESPACE
                ))
            })?;

        Ok(replaced == 1)
    }

    async fn get(&self, key: &str) -> AppResult<Option<R>> {
        let mut connection = self.connection().await?;
        let payload: Option<String> = connection
            .hget(self.record_key(key), "payload")
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!(
                    "failed to load {} record '{key}': {error}",
                    R::NAMESPACE
                ))
            })?;

        payload
            .map(|payload| Self::decode(key, payload.as_str()))
            .transpose()
    }

    async fn delete_if_owner(&self, key: &str, owner_id: &str) -> AppResult<u64> {
        if owner_id.is_empty() {
            return Ok(0);
        }

        let mut connection = self.connection().await?;
        let deleted = Script::new(DELETE_IF_OWNER_SCRIPT)
            .key(self.record_key(key))
            .key(self.deadline_index_key())
            .key(self.key_index_key())
            .arg(owner_id)
            .arg(key)
            .arg(self.status_index_prefix())
            .invoke_async::<u64>(&mut connection)
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!(
                    "failed to delete {} record '{key}': {error}",
                    R::NAMESPACE
                ))
            })?;

        Ok(deleted)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let mut connection = self.connection().await?;
        Script::new(DELETE_EXPIRED_SCRIPT)
            .key(self.deadline_index_key())
            .key(self.key_index_key())
            .arg(now.timestamp_millis())
            .arg(self.record_key_prefix())
            .arg(self.status_index_prefix())
            .invoke_async::<u64>(&mut connection)
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!(
                    "failed to delete expired {} records: {error}",
                    R::NAMESPACE
                ))
            })
    }

    async fn list(&self, limit: usize) -> AppResult<Vec<R>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut connection = self.connection().await?;
        let stop = isize::try_from(limit).map_or(-1, |limit| limit - 1);
        let keys: Vec<String> = connection
            .zrange(self.key_index_key(), 0, stop)
            .await
            .map_err(|error| {
                AppError::StoreUnavailable(format!(
                    "failed to list {} record keys: {error}",
                    R::NAMESPACE
                ))
            })?;

        self.load_payloads(&mut connection, &keys).await
    }

    async fn list_by_status(&self, statuses: &[&str], limit: usize) -> AppResult<Vec<R>> {
        if statuses.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut connection = self.connection().await?;
        let stop = isize::try_from(limit).map_or(-1, |limit| limit - 1);
        let mut keys = Vec::new();
        for status in statuses {
            let members: Vec<String> = connection
                .zrange(format!("{}{status}", self.status_index_prefix()), 0, stop)
                .await
                .map_err(|error| {
                    AppError::StoreUnavailable(format!(
                        "failed to list {status} {} record keys: {error}",
                        R::NAMESPACE
                    ))
                })?;
            keys.extend(members);
        }

        keys.sort();
        keys.dedup();
        keys.truncate(limit);
        self.load_payloads(&mut connection, &keys).await
    }
}
