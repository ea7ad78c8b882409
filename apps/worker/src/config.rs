use std::env;
use std::time::Duration;

use leasehold_core::{AppError, AppResult, InstanceId};

/// Backing store selected with `LEASEHOLD_STORE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres { database_url: String },
    Redis { redis_url: String },
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
            Self::Redis { .. } => "redis",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: InstanceId,
    pub store: StoreBackend,
    pub key_prefix: String,
    pub service_name: String,
    pub leader_lease: Duration,
    pub leader_heartbeat: Duration,
    pub lock_hold: Duration,
    pub lock_wait: Duration,
    pub claim_batch_limit: usize,
    pub claim_max_attempts: u32,
    pub poll_interval: Duration,
    pub health_stale_after: Duration,
    pub stuck_claim_after: Duration,
    pub health_check_url: Option<String>,
    pub seed_items: usize,
}

impl WorkerConfig {
    pub fn load() -> AppResult<Self> {
        let worker_id = match optional_env("WORKER_ID") {
            Some(value) => InstanceId::new(value)?,
            None => InstanceId::generate("worker"),
        };
        let store = match optional_env("LEASEHOLD_STORE")
            .unwrap_or_else(|| "memory".to_owned())
            .as_str()
        {
            "memory" => StoreBackend::Memory,
            "postgres" => StoreBackend::Postgres {
                database_url: required_env("DATABASE_URL")?,
            },
            "redis" => StoreBackend::Redis {
                redis_url: required_env("REDIS_URL")?,
            },
            other => {
                return Err(AppError::Validation(format!(
                    "invalid LEASEHOLD_STORE value '{other}', expected memory, postgres or redis"
                )));
            }
        };
        let key_prefix = optional_env("LEASEHOLD_KEY_PREFIX").unwrap_or_else(|| "leasehold".to_owned());
        let service_name =
            optional_env("LEASEHOLD_SERVICE_NAME").unwrap_or_else(|| "leasehold-scheduler".to_owned());
        let leader_lease_seconds = parse_env_u64("LEADER_LEASE_SECONDS", 15)?;
        let leader_heartbeat_ms = parse_env_u64("LEADER_HEARTBEAT_MS", 5_000)?;
        let lock_hold_seconds = parse_env_u64("LOCK_HOLD_SECONDS", 30)?;
        let lock_wait_ms = parse_env_u64("LOCK_WAIT_MS", 2_000)?;
        let claim_batch_limit = parse_env_usize("CLAIM_BATCH_LIMIT", 10)?;
        let claim_max_attempts = parse_env_u32("CLAIM_MAX_ATTEMPTS", 3)?;
        let poll_interval_ms = parse_env_u64("POLL_INTERVAL_MS", 1_500)?;
        let health_stale_seconds = parse_env_u64(
            "HEALTH_STALE_SECONDS",
            (leader_heartbeat_ms * 3).div_ceil(1_000),
        )?;
        let stuck_claim_seconds = parse_env_u64("STUCK_CLAIM_SECONDS", 300)?;
        let health_check_url = optional_env("HEALTH_CHECK_URL");
        let seed_items = parse_env_usize("WORKER_SEED_ITEMS", 0)?;

        for (name, value) in [
            ("LEADER_LEASE_SECONDS", leader_lease_seconds),
            ("LEADER_HEARTBEAT_MS", leader_heartbeat_ms),
            ("LOCK_HOLD_SECONDS", lock_hold_seconds),
            ("POLL_INTERVAL_MS", poll_interval_ms),
            ("HEALTH_STALE_SECONDS", health_stale_seconds),
            ("STUCK_CLAIM_SECONDS", stuck_claim_seconds),
        ] {
            if value == 0 {
                return Err(AppError::Validation(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if claim_batch_limit == 0 {
            return Err(AppError::Validation(
                "CLAIM_BATCH_LIMIT must be greater than zero".to_owned(),
            ));
        }

        if claim_max_attempts == 0 {
            return Err(AppError::Validation(
                "CLAIM_MAX_ATTEMPTS must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            worker_id,
            store,
            key_prefix,
            service_name,
            leader_lease: Duration::from_secs(leader_lease_seconds),
            leader_heartbeat: Duration::from_millis(leader_heartbeat_ms),
            lock_hold: Duration::from_secs(lock_hold_seconds),
            lock_wait: Duration::from_millis(lock_wait_ms),
            claim_batch_limit,
            claim_max_attempts,
            poll_interval: Duration::from_millis(poll_interval_ms),
            health_stale_after: Duration::from_secs(health_stale_seconds),
            stuck_claim_after: Duration::from_secs(stuck_claim_seconds),
            health_check_url,
            seed_items,
        })
    }
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn required_env(name: &str) -> AppResult<String> {
    env::var(name).map_err(|_| AppError::Validation(format!("{name} is required")))
}

fn parse_env_usize(name: &str, default: usize) -> AppResult<usize> {
    match env::var(name) {
        Ok(value) => value.parse::<usize>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> AppResult<u32> {
    match env::var(name) {
        Ok(value) => value.parse::<u32>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_u64(name: &str, default: u64) -> AppResult<u64> {
    match env::var(name) {
        Ok(value) => value.parse::<u64>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}
