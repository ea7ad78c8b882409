//! Leasehold coordination worker runtime.

#![forbid(unsafe_code)]

mod config;
mod log_message_handler;

use std::sync::Arc;
use std::time::Duration;

use leasehold_application::{
    AssumeHealthy, ClaimEngine, ClaimOptions, LeaderElectionOptions, LeaderElector, LeaseStore,
    LockManager, LockManagerOptions, NodeHealthCheck, TaskHandlerRegistry,
};
use leasehold_core::{AppError, AppResult, Clock, InstanceId, SystemClock};
use leasehold_domain::{LeaderRecord, LeaseRecord, WorkItem, WorkItemInput};
use leasehold_infrastructure::{
    HttpNodeHealthCheck, InMemoryLeaseStore, NodeHealthStatus, PostgresLeaseStore,
    PostgresNodeHealthRegistry, RedisLeaseStore,
};
use serde_json::json;
use sqlx::PgPool;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{StoreBackend, WorkerConfig};
use crate::log_message_handler::{LOG_MESSAGE_TASK, LogMessageHandler};

static MIGRATOR: Migrator = sqlx::migrate!("../../crates/infrastructure/migrations");

const SCHEDULER_LOCK_KEY: &str = "leasehold:scheduler";

struct Backend {
    locks: Arc<dyn LeaseStore<LeaseRecord>>,
    work_items: Arc<dyn LeaseStore<WorkItem>>,
    leaders: Arc<dyn LeaseStore<LeaderRecord>>,
    heartbeat_registry: Option<PostgresNodeHealthRegistry>,
}

type WorkerTask = (&'static str, JoinHandle<AppResult<()>>);

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::load()?;
    let backend = build_backend(&config).await?;
    let health_check = build_health_check(&config, &backend)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let lock_manager = LockManager::new(
        backend.locks.clone(),
        clock.clone(),
        config.worker_id.clone(),
        LockManagerOptions::default(),
    )?;
    let claim_engine = ClaimEngine::new(
        backend.work_items.clone(),
        clock.clone(),
        config.worker_id.clone(),
        ClaimOptions {
            max_attempts: config.claim_max_attempts,
            ..ClaimOptions::default()
        },
    )?;
    let elector = LeaderElector::new(
        backend.leaders.clone(),
        health_check,
        clock,
        config.worker_id.clone(),
        config.service_name.as_str(),
        LeaderElectionOptions {
            lease_duration: config.leader_lease,
            heartbeat_interval: config.leader_heartbeat,
            ..LeaderElectionOptions::default()
        },
    )?;

    let mut registry = TaskHandlerRegistry::new();
    registry.register(LOG_MESSAGE_TASK, Arc::new(LogMessageHandler))?;

    seed_work_items(&claim_engine, config.seed_items).await?;

    info!(
        worker_id = %config.worker_id,
        store = config.store.as_str(),
        service_name = %config.service_name,
        task_types = ?registry.task_types(),
        "leasehold worker started"
    );

    let (shutdown_sender, shutdown) = watch::channel(false);
    let mut tasks: Vec<WorkerTask> = Vec::new();

    if let Some(heartbeat_registry) = backend.heartbeat_registry.clone() {
        tasks.push((
            "node_heartbeat",
            tokio::spawn(run_node_heartbeat(
                heartbeat_registry,
                config.worker_id.clone(),
                config.leader_heartbeat,
                shutdown.clone(),
            )),
        ));
    }

    let election = elector.clone();
    let election_shutdown = shutdown.clone();
    tasks.push((
        "leader_election",
        tokio::spawn(async move { election.run(election_shutdown).await }),
    ));

    tasks.push((
        "scheduler",
        tokio::spawn(run_scheduler(
            elector,
            lock_manager.clone(),
            claim_engine.clone(),
            config.clone(),
            shutdown.clone(),
        )),
    ));

    tasks.push((
        "claim_loop",
        tokio::spawn(run_claim_loop(
            claim_engine,
            registry,
            config.claim_batch_limit,
            config.poll_interval,
            shutdown,
        )),
    ));

    tokio::signal::ctrl_c().await.map_err(|error| {
        AppError::Internal(format!("failed to listen for shutdown signal: {error}"))
    })?;
    info!("shutdown requested");
    let _ = shutdown_sender.send(true);

    for (name, task) in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(task = name, error = %error, "worker task ended with error"),
            Err(error) => warn!(task = name, error = %error, "worker task aborted"),
        }
    }

    let statistics = lock_manager.statistics();
    info!(
        acquisitions = statistics.acquisitions,
        takeovers = statistics.takeovers,
        releases = statistics.releases,
        timeouts = statistics.timeouts,
        failures = statistics.failures,
        "leasehold worker stopped"
    );

    Ok(())
}

async fn build_backend(config: &WorkerConfig) -> AppResult<Backend> {
    match &config.store {
        StoreBackend::Memory => {
            warn!("in-memory lease store coordinates only tasks inside this process");
            Ok(Backend {
                locks: Arc::new(InMemoryLeaseStore::<LeaseRecord>::new()),
                work_items: Arc::new(InMemoryLeaseStore::<WorkItem>::new()),
                leaders: Arc::new(InMemoryLeaseStore::<LeaderRecord>::new()),
                heartbeat_registry: None,
            })
        }
        StoreBackend::Postgres { database_url } => {
            let pool = connect_pool(database_url.as_str()).await?;
            MIGRATOR.run(&pool).await.map_err(|error| {
                AppError::Internal(format!("failed to run lease store migrations: {error}"))
            })?;

            Ok(Backend {
                locks: Arc::new(PostgresLeaseStore::<LeaseRecord>::new(pool.clone())),
                work_items: Arc::new(PostgresLeaseStore::<WorkItem>::new(pool.clone())),
                leaders: Arc::new(PostgresLeaseStore::<LeaderRecord>::new(pool.clone())),
                heartbeat_registry: Some(PostgresNodeHealthRegistry::new(
                    pool,
                    config.health_stale_after,
                )),
            })
        }
        StoreBackend::Redis { redis_url } => {
            let client = redis::Client::open(redis_url.as_str()).map_err(|error| {
                AppError::Validation(format!("invalid REDIS_URL value: {error}"))
            })?;
            let prefix = config.key_prefix.as_str();

            Ok(Backend {
                locks: Arc::new(RedisLeaseStore::<LeaseRecord>::new(client.clone(), prefix)),
                work_items: Arc::new(RedisLeaseStore::<WorkItem>::new(client.clone(), prefix)),
                leaders: Arc::new(RedisLeaseStore::<LeaderRecord>::new(client, prefix)),
                heartbeat_registry: None,
            })
        }
    }
}

fn build_health_check(
    config: &WorkerConfig,
    backend: &Backend,
) -> AppResult<Arc<dyn NodeHealthCheck>> {
    if let Some(base_url) = &config.health_check_url {
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|error| AppError::Internal(format!("failed to build http client: {error}")))?;
        return Ok(Arc::new(HttpNodeHealthCheck::new(
            http_client,
            base_url.as_str(),
            Duration::from_secs(2),
        )));
    }

    if let Some(registry) = &backend.heartbeat_registry {
        return Ok(Arc::new(registry.clone()));
    }

    Ok(Arc::new(AssumeHealthy))
}

async fn connect_pool(database_url: &str) -> AppResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .map_err(|error| AppError::Internal(format!("failed to connect to database: {error}")))
}

async fn seed_work_items(claim_engine: &ClaimEngine, count: usize) -> AppResult<()> {
    for index in 0..count {
        let item_id = format!("seed-{}-{index}", claim_engine.worker_id());
        claim_engine
            .submit(WorkItemInput {
                id: item_id,
                task_type: LOG_MESSAGE_TASK.to_owned(),
                payload: json!({ "message": format!("seed item {index}") }),
                version: 1,
                max_retries: 3,
            })
            .await?;
    }

    if count > 0 {
        info!(count, "seeded work items");
    }

    Ok(())
}

async fn run_node_heartbeat(
    registry: PostgresNodeHealthRegistry,
    node_id: InstanceId,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> AppResult<()> {
    loop {
        if let Err(error) = registry
            .record_heartbeat(node_id.as_str(), NodeHealthStatus::Healthy)
            .await
        {
            warn!(node_id = %node_id, error = %error, "node heartbeat failed");
        }

        if wait_or_shutdown(&mut shutdown, interval).await {
            return Ok(());
        }
    }
}

async fn run_scheduler(
    elector: LeaderElector,
    lock_manager: LockManager,
    claim_engine: ClaimEngine,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> AppResult<()> {
    loop {
        if wait_or_shutdown(&mut shutdown, config.poll_interval).await {
            return Ok(());
        }

        if elector.ensure_leader().is_err() {
            continue;
        }

        match lock_manager.cleanup_expired_locks().await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "expired locks removed"),
            Err(error) => warn!(error = %error, "expired lock cleanup failed"),
        }

        match claim_engine.recover_stuck(config.stuck_claim_after).await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered, "stuck claims released"),
            Err(error) => warn!(error = %error, "stuck claim recovery failed"),
        }

        let outcome = lock_manager
            .execute_with_lock(SCHEDULER_LOCK_KEY, config.lock_hold, config.lock_wait, || {
                schedule_tick(&elector, &claim_engine)
            })
            .await;

        match outcome {
            Ok(Some(item_id)) => info!(item_id = %item_id, generation = elector.generation(), "tick scheduled"),
            Ok(None) => warn!(key = SCHEDULER_LOCK_KEY, "scheduler lock busy"),
            Err(AppError::LeadershipLost(reason)) => warn!(reason = %reason, "tick skipped"),
            Err(error) => warn!(error = %error, "tick scheduling failed"),
        }
    }
}

async fn schedule_tick(elector: &LeaderElector, claim_engine: &ClaimEngine) -> AppResult<String> {
    elector.confirm_leadership().await?;

    let item_id = format!("tick-{}", uuid::Uuid::new_v4());
    claim_engine
        .submit(WorkItemInput {
            id: item_id.clone(),
            task_type: LOG_MESSAGE_TASK.to_owned(),
            payload: json!({
                "message": format!(
                    "tick from {} in generation {}",
                    elector.node_id(),
                    elector.generation()
                ),
            }),
            version: 1,
            max_retries: 3,
        })
        .await?;

    Ok(item_id)
}

async fn run_claim_loop(
    claim_engine: ClaimEngine,
    registry: TaskHandlerRegistry,
    batch_limit: usize,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> AppResult<()> {
    loop {
        let claimed = match claim_engine.process_available(batch_limit, &registry).await {
            Ok(summary) => {
                if summary.claimed > 0 || summary.skipped > 0 {
                    info!(
                        claimed = summary.claimed,
                        completed = summary.completed,
                        retrying = summary.retrying,
                        failed = summary.failed,
                        skipped = summary.skipped,
                        "claim pass finished"
                    );
                }
                summary.claimed
            }
            Err(error) => {
                warn!(error = %error, "claim pass failed");
                0
            }
        };

        if claimed == 0 && wait_or_shutdown(&mut shutdown, poll_interval).await {
            return Ok(());
        }

        if *shutdown.borrow() {
            return Ok(());
        }
    }
}

/// Sleeps for `delay`; returns true once shutdown was requested.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}
