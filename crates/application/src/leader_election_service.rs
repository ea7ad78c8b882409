use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use leasehold_core::{AppError, AppResult, Clock, InstanceId, NonEmptyString};
use leasehold_domain::{LeaderRecord, LeaderRole, StoredRecord};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backoff::{StoreRetryPolicy, uniform_duration};
use crate::health_ports::NodeHealthCheck;
use crate::lease_store_ports::LeaseStore;


/// Tunables for leader election.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeaderElectionOptions {
    /// Lifetime of one leadership lease.
    pub lease_duration: Duration,
    /// Interval between heartbeat ticks in [`LeaderElector::run`].
    pub heartbeat_interval: Duration,
    /// Lower bound of the randomized wait before contesting an open term.
    pub pre_election_delay_min: Duration,
    /// Upper bound of the randomized wait before contesting an open term.
    pub pre_election_delay_max: Duration,
    /// Retry policy for transient store failures.
    pub store_retry: StoreRetryPolicy,
}

impl Default for LeaderElectionOptions {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(5),
            pre_election_delay_min: Duration::from_millis(100),
            pre_election_delay_max: Duration::from_millis(500),
            store_retry: StoreRetryPolicy::default(),
        }
    }
}

impl LeaderElectionOptions {
    /// Validates option bounds.
    pub fn validate(&self) -> AppResult<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(AppError::Validation(
                "heartbeat_interval must be greater than zero".to_owned(),
            ));
        }

        if self.lease_duration <= self.heartbeat_interval {
            return Err(AppError::Validation(format!(
                "lease_duration {:?} must be longer than heartbeat_interval {:?}",
                self.lease_duration, self.heartbeat_interval
            )));
        }

        if self.pre_election_delay_min > self.pre_election_delay_max {
            return Err(AppError::Validation(
                "pre_election_delay_min must not exceed pre_election_delay_max".to_owned(),
            ));
        }

        self.store_retry.validate()
    }

    fn pre_election_delay(&self) -> Duration {
        self.pre_election_delay_min
            + uniform_duration(self.pre_election_delay_max - self.pre_election_delay_min)
    }
}

#[derive(Debug, Default)]
struct ElectorState {
    leader: AtomicBool,
    electing: AtomicBool,
    generation: AtomicU64,
    version: AtomicU64,
    lease_expires_millis: AtomicI64,
}

/// Resets the `electing` flag even when the election future is dropped.
struct ElectionGuard<'a>(&'a AtomicBool);

impl Drop for ElectionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Lease-based single-leader election for one service.
#[derive(Clone)]
pub struct LeaderElector {
    store: Arc<dyn LeaseStore<LeaderRecord>>,
    health_check: Arc<dyn NodeHealthCheck>,
    clock: Arc<dyn Clock>,
    node_id: InstanceId,
    service_name: NonEmptyString,
    options: LeaderElectionOptions,
    state: Arc<ElectorState>,
}

impl LeaderElector {
    /// Creates an elector for `service_name`.
    pub fn new(
        store: Arc<dyn LeaseStore<LeaderRecord>>,
        health_check: Arc<dyn NodeHealthCheck>,
        clock: Arc<dyn Clock>,
        node_id: InstanceId,
        service_name: &str,
        options: LeaderElectionOptions,
    ) -> AppResult<Self> {
        options.validate()?;
        let service_name = NonEmptyString::new(service_name).map_err(|_| {
            AppError::Validation("leader election service_name must not be empty".to_owned())
        })?;

        Ok(Self {
            store,
            health_check,
            clock,
            node_id,
            service_name,
            options,
            state: Arc::new(ElectorState::default()),
        })
    }

    /// Returns this node's identity.
    #[must_use]
    pub fn node_id(&self) -> &InstanceId {
        &self.node_id
    }

    /// Returns the coordinated service name.
    #[must_use]
    pub fn service_name(&self) -> &str {
        self.service_name.as_str()
    }

    /// Returns the generation of the last term this node held, or zero.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.generation.load(Ordering::Acquire)
    }

    /// Returns whether this node leads and its cached lease is still valid.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.state.leader.load(Ordering::Acquire)
            && self.clock.now().timestamp_millis()
                < self.state.lease_expires_millis.load(Ordering::Acquire)
    }

    /// Fails with [`AppError::LeadershipLost`] unless this node leads.
    ///
    /// Answers from the cached term. A node deposed by a failover keeps
    /// passing this check until its next heartbeat, at most one heartbeat
    /// interval; use [`LeaderElector::confirm_leadership`] before work that
    /// must not run twice.
    pub fn ensure_leader(&self) -> AppResult<()> {
        if self.is_leader() {
            return Ok(());
        }

        Err(AppError::LeadershipLost(format!(
            "node '{}' is not the leader of '{}'",
            self.node_id, self.service_name
        )))
    }

    /// Like [`LeaderElector::ensure_leader`], but re-reads the store.
    ///
    /// Demotes this node when the stored record names another term.
    pub async fn confirm_leadership(&self) -> AppResult<()> {
        self.ensure_leader()?;

        let now = self.clock.now();
        let confirmed = self
            .fetch()
            .await?
            .is_some_and(|record| self.holds_cached_term(&record) && !record.is_expired(now));
        if confirmed {
            return Ok(());
        }

        self.demote("superseded in store");
        Err(AppError::LeadershipLost(format!(
            "node '{}' no longer holds the recorded term of '{}'",
            self.node_id, self.service_name
        )))
    }

    /// Returns the authoritative leader recorded in the store.
    pub async fn current_leader(&self) -> AppResult<Option<String>> {
        let now = self.clock.now();
        Ok(self
            .fetch()
            .await?
            .and_then(|record| record.active_leader(now).map(str::to_owned)))
    }

    /// Performs one heartbeat tick and returns the resulting role.
    ///
    /// Leaders renew their lease. Followers contest open terms and force a
    /// failover away from a leader reported unhealthy.
    pub async fn heartbeat(&self) -> AppResult<LeaderRole> {
        if self.state.leader.load(Ordering::Acquire) {
            return self.renew().await;
        }

        if self
            .state
            .electing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(LeaderRole::Follower);
        }
        let _guard = ElectionGuard(&self.state.electing);

        self.try_become_leader().await
    }

    /// Gives up leadership by vacating the record.
    ///
    /// Returns false when this node was not leading.
    pub async fn step_down(&self) -> AppResult<bool> {
        if !self.state.leader.load(Ordering::Acquire) {
            return Ok(false);
        }

        let now = self.clock.now();
        let vacated = match self.fetch().await? {
            Some(record) if self.holds_cached_term(&record) => {
                let vacated = record.vacated(now)?;
                self.replace(&record, vacated).await?
            }
            _ => false,
        };

        self.demote("stepped down");
        Ok(vacated)
    }

    /// Runs heartbeat ticks until `shutdown` turns true, then steps down.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        let mut ticker = tokio::time::interval(self.options.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            node_id = %self.node_id,
            service_name = %self.service_name,
            "leader election started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.heartbeat().await {
                        Ok(role) => debug!(node_id = %self.node_id, role = role.as_str(), "heartbeat"),
                        Err(error) => warn!(node_id = %self.node_id, error = %error, "heartbeat failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.step_down().await?;
        info!(node_id = %self.node_id, "leader election stopped");
        Ok(())
    }

    async fn renew(&self) -> AppResult<LeaderRole> {
        let now = self.clock.now();
        if let Some(record) = self.fetch().await?
            && self.holds_cached_term(&record)
        {
            let renewed = record.renewed(now, self.options.lease_duration)?;
            if self.replace(&record, renewed.clone()).await? {
                self.promote(&renewed);
                return Ok(LeaderRole::Leader);
            }
        }

        self.demote("lease renewal rejected");
        Ok(LeaderRole::Follower)
    }

    async fn try_become_leader(&self) -> AppResult<LeaderRole> {
        let now = self.clock.now();
        let observed = self.fetch().await?;

        if let Some(record) = &observed
            && let Some(leader_id) = record.active_leader(now)
        {
            if leader_id == self.node_id.as_str() {
                // Left over from an earlier run of this node; adopt it.
                return self.claim_term(observed.as_ref()).await;
            }

            if self.is_healthy(leader_id).await {
                return Ok(LeaderRole::Follower);
            }

            return self.force_failover(record).await;
        }

        tokio::time::sleep(self.options.pre_election_delay()).await;
        let observed = self.fetch().await?;
        if observed
            .as_ref()
            .and_then(|record| record.active_leader(self.clock.now()))
            .is_some()
        {
            return Ok(LeaderRole::Follower);
        }

        self.claim_term(observed.as_ref()).await
    }

    async fn claim_term(&self, observed: Option<&LeaderRecord>) -> AppResult<LeaderRole> {
        let now = self.clock.now();
        let lease_duration = self.options.lease_duration;

        let claimed = match observed {
            None => {
                let record = LeaderRecord::first_term(
                    self.service_name.as_str(),
                    self.node_id.as_str(),
                    now,
                    lease_duration,
                )?;
                let key = self.service_name.as_str();
                let created = self
                    .options
                    .store_retry
                    .run("create_if_absent", || {
                        self.store.create_if_absent(key, record.clone())
                    })
                    .await?;
                created.then_some(record)
            }
            Some(existing) if existing.is_led_by(self.node_id.as_str()) => {
                let renewed = existing.renewed(now, lease_duration)?;
                self.replace(existing, renewed.clone())
                    .await?
                    .then_some(renewed)
            }
            Some(existing) => {
                let successor = existing.succeeded_by(self.node_id.as_str(), now, lease_duration)?;
                self.replace(existing, successor.clone())
                    .await?
                    .then_some(successor)
            }
        };

        match claimed {
            Some(record) => {
                self.promote(&record);
                Ok(LeaderRole::Leader)
            }
            None => {
                debug!(node_id = %self.node_id, "lost election race");
                Ok(LeaderRole::Follower)
            }
        }
    }

    async fn force_failover(&self, record: &LeaderRecord) -> AppResult<LeaderRole> {
        let vacated = record.vacated(self.clock.now())?;
        if !self.replace(record, vacated.clone()).await? {
            return Ok(LeaderRole::Follower);
        }

        warn!(
            node_id = %self.node_id,
            service_name = %self.service_name,
            previous_leader = record.leader_id().unwrap_or_default(),
            generation = vacated.generation(),
            "forced failover from unhealthy leader"
        );

        self.claim_term(Some(&vacated)).await
    }

    async fn is_healthy(&self, node_id: &str) -> bool {
        match self.health_check.is_node_healthy(node_id).await {
            Ok(healthy) => healthy,
            Err(error) => {
                warn!(node_id, error = %error, "leader health unknown, assuming healthy");
                true
            }
        }
    }

    fn holds_cached_term(&self, record: &LeaderRecord) -> bool {
        record.is_led_by(self.node_id.as_str())
            && record.generation() == self.state.generation.load(Ordering::Acquire)
            && record.version() == self.state.version.load(Ordering::Acquire)
    }

    fn promote(&self, record: &LeaderRecord) {
        self.state
            .generation
            .store(record.generation(), Ordering::Release);
        self.state.version.store(record.version(), Ordering::Release);
        self.state.lease_expires_millis.store(
            record.lease_expires_at().timestamp_millis(),
            Ordering::Release,
        );

        if !self.state.leader.swap(true, Ordering::AcqRel) {
            info!(
                node_id = %self.node_id,
                service_name = %self.service_name,
                generation = record.generation(),
                lease_expires_at = %record.lease_expires_at(),
                "acquired leadership"
            );
        }
    }

    fn demote(&self, reason: &str) {
        self.state
            .lease_expires_millis
            .store(DateTime::<Utc>::MIN_UTC.timestamp_millis(), Ordering::Release);

        if self.state.leader.swap(false, Ordering::AcqRel) {
            warn!(
                node_id = %self.node_id,
                service_name = %self.service_name,
                generation = self.generation(),
                reason,
                "leadership lost"
            );
        }
    }

    async fn replace(&self, current: &LeaderRecord, next: LeaderRecord) -> AppResult<bool> {
        let key = self.service_name.as_str();
        self.options
            .store_retry
            .run("update_if_version_matches", || {
                self.store
                    .update_if_version_matches(key, current.version(), next.clone())
            })
            .await
    }

    async fn fetch(&self) -> AppResult<Option<LeaderRecord>> {
        let key = self.service_name.as_str();
        self.options
            .store_retry
            .run("get", || self.store.get(key))
            .await
    }
}
