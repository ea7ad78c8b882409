use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use leasehold_core::{AppError, InstanceId, ManualClock};
use leasehold_domain::LeaseRecord;

use crate::test_support::FakeLeaseStore;

use super::{LockManager, LockManagerOptions, LockRequest};

const HOLD: Duration = Duration::from_secs(5);

fn manager(
    store: &Arc<FakeLeaseStore<LeaseRecord>>,
    clock: &Arc<ManualClock>,
    instance: &str,
) -> LockManager {
    let instance_id = InstanceId::new(instance).unwrap_or_else(|_| unreachable!());
    let manager = LockManager::new(
        store.clone(),
        clock.clone(),
        instance_id,
        LockManagerOptions::default(),
    );
    assert!(manager.is_ok());
    manager.unwrap_or_else(|_| unreachable!())
}

fn fixture() -> (Arc<FakeLeaseStore<LeaseRecord>>, Arc<ManualClock>) {
    (
        Arc::new(FakeLeaseStore::new()),
        Arc::new(ManualClock::starting_now()),
    )
}

#[tokio::test(start_paused = true)]
async fn second_acquirer_times_out_while_first_holds() {
    let (store, clock) = fixture();
    let first = manager(&store, &clock, "node-a");
    let second = manager(&store, &clock, "node-b");

    let (left, right) = tokio::join!(
        first.acquire_lock("job-1", HOLD, Duration::from_secs(2)),
        second.acquire_lock("job-1", HOLD, Duration::from_secs(2)),
    );

    assert!(left.is_ok() && right.is_ok());
    let left = left.unwrap_or_else(|_| unreachable!());
    let right = right.unwrap_or_else(|_| unreachable!());
    assert!(left.is_some() ^ right.is_some());

    let timeouts = first.statistics().timeouts + second.statistics().timeouts;
    assert_eq!(timeouts, 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_acquirers_never_overlap() {
    let (store, clock) = fixture();
    let inside = Arc::new(AtomicU32::new(0));
    let overlaps = Arc::new(AtomicU32::new(0));
    let completed = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for index in 0..8 {
        let manager = manager(&store, &clock, &format!("node-{index}"));
        let inside = Arc::clone(&inside);
        let overlaps = Arc::clone(&overlaps);
        let completed = Arc::clone(&completed);

        tasks.push(tokio::spawn(async move {
            manager
                .execute_with_lock("shared", HOLD, Duration::from_secs(30), || async {
                    if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
        }));
    }

    for task in tasks {
        let result = task.await;
        assert!(matches!(result, Ok(Ok(Some(())))));
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(completed.load(Ordering::SeqCst), 8);
}

#[tokio::test(start_paused = true)]
async fn expired_lock_is_taken_over() {
    let (store, clock) = fixture();
    let crashed = manager(&store, &clock, "node-a");
    let survivor = manager(&store, &clock, "node-b");

    let stale = crashed.acquire_lock("job-1", HOLD, Duration::ZERO).await;
    assert!(matches!(stale, Ok(Some(_))));
    let stale = stale.unwrap_or_else(|_| unreachable!());

    clock.advance(Duration::from_secs(6));
    let fresh = survivor.acquire_lock("job-1", HOLD, Duration::ZERO).await;

    assert!(matches!(fresh, Ok(Some(_))));
    let fresh = fresh
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());
    assert_eq!(fresh.version(), 2);
    assert_eq!(survivor.statistics().takeovers, 1);

    // The crashed owner's late release must not revoke the new owner.
    let stale = stale.unwrap_or_else(|| unreachable!());
    assert!(matches!(crashed.release(&stale).await, Ok(false)));
    assert!(matches!(survivor.is_lock_held("job-1").await, Ok(true)));
}

#[tokio::test(start_paused = true)]
async fn takeover_whose_acknowledgement_was_lost_is_kept() {
    let (store, clock) = fixture();
    let crashed = manager(&store, &clock, "node-a");
    let survivor = manager(&store, &clock, "node-b");

    assert!(matches!(
        crashed.acquire_lock("job-1", HOLD, Duration::ZERO).await,
        Ok(Some(_))
    ));
    clock.advance(Duration::from_secs(6));

    store.lose_next_update_acks(1);
    let fresh = survivor.acquire_lock("job-1", HOLD, Duration::ZERO).await;

    assert!(matches!(fresh, Ok(Some(_))));
    let fresh = fresh
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());
    assert_eq!(fresh.version(), 2);
    assert_eq!(survivor.statistics().takeovers, 1);
    assert!(matches!(survivor.is_lock_held("job-1").await, Ok(true)));
    assert!(matches!(survivor.release(&fresh).await, Ok(true)));
}

#[tokio::test]
async fn release_is_idempotent() {
    let (store, clock) = fixture();
    let manager = manager(&store, &clock, "node-a");

    let handle = manager
        .acquire_lock("job-1", HOLD, Duration::ZERO)
        .await
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());

    assert!(matches!(manager.release(&handle).await, Ok(true)));
    assert!(matches!(manager.release(&handle).await, Ok(false)));
    assert_eq!(manager.statistics().releases, 1);
}

#[tokio::test]
async fn same_instance_reacquisition_is_not_revoked_by_old_handle() {
    let (store, clock) = fixture();
    let manager = manager(&store, &clock, "node-a");

    let first = manager
        .acquire_lock("job-1", HOLD, Duration::ZERO)
        .await
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());
    assert!(matches!(manager.release(&first).await, Ok(true)));

    let second = manager.acquire_lock("job-1", HOLD, Duration::ZERO).await;
    assert!(matches!(second, Ok(Some(_))));

    assert!(matches!(manager.release(&first).await, Ok(false)));
    assert!(matches!(manager.is_lock_held("job-1").await, Ok(true)));
}

#[tokio::test(start_paused = true)]
async fn zero_wait_makes_exactly_one_attempt() {
    let (store, clock) = fixture();
    let holder = manager(&store, &clock, "node-a");
    let contender = manager(&store, &clock, "node-b");

    assert!(matches!(
        holder.acquire_lock("job-1", HOLD, Duration::ZERO).await,
        Ok(Some(_))
    ));

    let started = tokio::time::Instant::now();
    let result = contender.acquire_lock("job-1", HOLD, Duration::ZERO).await;

    assert!(matches!(result, Ok(None)));
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(contender.statistics().timeouts, 1);
}

#[tokio::test]
async fn extend_moves_expiry_for_current_owner_only() {
    let (store, clock) = fixture();
    let owner = manager(&store, &clock, "node-a");
    let other = manager(&store, &clock, "node-b");

    let mut handle = owner
        .acquire_lock("job-1", HOLD, Duration::ZERO)
        .await
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());
    let first_expiry = handle.expires_at();

    clock.advance(Duration::from_secs(3));
    assert!(matches!(owner.extend_lock(&mut handle, HOLD).await, Ok(true)));
    assert_eq!(
        handle.expires_at() - first_expiry,
        chrono::Duration::seconds(3)
    );
    assert_eq!(handle.version(), 2);

    clock.advance(Duration::from_secs(6));
    assert!(matches!(
        other.acquire_lock("job-1", HOLD, Duration::ZERO).await,
        Ok(Some(_))
    ));
    assert!(matches!(owner.extend_lock(&mut handle, HOLD).await, Ok(false)));
}

#[tokio::test]
async fn execute_with_lock_releases_after_failed_action() {
    let (store, clock) = fixture();
    let manager = manager(&store, &clock, "node-a");

    let result: Result<Option<()>, AppError> = manager
        .execute_with_lock("job-1", HOLD, Duration::ZERO, || async {
            Err(AppError::Internal("downstream exploded".to_owned()))
        })
        .await;

    assert!(matches!(result, Err(AppError::Internal(_))));
    assert!(matches!(manager.is_lock_held("job-1").await, Ok(false)));
}

#[tokio::test]
async fn execute_with_lock_skips_action_when_lock_is_busy() {
    let (store, clock) = fixture();
    let holder = manager(&store, &clock, "node-a");
    let contender = manager(&store, &clock, "node-b");
    let runs = AtomicU32::new(0);

    assert!(matches!(
        holder.acquire_lock("job-1", HOLD, Duration::ZERO).await,
        Ok(Some(_))
    ));

    let result = contender
        .execute_with_lock("job-1", HOLD, Duration::ZERO, || async {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

    assert!(matches!(result, Ok(None)));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn dropped_guard_releases_lock() {
    let (store, clock) = fixture();
    let manager = manager(&store, &clock, "node-a");

    let guard = manager
        .lock_guard(LockRequest::new("job-1", HOLD, Duration::ZERO))
        .await;
    assert!(matches!(guard, Ok(Some(_))));
    drop(guard);

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert!(matches!(manager.is_lock_held("job-1").await, Ok(false)));
}

#[tokio::test]
async fn lock_info_reports_request_metadata() {
    let (store, clock) = fixture();
    let manager = manager(&store, &clock, "node-a");

    let request = LockRequest::new("report-2024-06", HOLD, Duration::ZERO)
        .with_task_type("monthly_report")
        .with_description("June billing report");
    assert!(matches!(
        manager.acquire_lock_with(request).await,
        Ok(Some(_))
    ));

    let info = manager.lock_info("report-2024-06").await;
    assert!(info.is_ok());
    let info = info
        .unwrap_or_else(|_| unreachable!())
        .unwrap_or_else(|| unreachable!());
    assert_eq!(info.metadata().task_type.as_deref(), Some("monthly_report"));
    assert_eq!(info.holder_id().as_str(), "node-a");

    clock.advance(HOLD);
    assert!(matches!(manager.lock_info("report-2024-06").await, Ok(None)));
}

#[tokio::test]
async fn cleanup_removes_only_expired_locks() {
    let (store, clock) = fixture();
    let manager = manager(&store, &clock, "node-a");

    assert!(matches!(
        manager
            .acquire_lock("short", Duration::from_secs(1), Duration::ZERO)
            .await,
        Ok(Some(_))
    ));
    assert!(matches!(
        manager
            .acquire_lock("long", Duration::from_secs(60), Duration::ZERO)
            .await,
        Ok(Some(_))
    ));

    clock.advance(Duration::from_secs(2));

    assert!(matches!(manager.cleanup_expired_locks().await, Ok(1)));
    assert!(store.snapshot("short").await.is_none());
    assert!(store.snapshot("long").await.is_some());
}

#[tokio::test(start_paused = true)]
async fn transient_store_failures_are_retried() {
    let (store, clock) = fixture();
    let manager = manager(&store, &clock, "node-a");

    store.fail_next(2);
    assert!(matches!(
        manager.acquire_lock("job-1", HOLD, Duration::ZERO).await,
        Ok(Some(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn persistent_store_failure_surfaces_and_is_counted() {
    let (store, clock) = fixture();
    let manager = manager(&store, &clock, "node-a");

    store.fail_next(10);
    let result = manager.acquire_lock("job-1", HOLD, Duration::ZERO).await;

    assert!(matches!(result, Err(AppError::StoreUnavailable(_))));
    assert_eq!(manager.statistics().failures, 1);
}

#[test]
fn options_reject_zero_poll_interval() {
    let options = LockManagerOptions {
        poll_interval: Duration::ZERO,
        ..LockManagerOptions::default()
    };

    assert!(options.validate().is_err());
}
