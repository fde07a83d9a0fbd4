//! End-to-end ownership scenarios against the in-memory store fake
//! (spec.md §8 S1-S3, plus the idempotence laws of §8).
use std::sync::Arc;
use std::time::Duration;

use coordinator_common::ids::{IssueId, ProcessId};
use coordinator_common::types::{OwnershipStatus, WaitPriority};
use coordinator_core::events::CoordinatorEvent;
use coordinator_core::ownership::{NoopIssueTracker, OwnershipConfig, OwnershipCoordinator};
use coordinator_core::waiting::DeadlockDetector;
use coordinator_store::StoreClient;

fn test_config() -> OwnershipConfig {
    OwnershipConfig {
        lock_ttl: Duration::from_secs(300),
        heartbeat_ttl: Duration::from_millis(20),
        checkout_timeout: Duration::from_secs(5),
        orphan_scan_interval: Duration::from_secs(300),
        reconcile_labels: false,
    }
}

fn new_coordinator() -> (OwnershipCoordinator, tokio::sync::mpsc::UnboundedReceiver<CoordinatorEvent>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let store = Arc::new(StoreClient::in_memory());
    let deadlock = Arc::new(DeadlockDetector::new(tx.clone()));
    let coordinator = OwnershipCoordinator::new(store, test_config(), Arc::new(NoopIssueTracker), tx, deadlock);
    (coordinator, rx)
}

/// S1: happy path. checkout succeeds, checkin(completed) succeeds, the
/// issue lands in the processed set and leaves the processing set, and a
/// `task.completed` event fires.
#[tokio::test]
async fn s1_happy_path() {
    let (coordinator, mut events) = new_coordinator();
    let issue = IssueId::new("42");
    let worker = ProcessId::new("worker-1");

    let ownership = coordinator
        .checkout(issue.clone(), worker.clone(), 1000, "lint", WaitPriority::Normal)
        .await
        .unwrap();
    assert_eq!(ownership.status, OwnershipStatus::Processing);

    let processing = coordinator.list_processing().await.unwrap();
    assert_eq!(processing.len(), 1);
    assert_eq!(processing[0].issue_id, issue);

    coordinator
        .checkin(issue.clone(), worker.clone(), OwnershipStatus::Completed, Default::default())
        .await
        .unwrap();

    assert!(coordinator.list_processing().await.unwrap().is_empty());

    let mut saw_completed = false;
    while let Ok(event) = events.try_recv() {
        if let CoordinatorEvent::TaskCompleted { issue_id, .. } = event {
            assert_eq!(issue_id, issue);
            saw_completed = true;
        }
    }
    assert!(saw_completed, "expected a task.completed event");
}

/// S2: contention. Two workers race to checkout the same issue; exactly
/// one succeeds and the other gets `ConflictError` immediately (not a
/// blocking wait) so the daemon can hand it a different task right away.
#[tokio::test]
async fn s2_contention_yields_exactly_one_winner() {
    let (coordinator, _events) = new_coordinator();
    let issue = IssueId::new("42");
    let w1 = ProcessId::new("worker-1");
    let w2 = ProcessId::new("worker-2");

    coordinator
        .checkout(issue.clone(), w1.clone(), 1000, "lint", WaitPriority::Normal)
        .await
        .unwrap();

    let err = coordinator
        .checkout(issue.clone(), w2.clone(), 2000, "lint", WaitPriority::Normal)
        .await
        .unwrap_err();
    assert!(matches!(err, coordinator_common::CoordinatorError::Conflict(_)));

    // the winner still owns the issue; checking out again is a no-op success
    // (idempotent if the same process re-requests the issue it already owns).
    let again = coordinator
        .checkout(issue.clone(), w1.clone(), 1000, "lint", WaitPriority::Normal)
        .await
        .unwrap();
    assert_eq!(again.owner, w1);
}

/// S3: orphan. A worker checks out an issue and never checks in; once its
/// heartbeat TTL lapses, the next orphan sweep repairs it to `error` and a
/// subsequent checkout by another worker succeeds.
#[tokio::test]
async fn s3_orphan_sweep_repairs_dead_worker() {
    let (coordinator, mut events) = new_coordinator();
    let issue = IssueId::new("99");
    let dead_worker = ProcessId::new("worker-dead");

    coordinator
        .checkout(issue.clone(), dead_worker.clone(), 999_999, "lint", WaitPriority::Normal)
        .await
        .unwrap();

    // let the (very short, test-only) heartbeat TTL lapse without a
    // heartbeat() call, simulating the worker having crashed.
    tokio::time::sleep(Duration::from_millis(40)).await;

    let orphans = coordinator.scan_orphans().await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].issue_id, issue);

    let mut saw_orphan_event = false;
    while let Ok(event) = events.try_recv() {
        if let CoordinatorEvent::OrphanRepaired { issue_id, reason, .. } = event {
            assert_eq!(issue_id, issue);
            assert_eq!(reason, "process died unexpectedly");
            saw_orphan_event = true;
        }
    }
    assert!(saw_orphan_event);

    assert!(coordinator.list_processing().await.unwrap().is_empty());

    let other_worker = ProcessId::new("worker-2");
    let ownership = coordinator
        .checkout(issue.clone(), other_worker.clone(), 1001, "lint", WaitPriority::Normal)
        .await
        .unwrap();
    assert_eq!(ownership.owner, other_worker);
}

/// Idempotence: `heartbeat` applied repeatedly within the TTL window is
/// observationally equivalent to applying it once (spec.md §8).
#[tokio::test]
async fn heartbeat_is_idempotent_within_ttl() {
    let (coordinator, _events) = new_coordinator();
    let process = ProcessId::new("worker-1");

    coordinator.register_process(&process, 123, coordinator_common::types::ProcessRole::Worker).await.unwrap();

    for _ in 0..5 {
        coordinator.heartbeat(&process).await.unwrap();
    }

    let active = coordinator.list_active_processes().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].process_id, process);
}

/// Idempotence: a second `checkin` by the recorded owner after the first
/// already transitioned the issue to a terminal state must not double the
/// side effect — it is rejected as `NotOwner`/`InvalidTransition` since the
/// issue is no longer `processing`.
#[tokio::test]
async fn checkin_twice_is_rejected_the_second_time() {
    let (coordinator, _events) = new_coordinator();
    let issue = IssueId::new("7");
    let worker = ProcessId::new("worker-1");

    coordinator
        .checkout(issue.clone(), worker.clone(), 1, "lint", WaitPriority::Normal)
        .await
        .unwrap();
    coordinator
        .checkin(issue.clone(), worker.clone(), OwnershipStatus::Completed, Default::default())
        .await
        .unwrap();

    let err = coordinator
        .checkin(issue.clone(), worker.clone(), OwnershipStatus::Completed, Default::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        coordinator_common::CoordinatorError::NotOwner(_)
            | coordinator_common::CoordinatorError::InvalidTransition(_)
    ));
}

/// `checkin` by a process that never owned the issue is rejected.
#[tokio::test]
async fn checkin_by_non_owner_is_rejected() {
    let (coordinator, _events) = new_coordinator();
    let issue = IssueId::new("8");
    let owner = ProcessId::new("worker-1");
    let impostor = ProcessId::new("worker-2");

    coordinator
        .checkout(issue.clone(), owner.clone(), 1, "lint", WaitPriority::Normal)
        .await
        .unwrap();

    let err = coordinator
        .checkin(issue.clone(), impostor, OwnershipStatus::Completed, Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, coordinator_common::CoordinatorError::NotOwner(_)));
}

/// `cleanup_process` checks in whatever the process was holding as an
/// error and clears its process/heartbeat records.
#[tokio::test]
async fn cleanup_process_releases_held_issue() {
    let (coordinator, _events) = new_coordinator();
    let issue = IssueId::new("55");
    let worker = ProcessId::new("worker-1");

    coordinator
        .checkout(issue.clone(), worker.clone(), 1, "lint", WaitPriority::Normal)
        .await
        .unwrap();

    coordinator.cleanup_process(&worker).await.unwrap();

    assert!(coordinator.list_processing().await.unwrap().is_empty());
    assert!(coordinator.list_active_processes().await.unwrap().is_empty());

    // the issue is free again for another worker.
    let other = ProcessId::new("worker-2");
    let ownership = coordinator
        .checkout(issue, other.clone(), 2, "lint", WaitPriority::Normal)
        .await
        .unwrap();
    assert_eq!(ownership.owner, other);
}
