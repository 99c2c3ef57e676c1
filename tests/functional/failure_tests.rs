//! Platform errors, cancellation, validation and concurrent reconciles.

use std::time::Duration;

use redis_cluster_operator::controller::error::Error;
use redis_cluster_operator::controller::reconciler::{ReconcileSettings, Reconciler};
use redis_cluster_operator::crd::RedisClusterStatus;
use tokio_util::sync::CancellationToken;

use crate::mock_platform::*;

#[tokio::test]
async fn test_concurrent_reconciles_create_each_pod_once() {
    let harness = Harness::new("cache", 3, 1);
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
        harness.reconciler.reconcile(&harness.identity, &cancel),
        harness.reconciler.reconcile(&harness.identity, &cancel),
    );

    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.created.len() + b.created.len(), 6);

    let mut created = harness.platform.created();
    created.sort();
    created.dedup();
    assert_eq!(created.len(), 6);
    assert_eq!(harness.platform.created().len(), 6);
    assert_eq!(harness.platform.pod_names().len(), 6);
    // Exactly one of the two status writes landed.
    assert_eq!(harness.platform.status_writes(), 1);
    assert_eq!(harness.platform.conflicts(), 1);
}

#[tokio::test]
async fn test_concurrent_reconciles_agree_on_convergence() {
    let harness = Harness::new("cache", 2, 1);
    harness.reconcile().await.unwrap();
    harness.assign_ids();
    harness.platform.set_all_ready();
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
        harness.reconciler.reconcile(&harness.identity, &cancel),
        harness.reconciler.reconcile(&harness.identity, &cancel),
    );

    assert!(a.unwrap().is_converged());
    assert!(b.unwrap().is_converged());
    let status = harness.platform.status("cache");
    assert_eq!(status.master_map.len(), 2);
    assert_eq!(status.replica_map.len(), 2);
}

#[tokio::test]
async fn test_conflict_with_diverging_status_is_an_error() {
    let harness = Harness::new("cache", 1, 0);
    harness.reconcile().await.unwrap();
    harness.platform.set_all_ready();
    harness.assign_ids();

    // Another writer changes status between our read and our write.
    harness.platform.interfere_before_write(RedisClusterStatus {
        ready_nodes: 42,
        ..Default::default()
    });
    let result = harness.reconcile().await;

    let err = result.unwrap_err();
    assert!(matches!(err, Error::Transient(_)), "{err:?}");
    assert!(err.is_retryable());
    assert_eq!(harness.platform.status("cache").ready_nodes, 42);
}

#[tokio::test]
async fn test_cancellation_before_write_leaves_status_untouched() {
    let harness = Harness::new("cache", 3, 1);
    let cancel = CancellationToken::new();
    harness.platform.cancel_on_list(cancel.clone());

    let err = harness
        .reconciler
        .reconcile(&harness.identity, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(harness.platform.status_writes(), 0);
    assert!(harness.platform.cluster("cache").status.is_none());
}

#[tokio::test]
async fn test_cancelled_token_does_nothing() {
    let harness = Harness::new("cache", 3, 1);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = harness
        .reconciler
        .reconcile(&harness.identity, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(harness.platform.create_calls(), 0);
    assert_eq!(harness.platform.status_writes(), 0);
}

#[tokio::test]
async fn test_invalid_spec_is_rejected() {
    let platform = MockPlatform::new();
    platform.add_cluster(redis_cluster("cache", 0, 1));
    let harness = Harness::with_platform(platform, "cache");

    let err = harness.reconcile().await.unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert!(!err.is_retryable());
    assert_eq!(harness.platform.create_calls(), 0);
    assert_eq!(harness.platform.status_writes(), 0);
}

#[tokio::test]
async fn test_list_failure_aborts_without_write() {
    let harness = Harness::new("cache", 1, 1);
    harness.platform.fail_list(true);

    let err = harness.reconcile().await.unwrap_err();

    assert!(matches!(err, Error::Transient(_)));
    // Pods were created before the inventory read failed.
    assert_eq!(harness.platform.pod_names().len(), 2);
    assert_eq!(harness.platform.status_writes(), 0);

    harness.platform.fail_list(false);
    let outcome = harness.reconcile().await.unwrap();
    assert!(outcome.created.is_empty());
    assert_eq!(harness.platform.status_writes(), 1);
}

#[tokio::test]
async fn test_create_failure_aborts_cycle() {
    let harness = Harness::new("cache", 2, 0);
    harness.platform.fail_create("cache-master-0");

    let err = harness.reconcile().await.unwrap_err();

    assert!(matches!(err, Error::Transient(_)));
    // Creation stops at the first failure.
    assert!(harness.platform.pod_names().is_empty());
    assert_eq!(harness.platform.status_writes(), 0);
}

/// Cancel `token` after `after`, like the per-invocation deadline does.
fn cancel_after(token: CancellationToken, after: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        token.cancel();
    });
}

#[tokio::test(start_paused = true)]
async fn test_hanging_probes_do_not_block_status() {
    let harness = Harness::new("cache", 3, 1);
    harness.reconcile().await.unwrap();
    harness.platform.set_all_ready();
    let writes = harness.platform.status_writes();

    let channel = HangingChannel::new();
    let settings = ReconcileSettings {
        probe_budget: Duration::from_secs(15),
        ..Default::default()
    };
    let reconciler = Reconciler::new(harness.platform.clone(), channel.clone(), settings);
    let cancel = CancellationToken::new();
    cancel_after(cancel.clone(), Duration::from_secs(30));

    let outcome = reconciler.reconcile(&harness.identity, &cancel).await.unwrap();

    assert!(outcome.is_converged());
    assert!(outcome.status_written);
    // Every ready node was asked once, all at the same time.
    assert_eq!(channel.calls(), 6);
    assert_eq!(harness.platform.status_writes(), writes + 1);
    let status = harness.platform.status("cache");
    assert_eq!(status.ready_nodes, 6);
    assert_eq!(status.master_map.len(), 3);
    assert_eq!(status.replica_map.len(), 3);
    assert!(status.master_map.values().all(|n| n.node_id.is_empty()));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_during_probes_still_cancels() {
    let harness = Harness::new("cache", 1, 1);
    harness.reconcile().await.unwrap();
    harness.platform.set_all_ready();
    let writes = harness.platform.status_writes();

    let settings = ReconcileSettings {
        probe_budget: Duration::from_secs(60),
        ..Default::default()
    };
    let reconciler = Reconciler::new(harness.platform.clone(), HangingChannel::new(), settings);
    let cancel = CancellationToken::new();
    cancel_after(cancel.clone(), Duration::from_secs(5));

    let err = reconciler
        .reconcile(&harness.identity, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(harness.platform.status_writes(), writes);
}

#[tokio::test]
async fn test_cluster_without_uid_creates_nothing() {
    let platform = MockPlatform::new();
    let mut cluster = redis_cluster("cache", 1, 1);
    cluster.metadata.uid = None;
    platform.add_cluster(cluster);
    let harness = Harness::with_platform(platform, "cache");

    let err = harness.reconcile().await.unwrap_err();

    assert!(matches!(err, Error::MissingField(_)), "{err:?}");
    assert!(!err.is_retryable());
    assert_eq!(harness.platform.create_calls(), 0);
    assert_eq!(harness.platform.status_writes(), 0);
}
