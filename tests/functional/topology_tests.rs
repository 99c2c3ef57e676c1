//! Status map contents as nodes become ready, fail, vanish and recover.

use redis_cluster_operator::controller::node_state_machine::{NodeEvent, NodeState};
use redis_cluster_operator::crd::RedisClusterStatus;

use crate::mock_platform::*;

/// Build a 3x1 cluster and drive it to convergence.
async fn converged_three_by_one() -> Harness {
    let harness = Harness::new("cache", 3, 1);
    harness.reconcile().await.unwrap();
    harness.assign_ids();
    harness.platform.set_all_ready();
    let outcome = harness.reconcile().await.unwrap();
    assert!(outcome.is_converged());
    harness
}

fn assert_exclusive(status: &RedisClusterStatus) {
    for identity in status.recorded_identities() {
        assert_eq!(
            status.map_membership(identity),
            1,
            "{identity} is recorded in more than one map"
        );
    }
}

#[tokio::test]
async fn test_replica_readiness_flip() {
    let harness = converged_three_by_one().await;

    harness.platform.set_ready("cache-replica-1-0", false);
    let outcome = harness.reconcile().await.unwrap();

    assert_eq!(outcome.ready, 5);
    assert_eq!(outcome.failed, 1);
    assert!(outcome.requeue_after.is_some());
    let status = harness.platform.status("cache");
    assert!(!status.replica_map.contains_key("cache-replica-1-0"));
    let failed = &status.failed_replica_map["cache-replica-1-0"];
    assert_eq!(failed.node_id, node_id_for("cache-replica-1-0"));
    assert_eq!(failed.master_node_id, node_id_for("cache-master-1"));
    assert_eq!(status.replica_map.len(), 2);
    assert_exclusive(&status);

    harness.platform.set_ready("cache-replica-1-0", true);
    let outcome = harness.reconcile().await.unwrap();

    assert!(outcome.is_converged());
    let status = harness.platform.status("cache");
    assert!(status.replica_map.contains_key("cache-replica-1-0"));
    assert!(status.failed_replica_map.is_empty());
    assert_exclusive(&status);
}

#[tokio::test]
async fn test_master_failure_is_recorded_and_recovers() {
    let harness = converged_three_by_one().await;

    harness.platform.set_ready("cache-master-0", false);
    let outcome = harness.reconcile().await.unwrap();

    let transition = outcome
        .transitions
        .iter()
        .find(|t| t.node == "cache-master-0")
        .unwrap();
    assert_eq!(transition.from, NodeState::Ready);
    assert_eq!(transition.to, NodeState::Failed);
    assert_eq!(transition.event, NodeEvent::ReadinessLost);

    let status = harness.platform.status("cache");
    assert!(status.failed_master_map.contains_key("cache-master-0"));
    // The replica still follows the recorded id of its master.
    assert_eq!(
        status.replica_map["cache-replica-0-0"].master_node_id,
        node_id_for("cache-master-0")
    );
    assert_exclusive(&status);

    // The master comes back after a restart with a new cluster id.
    let fresh = "e".repeat(40);
    harness.channel.set_id("cache-master-0", fresh.clone());
    harness.platform.set_ready("cache-master-0", true);
    harness.reconcile().await.unwrap();
    let status = harness.platform.status("cache");
    assert_eq!(status.master_map["cache-master-0"].node_id, fresh);
    assert_eq!(status.replica_map["cache-replica-0-0"].master_node_id, fresh);
    assert!(status.failed_master_map.is_empty());
}

#[tokio::test]
async fn test_vanished_pod_is_recreated() {
    let harness = converged_three_by_one().await;

    harness.platform.delete_pod("cache-replica-2-0");
    let outcome = harness.reconcile().await.unwrap();

    assert_eq!(outcome.created, vec!["cache-replica-2-0".to_string()]);
    let status = harness.platform.status("cache");
    // Recreated, but it is the same identity that failed: it stays in the
    // failed map with its old node id cleared until it is ready again.
    let failed = &status.failed_replica_map["cache-replica-2-0"];
    assert!(failed.node_id.is_empty());
    assert_exclusive(&status);

    harness.channel.set_id("cache-replica-2-0", "f".repeat(40));
    harness.platform.set_ready("cache-replica-2-0", true);
    let outcome = harness.reconcile().await.unwrap();

    assert!(outcome.is_converged());
    let status = harness.platform.status("cache");
    assert_eq!(status.replica_map["cache-replica-2-0"].node_id, "f".repeat(40));
}

#[tokio::test]
async fn test_foreign_pods_are_ignored() {
    let harness = Harness::new("cache", 1, 0);
    harness
        .platform
        .add_pod(NAMESPACE, "other-master-0", "other", true);
    harness
        .platform
        .add_pod("elsewhere", "cache-master-0", "cache", true);

    harness.reconcile().await.unwrap();
    harness.channel.set_id("cache-master-0", node_id_for("cache-master-0"));
    harness.platform.set_ready("cache-master-0", true);
    harness.reconcile().await.unwrap();

    let status = harness.platform.status("cache");
    let recorded: Vec<&String> = status.recorded_identities().collect();
    assert_eq!(recorded, vec!["cache-master-0"]);
}

#[tokio::test]
async fn test_unprobed_node_keeps_empty_id() {
    let harness = Harness::new("cache", 1, 1);
    harness.reconcile().await.unwrap();
    harness.platform.set_all_ready();
    // Only the master answers CLUSTER MYID.
    harness.channel.set_id("cache-master-0", node_id_for("cache-master-0"));

    let outcome = harness.reconcile().await.unwrap();

    assert!(outcome.is_converged());
    let status = harness.platform.status("cache");
    assert!(status.replica_map["cache-replica-0-0"].node_id.is_empty());
    assert_eq!(
        status.replica_map["cache-replica-0-0"].master_node_id,
        node_id_for("cache-master-0")
    );

    harness
        .channel
        .set_id("cache-replica-0-0", node_id_for("cache-replica-0-0"));
    harness.reconcile().await.unwrap();
    let status = harness.platform.status("cache");
    assert_eq!(
        status.replica_map["cache-replica-0-0"].node_id,
        node_id_for("cache-replica-0-0")
    );
}

#[tokio::test]
async fn test_maps_stay_exclusive_through_churn() {
    let harness = converged_three_by_one().await;
    let pods = harness.platform.pod_names();

    for (round, pod) in pods.iter().enumerate() {
        harness.platform.set_ready(pod, round % 2 == 0);
        if round % 3 == 0 {
            harness.platform.delete_pod(pod);
        }
        harness.reconcile().await.unwrap();
        assert_exclusive(&harness.platform.status("cache"));
    }

    harness.assign_ids();
    harness.platform.set_all_ready();
    let outcome = harness.reconcile().await.unwrap();
    assert!(outcome.is_converged());
    let status = harness.platform.status("cache");
    assert_exclusive(&status);
    assert_eq!(status.recorded_identities().count(), 6);
}

#[tokio::test]
async fn test_probe_uses_cluster_myid() {
    let harness = Harness::new("cache", 1, 0);
    harness.reconcile().await.unwrap();
    harness.assign_ids();
    harness.platform.set_all_ready();
    harness.reconcile().await.unwrap();

    let calls = harness.channel.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "cache-master-0");
    assert_eq!(
        calls[0].1,
        vec!["redis-cli", "-p", "6379", "cluster", "myid"]
    );
}
