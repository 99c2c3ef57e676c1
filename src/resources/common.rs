//! Common resource generation utilities.
//!
//! Labels and owner references shared by everything the operator creates.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use crate::controller::error::{Error, Result};
use crate::crd::RedisCluster;

/// Label carrying the owning cluster's name. Inventory queries select on it.
pub const CLUSTER_NAME_LABEL: &str = "clusterName";

/// Label carrying the node role (`master` or `replica`).
pub const ROLE_LABEL: &str = "role";

/// Label carrying the master index a node belongs to.
pub const MASTER_INDEX_LABEL: &str = "masterIndex";

/// Label carrying the replica index within its master (replicas only).
pub const REPLICA_INDEX_LABEL: &str = "replicaIndex";

/// Value of `app.kubernetes.io/managed-by` on every managed resource.
pub const MANAGED_BY: &str = "redis-cluster-operator";

/// Standard labels applied to every node of a cluster
pub fn standard_labels(cluster_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "redis".to_string());
    labels.insert(CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string());
    labels.insert(
        "app.kubernetes.io/name".to_string(),
        cluster_name.to_string(),
    );
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        MANAGED_BY.to_string(),
    );
    labels.insert(
        "app.kubernetes.io/component".to_string(),
        "redis-node".to_string(),
    );
    labels
}

/// Label selector matching every node of one cluster
pub fn cluster_selector(cluster_name: &str) -> String {
    format!("{}={}", CLUSTER_NAME_LABEL, cluster_name)
}

/// Create the controller owner reference for a RedisCluster.
///
/// Garbage collection of node pods hangs off this link, so a cluster
/// without a uid cannot own anything.
pub fn owner_reference(cluster: &RedisCluster) -> Result<OwnerReference> {
    let uid = cluster
        .uid()
        .ok_or_else(|| Error::MissingField("metadata.uid".to_string()))?;
    Ok(OwnerReference {
        api_version: RedisCluster::api_version(&()).to_string(),
        kind: RedisCluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}
