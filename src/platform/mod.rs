//! Platform seam between the reconciler and Kubernetes.
//!
//! The reconciler only talks to the cluster object store and the pod
//! scheduler through [`ClusterPlatform`], so it can be driven by the real API
//! server ([`KubePlatform`]) or an in-memory fake in tests.

mod kube_platform;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;

use crate::controller::error::Result;
use crate::crd::{ClusterIdentity, RedisCluster, RedisClusterStatus};

pub use kube_platform::KubePlatform;

/// Pod phase reported for a running pod.
pub const POD_PHASE_RUNNING: &str = "Running";

/// One node pod as seen by the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeUnit {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    /// Pod phase (`Pending`, `Running`, ...).
    pub phase: Option<String>,
    /// Containers whose readiness probe currently passes.
    pub ready_containers: BTreeSet<String>,
}

impl NodeUnit {
    /// Whether the unit is running and `container` reports ready.
    pub fn is_ready(&self, container: &str) -> bool {
        self.phase.as_deref() == Some(POD_PHASE_RUNNING) && self.ready_containers.contains(container)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

impl From<&Pod> for NodeUnit {
    fn from(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            labels: pod.metadata.labels.clone().unwrap_or_default(),
            phase: status.and_then(|s| s.phase.clone()),
            ready_containers: status
                .and_then(|s| s.container_statuses.as_ref())
                .map(|statuses| {
                    statuses
                        .iter()
                        .filter(|cs| cs.ready)
                        .map(|cs| cs.name.clone())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// Result of asking the platform to create a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Someone else created it first.
    AlreadyExists,
}

/// Result of a conditional status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    Applied,
    /// The stored object changed since it was read.
    Conflict,
}

/// Operations the reconciler needs from the platform.
#[async_trait]
pub trait ClusterPlatform: Send + Sync {
    /// Fetch a cluster object. `None` when it does not exist.
    async fn get_cluster(&self, cluster: &ClusterIdentity) -> Result<Option<RedisCluster>>;

    /// Fetch one node unit. `None` when it does not exist.
    async fn get_node(&self, namespace: &str, name: &str) -> Result<Option<NodeUnit>>;

    /// Create a node pod.
    async fn create_node(&self, pod: &Pod) -> Result<CreateOutcome>;

    /// List node units in `namespace` matching a `key=value` label selector.
    async fn list_nodes(&self, namespace: &str, label_selector: &str) -> Result<Vec<NodeUnit>>;

    /// Replace the status of `cluster`, conditional on its resourceVersion.
    async fn replace_status(
        &self,
        cluster: &RedisCluster,
        status: &RedisClusterStatus,
    ) -> Result<StatusWrite>;
}
