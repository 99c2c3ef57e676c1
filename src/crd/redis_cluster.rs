//! RedisCluster Custom Resource Definition.
//!
//! Declares the desired shape of a sharded Redis cluster (masters and
//! replicas per master) and the status the operator writes back: one map per
//! node role and health.

use std::collections::BTreeMap;
use std::fmt;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// RedisCluster is a custom resource for running a Redis cluster as bare pods.
///
/// Example:
/// ```yaml
/// apiVersion: redis.example.com/v1alpha1
/// kind: RedisCluster
/// metadata:
///   name: cache
/// spec:
///   masters: 3
///   replicas: 1
///   image: redis:7.0
///   basePort: 6379
/// ```
#[derive(CustomResource, Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "redis.example.com",
    version = "v1alpha1",
    kind = "RedisCluster",
    plural = "redisclusters",
    shortname = "rc",
    status = "RedisClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Masters", "type":"integer", "jsonPath":".spec.masters"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyNodes"}"#,
    printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".status.desiredNodes"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RedisClusterSpec {
    /// Number of master nodes (minimum 1, default 3).
    #[serde(default = "default_masters")]
    pub masters: i32,

    /// Number of replicas per master (default 1).
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Container image for every node (default: redis:7.0).
    #[serde(default = "default_image")]
    pub image: String,

    /// Client port of every node. The cluster bus listens on basePort + 10000.
    #[serde(default = "default_base_port")]
    pub base_port: i32,
}

impl Default for RedisClusterSpec {
    fn default() -> Self {
        Self {
            masters: default_masters(),
            replicas: default_replicas(),
            image: default_image(),
            base_port: default_base_port(),
        }
    }
}

fn default_masters() -> i32 {
    3
}

fn default_replicas() -> i32 {
    1
}

fn default_image() -> String {
    "redis:7.0".to_string()
}

fn default_base_port() -> i32 {
    DEFAULT_CLIENT_PORT
}

impl RedisClusterSpec {
    /// Total number of nodes this spec asks for.
    pub fn total_nodes(&self) -> i32 {
        total_nodes(self.masters, self.replicas)
    }
}

/// Observed state of one cluster node as recorded in status.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Name of the pod running the node.
    pub pod_name: String,
    /// Redis cluster node id (40 hex characters), empty until probed.
    #[serde(default, rename = "nodeID")]
    pub node_id: String,
    /// Node id of the master this replica follows. Empty for masters.
    #[serde(default, rename = "masterNodeID")]
    pub master_node_id: String,
}

/// Status of a RedisCluster.
///
/// A node identity appears in at most one of the four maps.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RedisClusterStatus {
    /// Ready masters keyed by node identity.
    #[serde(default)]
    pub master_map: BTreeMap<String, NodeStatus>,

    /// Ready replicas keyed by node identity.
    #[serde(default)]
    pub replica_map: BTreeMap<String, NodeStatus>,

    /// Masters that were ready once and are not any more.
    #[serde(default)]
    pub failed_master_map: BTreeMap<String, NodeStatus>,

    /// Replicas that were ready once and are not any more.
    #[serde(default)]
    pub failed_replica_map: BTreeMap<String, NodeStatus>,

    /// Number of desired nodes currently ready.
    #[serde(default)]
    pub ready_nodes: i32,

    /// Number of nodes the cluster asks for.
    #[serde(default)]
    pub desired_nodes: i32,

    /// The generation most recently observed by the controller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions describing the current state.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl RedisClusterStatus {
    /// Iterate every node identity recorded in any of the four maps.
    pub fn recorded_identities(&self) -> impl Iterator<Item = &String> {
        self.master_map
            .keys()
            .chain(self.replica_map.keys())
            .chain(self.failed_master_map.keys())
            .chain(self.failed_replica_map.keys())
    }

    /// Number of maps an identity appears in. Anything above 1 is a bug.
    pub fn map_membership(&self, identity: &str) -> usize {
        [
            &self.master_map,
            &self.replica_map,
            &self.failed_master_map,
            &self.failed_replica_map,
        ]
        .iter()
        .filter(|m| m.contains_key(identity))
        .count()
    }
}

/// Namespace and name of one managed cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterIdentity {
    pub namespace: String,
    pub name: String,
}

impl ClusterIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Identity of an existing resource. Missing namespaces fall back to "default".
    pub fn of(cluster: &RedisCluster) -> Self {
        Self {
            namespace: cluster.namespace().unwrap_or_else(|| "default".to_string()),
            name: cluster.name_any(),
        }
    }
}

impl fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Condition describes the state of a cluster at a certain point.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Create a "Ready" condition.
    pub fn ready(ready: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new("Ready", ready, reason, message, generation)
    }
}

/// Default client port for Redis.
pub const DEFAULT_CLIENT_PORT: i32 = 6379;

/// Cluster bus port offset from client port (client port + 10000).
pub const CLUSTER_BUS_PORT_OFFSET: i32 = 10000;

/// Highest client port that still leaves room for the bus port.
pub const MAX_BASE_PORT: i32 = 65535 - CLUSTER_BUS_PORT_OFFSET;

/// Calculate the total number of nodes for a cluster.
pub fn total_nodes(masters: i32, replicas: i32) -> i32 {
    masters + (masters * replicas)
}
