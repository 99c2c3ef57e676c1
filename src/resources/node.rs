//! Node descriptors and pod generation.
//!
//! Each Redis node runs in its own pod. A node's name, ports and role are a
//! pure function of the cluster spec and the node's (master, replica) indices,
//! so the same inputs always render the same pod.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, ExecAction, Pod, PodSpec, Probe,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::Serialize;

use crate::client::redis_cli::{REDIS_CONTAINER, redis_cli_args};
use crate::crd::{CLUSTER_BUS_PORT_OFFSET, ClusterIdentity, RedisClusterSpec};
use crate::resources::common::{
    MASTER_INDEX_LABEL, REPLICA_INDEX_LABEL, ROLE_LABEL, standard_labels,
};

/// Cluster node timeout passed to redis-server, in milliseconds.
const CLUSTER_NODE_TIMEOUT_MS: &str = "5000";

/// Role of a node, fixed when the node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Replica,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Replica => write!(f, "replica"),
        }
    }
}

/// Position of a node in the cluster layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeSlot {
    Master { master: i32 },
    Replica { master: i32, replica: i32 },
}

impl NodeSlot {
    pub fn role(&self) -> NodeRole {
        match self {
            NodeSlot::Master { .. } => NodeRole::Master,
            NodeSlot::Replica { .. } => NodeRole::Replica,
        }
    }

    /// Index of the master this node is, or follows.
    pub fn master_index(&self) -> i32 {
        match self {
            NodeSlot::Master { master } | NodeSlot::Replica { master, .. } => *master,
        }
    }

    /// Pod name for this slot within a cluster.
    pub fn node_name(&self, cluster_name: &str) -> String {
        match self {
            NodeSlot::Master { master } => master_name(cluster_name, *master),
            NodeSlot::Replica { master, replica } => replica_name(cluster_name, *master, *replica),
        }
    }
}

/// Pod name of master `m`: `{cluster}-master-{m}`.
pub fn master_name(cluster_name: &str, master: i32) -> String {
    format!("{}-master-{}", cluster_name, master)
}

/// Pod name of replica `r` of master `m`: `{cluster}-replica-{m}-{r}`.
pub fn replica_name(cluster_name: &str, master: i32, replica: i32) -> String {
    format!("{}-replica-{}-{}", cluster_name, master, replica)
}

/// Recover a node's slot from its pod name.
///
/// Returns `None` for names that do not belong to `cluster_name` or do not
/// follow the naming scheme.
pub fn parse_node_name(cluster_name: &str, name: &str) -> Option<NodeSlot> {
    let rest = name.strip_prefix(cluster_name)?.strip_prefix('-')?;
    if let Some(index) = rest.strip_prefix("master-") {
        let master = parse_index(index)?;
        return Some(NodeSlot::Master { master });
    }
    let indices = rest.strip_prefix("replica-")?;
    let (master, replica) = indices.split_once('-')?;
    Some(NodeSlot::Replica {
        master: parse_index(master)?,
        replica: parse_index(replica)?,
    })
}

fn parse_index(s: &str) -> Option<i32> {
    // Reject "+1", "01" and friends so that parse(name(slot)) is a bijection.
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) || (s.len() > 1 && s.starts_with('0'))
    {
        return None;
    }
    s.parse().ok().filter(|i: &i32| *i >= 0)
}

/// Everything needed to create one node pod.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    pub name: String,
    pub namespace: String,
    pub cluster_name: String,
    pub slot: NodeSlot,
    pub redis_port: i32,
    pub bus_port: i32,
    pub image: String,
    pub owner: OwnerReference,
}

impl NodeDescriptor {
    pub fn role(&self) -> NodeRole {
        self.slot.role()
    }

    /// Render the pod manifest for this node.
    pub fn to_pod(&self) -> Pod {
        let mut labels = standard_labels(&self.cluster_name);
        labels.insert(ROLE_LABEL.to_string(), self.role().to_string());
        labels.insert(
            MASTER_INDEX_LABEL.to_string(),
            self.slot.master_index().to_string(),
        );
        if let NodeSlot::Replica { replica, .. } = self.slot {
            labels.insert(REPLICA_INDEX_LABEL.to_string(), replica.to_string());
        }

        Pod {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                owner_references: Some(vec![self.owner.clone()]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![self.container()],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn container(&self) -> Container {
        let redis_port = self.redis_port.to_string();
        let bus_port = self.bus_port.to_string();

        Container {
            name: REDIS_CONTAINER.to_string(),
            image: Some(self.image.clone()),
            ports: Some(vec![
                ContainerPort {
                    container_port: self.redis_port,
                    name: Some("redis".to_string()),
                    ..Default::default()
                },
                ContainerPort {
                    container_port: self.bus_port,
                    name: Some("bus".to_string()),
                    ..Default::default()
                },
            ]),
            command: Some(
                [
                    "redis-server",
                    "--port",
                    redis_port.as_str(),
                    "--cluster-enabled",
                    "yes",
                    "--cluster-port",
                    bus_port.as_str(),
                    "--cluster-node-timeout",
                    CLUSTER_NODE_TIMEOUT_MS,
                    "--protected-mode",
                    "no",
                ]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            ),
            readiness_probe: Some(Probe {
                exec: Some(ExecAction {
                    command: Some(redis_cli_args(self.redis_port, &["ping"])),
                }),
                initial_delay_seconds: Some(2),
                period_seconds: Some(5),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Build the descriptor for one node.
pub fn build_descriptor(
    spec: &RedisClusterSpec,
    cluster: &ClusterIdentity,
    owner: &OwnerReference,
    slot: NodeSlot,
) -> NodeDescriptor {
    NodeDescriptor {
        name: slot.node_name(&cluster.name),
        namespace: cluster.namespace.clone(),
        cluster_name: cluster.name.clone(),
        slot,
        redis_port: spec.base_port,
        bus_port: spec.base_port + CLUSTER_BUS_PORT_OFFSET,
        image: spec.image.clone(),
        owner: owner.clone(),
    }
}

/// Every desired node slot: masters first, then replicas grouped by master.
pub fn desired_slots(spec: &RedisClusterSpec) -> Vec<NodeSlot> {
    let masters = spec.masters.max(0);
    let replicas = spec.replicas.max(0);
    let masters_iter = (0..masters).map(|master| NodeSlot::Master { master });
    let replicas_iter = (0..masters)
        .flat_map(move |master| (0..replicas).map(move |replica| NodeSlot::Replica { master, replica }));
    masters_iter.chain(replicas_iter).collect()
}

/// Descriptors for the full desired node set, keyed by node name.
pub fn desired_descriptors(
    spec: &RedisClusterSpec,
    cluster: &ClusterIdentity,
    owner: &OwnerReference,
) -> BTreeMap<String, NodeDescriptor> {
    desired_slots(spec)
        .into_iter()
        .map(|slot| {
            let descriptor = build_descriptor(spec, cluster, owner, slot);
            (descriptor.name.clone(), descriptor)
        })
        .collect()
}
