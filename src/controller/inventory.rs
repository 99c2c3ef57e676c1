//! Node inventory for one cluster.
//!
//! Lists the pods carrying the cluster's identity label. The label is checked
//! again on the returned units so a misbehaving platform or a shared label
//! value can never leak another cluster's pods into the topology.

use std::collections::BTreeMap;

use tracing::warn;

use crate::client::REDIS_CONTAINER;
use crate::controller::error::Result;
use crate::crd::ClusterIdentity;
use crate::platform::{ClusterPlatform, NodeUnit};
use crate::resources::common::{CLUSTER_NAME_LABEL, cluster_selector};

/// Snapshot of the node units that belong to one cluster, keyed by pod name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    units: BTreeMap<String, NodeUnit>,
}

impl Inventory {
    /// Build an inventory keeping only units that belong to `cluster`.
    pub fn from_units(cluster: &ClusterIdentity, units: impl IntoIterator<Item = NodeUnit>) -> Self {
        let mut kept = BTreeMap::new();
        for unit in units {
            if belongs_to(&unit, cluster) {
                kept.insert(unit.name.clone(), unit);
            } else {
                warn!(
                    cluster = %cluster,
                    pod = %unit.name,
                    namespace = %unit.namespace,
                    "Ignoring node unit that does not belong to this cluster"
                );
            }
        }
        Self { units: kept }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    /// Whether the named unit exists and its Redis container is ready.
    pub fn is_ready(&self, name: &str) -> bool {
        self.units
            .get(name)
            .is_some_and(|u| u.is_ready(REDIS_CONTAINER))
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.units.keys()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

fn belongs_to(unit: &NodeUnit, cluster: &ClusterIdentity) -> bool {
    let namespace_matches = unit.namespace.is_empty() || unit.namespace == cluster.namespace;
    namespace_matches && unit.label(CLUSTER_NAME_LABEL) == Some(cluster.name.as_str())
}

/// List the node units of `cluster`.
///
/// Platform errors are returned as-is; retry policy belongs to the caller.
pub async fn list_cluster_nodes(
    platform: &dyn ClusterPlatform,
    cluster: &ClusterIdentity,
) -> Result<Inventory> {
    let units = platform
        .list_nodes(&cluster.namespace, &cluster_selector(&cluster.name))
        .await?;
    Ok(Inventory::from_units(cluster, units))
}
