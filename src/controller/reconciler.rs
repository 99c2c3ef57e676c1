//! Reconciliation engine for RedisCluster.
//!
//! One call to [`Reconciler::reconcile`] drives a cluster one step towards its
//! spec: it creates missing node pods, observes the node inventory, tracks the
//! lifecycle of every node and writes the resulting topology into status.
//!
//! The engine holds no per-cluster state between calls. Everything it knows is
//! read back from the cluster object and the platform, so concurrent calls for
//! the same cluster are safe: creates tolerate `AlreadyExists` and the status
//! write is a compare-and-swap on the object's resourceVersion.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{CommandChannel, redis_cli};
use crate::config::OperatorConfig;
use crate::controller::error::{Error, Result};
use crate::controller::inventory::list_cluster_nodes;
use crate::controller::status::{ready_condition_for, same_observed_state, status_changed};
use crate::controller::topology::{NodeTransition, TopologyTracker};
use crate::crd::{ClusterIdentity, MAX_BASE_PORT, RedisCluster, RedisClusterSpec, RedisClusterStatus};
use crate::platform::{ClusterPlatform, CreateOutcome, StatusWrite};
use crate::resources::common::owner_reference;
use crate::resources::node::{NodeDescriptor, desired_descriptors};

/// Tunables of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSettings {
    /// Delay before re-checking a cluster that has not converged.
    pub requeue_after: Duration,
    /// Timeout for each exec into a node.
    pub exec_timeout: Duration,
    /// Probe ready nodes for their cluster node id.
    pub probe_node_ids: bool,
    /// Wall-clock budget for all node id probes of one cycle.
    pub probe_budget: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self::from(&OperatorConfig::default())
    }
}

impl From<&OperatorConfig> for ReconcileSettings {
    fn from(config: &OperatorConfig) -> Self {
        Self {
            requeue_after: config.requeue_after,
            exec_timeout: config.exec_timeout,
            probe_node_ids: config.probe_node_ids,
            probe_budget: config.reconcile_timeout / 2,
        }
    }
}

/// What one reconcile cycle did and saw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// `None` once every desired node is ready.
    pub requeue_after: Option<Duration>,
    /// Whether the cluster object existed.
    pub found: bool,
    /// Ready desired nodes.
    pub ready: i32,
    /// Desired nodes.
    pub desired: i32,
    /// Nodes currently failed.
    pub failed: usize,
    /// Pods created by this cycle.
    pub created: Vec<String>,
    /// Node state changes applied by this cycle.
    pub transitions: Vec<NodeTransition>,
    /// Whether this cycle wrote status.
    pub status_written: bool,
}

impl ReconcileOutcome {
    fn not_found() -> Self {
        Self::default()
    }

    /// Every desired node is ready.
    pub fn is_converged(&self) -> bool {
        self.found && self.ready == self.desired
    }
}

/// Validate a cluster spec.
pub fn validate_spec(spec: &RedisClusterSpec) -> Result<()> {
    if spec.masters < 1 {
        return Err(Error::Validation("masters must be at least 1".to_string()));
    }
    if spec.replicas < 0 {
        return Err(Error::Validation("replicas cannot be negative".to_string()));
    }
    if spec
        .replicas
        .checked_add(1)
        .and_then(|per_master| per_master.checked_mul(spec.masters))
        .is_none()
    {
        return Err(Error::Validation("cluster size is too large".to_string()));
    }
    if !(1..=MAX_BASE_PORT).contains(&spec.base_port) {
        return Err(Error::Validation(format!(
            "basePort must be between 1 and {}",
            MAX_BASE_PORT
        )));
    }
    if spec.image.trim().is_empty() {
        return Err(Error::Validation("image is required".to_string()));
    }
    Ok(())
}

/// Run `fut` unless `cancel` fires first.
async fn guarded<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// The reconciliation engine.
#[derive(Clone)]
pub struct Reconciler {
    platform: Arc<dyn ClusterPlatform>,
    channel: Arc<dyn CommandChannel>,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(
        platform: Arc<dyn ClusterPlatform>,
        channel: Arc<dyn CommandChannel>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            platform,
            channel,
            settings,
        }
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    /// Reconcile one cluster.
    ///
    /// A missing cluster is a no-op. Any failure to read, create, list or
    /// write aborts the cycle and is returned; status is only written at the
    /// very end, and never after `cancel` fires.
    pub async fn reconcile(
        &self,
        identity: &ClusterIdentity,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        let Some(cluster) = guarded(cancel, self.platform.get_cluster(identity)).await? else {
            debug!(cluster = %identity, "RedisCluster not found, nothing to do");
            return Ok(ReconcileOutcome::not_found());
        };

        validate_spec(&cluster.spec)?;

        let owner = owner_reference(&cluster)?;
        let desired = desired_descriptors(&cluster.spec, identity, &owner);
        let desired_count = i32::try_from(desired.len()).unwrap_or(i32::MAX);

        let mut tracker = TopologyTracker::from_status(&identity.name, cluster.status.as_ref());
        tracker.register_desired(desired.values());

        let created = self.ensure_nodes(&desired, &mut tracker, cancel).await?;

        let inventory = guarded(cancel, list_cluster_nodes(self.platform.as_ref(), identity)).await?;
        tracker.observe(&inventory);

        if self.settings.probe_node_ids {
            self.probe_node_ids(identity, &cluster.spec, &mut tracker, cancel)
                .await?;
        }

        let status = build_status(&cluster, &tracker, desired_count);
        let ready = status.ready_nodes;
        let failed = tracker.failed_nodes().len();
        let status_written = self.write_status(&cluster, &status, cancel).await?;

        if status_written {
            info!(
                cluster = %identity,
                ready = ready,
                desired = desired_count,
                failed = failed,
                "Updated RedisCluster status"
            );
        }

        let requeue_after = (ready != desired_count).then_some(self.settings.requeue_after);
        Ok(ReconcileOutcome {
            requeue_after,
            found: true,
            ready,
            desired: desired_count,
            failed,
            created,
            transitions: tracker.into_transitions(),
            status_written,
        })
    }

    /// Create every desired pod that does not exist yet.
    async fn ensure_nodes(
        &self,
        desired: &BTreeMap<String, NodeDescriptor>,
        tracker: &mut TopologyTracker,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let mut created = Vec::new();
        for descriptor in desired.values() {
            let existing = guarded(
                cancel,
                self.platform
                    .get_node(&descriptor.namespace, &descriptor.name),
            )
            .await?;
            if existing.is_some() {
                continue;
            }

            let pod = descriptor.to_pod();
            let outcome = guarded(cancel, self.platform.create_node(&pod)).await?;
            match outcome {
                CreateOutcome::Created => {
                    info!(
                        cluster = %descriptor.cluster_name,
                        node = %descriptor.name,
                        role = %descriptor.role(),
                        "Created node pod"
                    );
                    created.push(descriptor.name.clone());
                }
                CreateOutcome::AlreadyExists => {
                    debug!(node = %descriptor.name, "Node pod created concurrently");
                }
            }
            tracker.record_create(&descriptor.name, outcome);
        }
        Ok(created)
    }

    /// Learn the cluster node id of ready nodes that have none recorded.
    ///
    /// Probes run concurrently within `probe_budget`. A node that fails or does
    /// not answer in time keeps an empty id and is retried on the next cycle.
    /// Only cancellation of the cycle itself aborts.
    async fn probe_node_ids(
        &self,
        identity: &ClusterIdentity,
        spec: &RedisClusterSpec,
        tracker: &mut TopologyTracker,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let nodes = tracker.nodes_missing_id();
        if nodes.is_empty() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let probe_cancel = cancel.child_token();
        let probes = nodes.iter().map(|node| {
            let probe_cancel = &probe_cancel;
            async move {
                let probe = redis_cli::cluster_myid(
                    self.channel.as_ref(),
                    &identity.namespace,
                    node,
                    spec.base_port,
                    self.settings.exec_timeout,
                    probe_cancel,
                );
                let result = tokio::time::timeout(self.settings.probe_budget, probe).await;
                (node, result)
            }
        });
        let results = join_all(probes).await;
        probe_cancel.cancel();

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        for (node, result) in results {
            match result {
                Ok(Ok(id)) => {
                    debug!(cluster = %identity, node = %node, node_id = %id, "Learned node id");
                    tracker.set_node_id(node, id);
                }
                Ok(Err(e)) => {
                    let error = Error::from(e);
                    warn!(cluster = %identity, node = %node, error = %error, "Failed to probe node id");
                }
                Err(_) => {
                    warn!(
                        cluster = %identity,
                        node = %node,
                        budget = ?self.settings.probe_budget,
                        "Node id probe ran out of time"
                    );
                }
            }
        }
        Ok(())
    }

    /// Write status if it changed. Returns whether a write happened.
    async fn write_status(
        &self,
        cluster: &RedisCluster,
        status: &RedisClusterStatus,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if !status_changed(cluster.status.as_ref(), status) {
            return Ok(false);
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match self.platform.replace_status(cluster, status).await? {
            StatusWrite::Applied => Ok(true),
            StatusWrite::Conflict => {
                let identity = ClusterIdentity::of(cluster);
                let current = guarded(cancel, self.platform.get_cluster(&identity)).await?;
                match current.as_ref().and_then(|c| c.status.as_ref()) {
                    Some(stored) if same_observed_state(stored, status) => {
                        debug!(cluster = %identity, "Status already written by a concurrent reconcile");
                        Ok(false)
                    }
                    _ => Err(Error::Transient(format!(
                        "status of {} was modified concurrently",
                        identity
                    ))),
                }
            }
        }
    }
}

/// Assemble the status for this cycle.
fn build_status(
    cluster: &RedisCluster,
    tracker: &TopologyTracker,
    desired: i32,
) -> RedisClusterStatus {
    let maps = tracker.node_maps();
    let ready = tracker.ready_desired();
    let generation = cluster.metadata.generation;
    let previous = cluster
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();

    RedisClusterStatus {
        master_map: maps.master_map,
        replica_map: maps.replica_map,
        failed_master_map: maps.failed_master_map,
        failed_replica_map: maps.failed_replica_map,
        ready_nodes: ready,
        desired_nodes: desired,
        observed_generation: generation,
        conditions: ready_condition_for(
            previous,
            ready,
            desired,
            tracker.failed_nodes().len(),
            generation,
        ),
    }
}
