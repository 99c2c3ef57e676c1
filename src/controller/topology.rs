//! Topology tracker.
//!
//! Holds the lifecycle state of every node identity of one cluster for the
//! duration of a reconcile cycle. It is seeded from the stored status, fed the
//! desired node set, create outcomes and the inventory, and finally rendered
//! back into the four status maps.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::controller::inventory::Inventory;
use crate::controller::node_state_machine::{
    NodeEvent, NodeState, NodeStateMachine, Observation, TransitionContext, TransitionResult,
    determine_event,
};
use crate::crd::{NodeStatus, RedisClusterStatus};
use crate::platform::CreateOutcome;
use crate::resources::node::{NodeDescriptor, NodeRole, NodeSlot, master_name, parse_node_name};

/// One applied state change, reported to the caller for events and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTransition {
    pub node: String,
    pub from: NodeState,
    pub to: NodeState,
    pub event: NodeEvent,
}

#[derive(Debug, Clone)]
struct TrackedNode {
    slot: NodeSlot,
    state: NodeState,
    node_id: String,
    desired: bool,
}

impl TrackedNode {
    fn new(slot: NodeSlot, state: NodeState) -> Self {
        Self {
            slot,
            state,
            node_id: String::new(),
            desired: false,
        }
    }
}

/// The four status maps rebuilt from tracked state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeMaps {
    pub master_map: BTreeMap<String, NodeStatus>,
    pub replica_map: BTreeMap<String, NodeStatus>,
    pub failed_master_map: BTreeMap<String, NodeStatus>,
    pub failed_replica_map: BTreeMap<String, NodeStatus>,
}

/// Per-cycle tracker of node lifecycles for one cluster.
pub struct TopologyTracker {
    cluster_name: String,
    nodes: BTreeMap<String, TrackedNode>,
    machine: NodeStateMachine,
    transitions: Vec<NodeTransition>,
}

impl TopologyTracker {
    /// Empty tracker for `cluster_name`.
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            nodes: BTreeMap::new(),
            machine: NodeStateMachine::new(),
            transitions: Vec::new(),
        }
    }

    /// Seed from a stored status.
    ///
    /// Live maps yield `Ready` nodes, failed maps yield `Failed` nodes. Entries
    /// whose name does not parse as a node of this cluster are ignored.
    pub fn from_status(cluster_name: impl Into<String>, status: Option<&RedisClusterStatus>) -> Self {
        let mut tracker = Self::new(cluster_name);
        let Some(status) = status else {
            return tracker;
        };

        let sources = [
            (&status.master_map, NodeRole::Master, NodeState::Ready),
            (&status.replica_map, NodeRole::Replica, NodeState::Ready),
            (&status.failed_master_map, NodeRole::Master, NodeState::Failed),
            (&status.failed_replica_map, NodeRole::Replica, NodeState::Failed),
        ];
        for (map, role, state) in sources {
            for (name, node_status) in map {
                tracker.seed(name, node_status, role, state);
            }
        }
        tracker
    }

    fn seed(&mut self, name: &str, node_status: &NodeStatus, role: NodeRole, state: NodeState) {
        let Some(slot) = parse_node_name(&self.cluster_name, name) else {
            warn!(cluster = %self.cluster_name, node = %name, "Dropping unparseable status entry");
            return;
        };
        if slot.role() != role {
            warn!(cluster = %self.cluster_name, node = %name, "Dropping status entry recorded under the wrong role");
            return;
        }
        if self.nodes.contains_key(name) {
            warn!(cluster = %self.cluster_name, node = %name, "Node recorded in more than one status map");
            return;
        }
        let mut node = TrackedNode::new(slot, state);
        node.node_id = node_status.node_id.clone();
        self.nodes.insert(name.to_string(), node);
    }

    /// Mark the desired node set. Every other tracked node becomes undesired.
    pub fn register_desired<'a>(&mut self, descriptors: impl IntoIterator<Item = &'a NodeDescriptor>) {
        for node in self.nodes.values_mut() {
            node.desired = false;
        }
        for descriptor in descriptors {
            self.nodes
                .entry(descriptor.name.clone())
                .or_insert_with(|| TrackedNode::new(descriptor.slot, NodeState::Absent))
                .desired = true;
        }
    }

    /// Record the outcome of a create request for a desired node.
    pub fn record_create(&mut self, name: &str, outcome: CreateOutcome) {
        let event = match outcome {
            CreateOutcome::Created => NodeEvent::CreateIssued,
            CreateOutcome::AlreadyExists => NodeEvent::AlreadyExists,
        };
        let applied = self.apply(name, event, TransitionContext::new(true, Observation::Missing));
        if applied {
            // A recreated pod gets a fresh node id.
            if let Some(node) = self.nodes.get_mut(name) {
                node.node_id.clear();
            }
        }
    }

    /// Feed this cycle's inventory to every tracked node.
    ///
    /// Units that parse as nodes of this cluster but are not tracked yet are
    /// adopted as undesired nodes so that they are reported until they go away.
    pub fn observe(&mut self, inventory: &Inventory) {
        for name in inventory.names() {
            if self.nodes.contains_key(name) {
                continue;
            }
            match parse_node_name(&self.cluster_name, name) {
                Some(slot) => {
                    debug!(cluster = %self.cluster_name, node = %name, "Tracking undesired node");
                    self.nodes
                        .insert(name.clone(), TrackedNode::new(slot, NodeState::Absent));
                }
                None => {
                    warn!(cluster = %self.cluster_name, node = %name, "Ignoring pod with an unknown node name");
                }
            }
        }

        let names: Vec<String> = self.nodes.keys().cloned().collect();
        for name in names {
            let Some(node) = self.nodes.get(&name) else {
                continue;
            };
            let observation = if inventory.is_ready(&name) {
                Observation::Ready
            } else if inventory.contains(&name) {
                Observation::NotReady
            } else {
                Observation::Missing
            };
            let from = node.state;
            let ctx = TransitionContext::new(node.desired, observation);
            if let Some(event) = determine_event(from, &ctx) {
                let applied = self.apply(&name, event, ctx);
                // The node may have restarted with a new id while it was down.
                if applied && from == NodeState::Failed && event == NodeEvent::ReadinessObserved {
                    if let Some(node) = self.nodes.get_mut(&name) {
                        node.node_id.clear();
                    }
                }
            }
        }

        self.nodes.retain(|_, node| node.state != NodeState::Removed);
    }

    fn apply(&mut self, name: &str, event: NodeEvent, ctx: TransitionContext) -> bool {
        let Some(node) = self.nodes.get_mut(name) else {
            warn!(cluster = %self.cluster_name, node = %name, %event, "Event for untracked node");
            return false;
        };
        match self.machine.transition(node.state, event, &ctx) {
            TransitionResult::Success {
                from,
                to,
                description,
                ..
            } => {
                node.state = to;
                if from != to {
                    debug!(
                        cluster = %self.cluster_name,
                        node = %name,
                        %from,
                        %to,
                        %event,
                        description,
                        "Node state transition"
                    );
                    self.transitions.push(NodeTransition {
                        node: name.to_string(),
                        from,
                        to,
                        event,
                    });
                }
                true
            }
            TransitionResult::InvalidTransition { current, event } => {
                warn!(cluster = %self.cluster_name, node = %name, %current, %event, "Invalid node transition");
                false
            }
            TransitionResult::GuardFailed { reason, .. } => {
                debug!(cluster = %self.cluster_name, node = %name, %event, reason = %reason, "Node transition guard failed");
                false
            }
        }
    }

    /// Current state of a node, if tracked.
    pub fn state(&self, name: &str) -> Option<NodeState> {
        self.nodes.get(name).map(|n| n.state)
    }

    /// Ready nodes that have no node id recorded yet.
    pub fn nodes_missing_id(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.state == NodeState::Ready && n.node_id.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Record a probed node id.
    pub fn set_node_id(&mut self, name: &str, node_id: String) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.node_id = node_id;
        }
    }

    /// Number of desired nodes that are ready.
    pub fn ready_desired(&self) -> i32 {
        let count = self
            .nodes
            .values()
            .filter(|n| n.desired && n.state == NodeState::Ready)
            .count();
        i32::try_from(count).unwrap_or(i32::MAX)
    }

    /// Names of nodes currently in the `Failed` state.
    pub fn failed_nodes(&self) -> BTreeSet<&str> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.state == NodeState::Failed)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// State changes applied so far, in order.
    pub fn transitions(&self) -> &[NodeTransition] {
        &self.transitions
    }

    pub fn into_transitions(self) -> Vec<NodeTransition> {
        self.transitions
    }

    /// Render the four status maps.
    ///
    /// `Creating` and `Absent` nodes appear in no map.
    pub fn node_maps(&self) -> NodeMaps {
        let mut maps = NodeMaps::default();
        for (name, node) in &self.nodes {
            let master_node_id = match node.slot {
                NodeSlot::Master { .. } => String::new(),
                NodeSlot::Replica { master, .. } => self
                    .nodes
                    .get(&master_name(&self.cluster_name, master))
                    .map(|m| m.node_id.clone())
                    .unwrap_or_default(),
            };
            let entry = NodeStatus {
                pod_name: name.clone(),
                node_id: node.node_id.clone(),
                master_node_id,
            };
            let target = match (node.state, node.slot.role()) {
                (NodeState::Ready, NodeRole::Master) => &mut maps.master_map,
                (NodeState::Ready, NodeRole::Replica) => &mut maps.replica_map,
                (NodeState::Failed, NodeRole::Master) => &mut maps.failed_master_map,
                (NodeState::Failed, NodeRole::Replica) => &mut maps.failed_replica_map,
                _ => continue,
            };
            target.insert(name.clone(), entry);
        }
        maps
    }
}
