//! Finite state machine for the lifecycle of a single cluster node.
//!
//! Every node identity moves through `Absent → Creating → Ready → Failed`,
//! with `Removed` as the terminal state reached only when the identity is no
//! longer desired and its pod is gone. Transitions are table-driven so that
//! only the listed moves can happen.

use std::fmt;

/// Lifecycle state of one node identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NodeState {
    /// Known to be desired, nothing created or observed yet.
    #[default]
    Absent,
    /// A pod exists or was requested but has not been ready yet.
    Creating,
    /// The pod's Redis container is ready.
    Ready,
    /// The node was ready once and is not any more.
    Failed,
    /// No longer desired and gone from the platform.
    Removed,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Absent => write!(f, "Absent"),
            NodeState::Creating => write!(f, "Creating"),
            NodeState::Ready => write!(f, "Ready"),
            NodeState::Failed => write!(f, "Failed"),
            NodeState::Removed => write!(f, "Removed"),
        }
    }
}

/// Events that trigger node state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeEvent {
    /// A create request for the node's pod was accepted
    CreateIssued,
    /// A create request raced with another creator
    AlreadyExists,
    /// The pod is present but not ready
    UnitObserved,
    /// The pod's Redis container reports ready
    ReadinessObserved,
    /// A previously ready pod stopped reporting ready
    ReadinessLost,
    /// A previously ready pod vanished while still desired
    Disappeared,
    /// The identity is no longer desired and its pod is gone
    ScaledDown,
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeEvent::CreateIssued => write!(f, "CreateIssued"),
            NodeEvent::AlreadyExists => write!(f, "AlreadyExists"),
            NodeEvent::UnitObserved => write!(f, "UnitObserved"),
            NodeEvent::ReadinessObserved => write!(f, "ReadinessObserved"),
            NodeEvent::ReadinessLost => write!(f, "ReadinessLost"),
            NodeEvent::Disappeared => write!(f, "Disappeared"),
            NodeEvent::ScaledDown => write!(f, "ScaledDown"),
        }
    }
}

/// What the inventory says about a node in this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Ready,
    NotReady,
    Missing,
}

/// Context information available during state transitions
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext {
    /// Whether the identity is part of the desired node set
    pub desired: bool,
    /// Inventory observation for this cycle
    pub observation: Observation,
}

impl TransitionContext {
    pub fn new(desired: bool, observation: Observation) -> Self {
        Self {
            desired,
            observation,
        }
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: NodeState,
    pub to: NodeState,
    pub event: NodeEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: NodeState,
        to: NodeState,
        event: NodeEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was successful
    Success {
        from: NodeState,
        to: NodeState,
        event: NodeEvent,
        description: &'static str,
    },
    /// Transition was not valid for current state
    InvalidTransition { current: NodeState, event: NodeEvent },
    /// Guard condition prevented the transition
    GuardFailed {
        from: NodeState,
        to: NodeState,
        event: NodeEvent,
        reason: String,
    },
}

/// Transition table for node lifecycles
pub struct NodeStateMachine {
    transitions: Vec<Transition>,
}

impl Default for NodeStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStateMachine {
    /// Create a new state machine with the defined transition table
    pub fn new() -> Self {
        use NodeEvent::*;
        use NodeState::*;

        Self {
            transitions: vec![
                // === Absent ===
                Transition::new(Absent, Creating, CreateIssued, "Pod creation requested"),
                Transition::new(Absent, Creating, AlreadyExists, "Pod was created concurrently"),
                Transition::new(Absent, Creating, UnitObserved, "Existing pod found, not ready yet"),
                Transition::new(Absent, Ready, ReadinessObserved, "Existing pod found ready"),
                Transition::new(Absent, Removed, ScaledDown, "Dropped before creation"),
                // === Creating ===
                Transition::new(Creating, Creating, CreateIssued, "Pod creation re-requested"),
                Transition::new(Creating, Creating, AlreadyExists, "Pod already requested"),
                Transition::new(Creating, Ready, ReadinessObserved, "Pod became ready"),
                Transition::new(Creating, Removed, ScaledDown, "Scaled down before becoming ready"),
                // === Ready ===
                Transition::new(Ready, Failed, ReadinessLost, "Pod stopped reporting ready"),
                Transition::new(Ready, Failed, Disappeared, "Pod vanished unexpectedly"),
                Transition::new(Ready, Failed, CreateIssued, "Pod vanished and is being recreated"),
                Transition::new(Ready, Failed, AlreadyExists, "Pod vanished and was recreated concurrently"),
                Transition::new(Ready, Removed, ScaledDown, "Scaled down"),
                // === Failed ===
                Transition::new(Failed, Ready, ReadinessObserved, "Pod recovered"),
                Transition::new(Failed, Failed, CreateIssued, "Failed pod is being recreated"),
                Transition::new(Failed, Failed, AlreadyExists, "Failed pod was recreated concurrently"),
                Transition::new(Failed, Removed, ScaledDown, "Failed node scaled down"),
                // === Removed (terminal) ===
            ],
        }
    }

    /// Attempt to transition to a new state based on an event
    pub fn transition(
        &self,
        current: NodeState,
        event: NodeEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition { current, event },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: NodeState, event: NodeEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.event == event)
    }

    /// Get all valid events for a given state
    pub fn valid_events(&self, state: NodeState) -> Vec<NodeEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == state)
            .map(|t| t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match transition.event {
            NodeEvent::Disappeared if !ctx.desired => {
                Some("Node is not desired, disappearance is a scale-down".to_string())
            }
            NodeEvent::ScaledDown if ctx.desired => {
                Some("Node is still desired".to_string())
            }
            NodeEvent::ScaledDown if ctx.observation != Observation::Missing => {
                Some("Pod still exists".to_string())
            }
            _ => None,
        }
    }
}

/// Determine the event implied by this cycle's inventory observation.
///
/// `None` means the observation does not change the node's state.
pub fn determine_event(current: NodeState, ctx: &TransitionContext) -> Option<NodeEvent> {
    match (ctx.observation, current) {
        (_, NodeState::Removed) => None,
        (Observation::Ready, NodeState::Ready) => None,
        (Observation::Ready, _) => Some(NodeEvent::ReadinessObserved),
        (Observation::NotReady, NodeState::Absent) => Some(NodeEvent::UnitObserved),
        (Observation::NotReady, NodeState::Ready) => Some(NodeEvent::ReadinessLost),
        (Observation::NotReady, _) => None,
        (Observation::Missing, _) if !ctx.desired => Some(NodeEvent::ScaledDown),
        (Observation::Missing, NodeState::Ready) => Some(NodeEvent::Disappeared),
        // Creating: the pod may not be visible in the list yet.
        // Failed: stays failed until it comes back ready.
        (Observation::Missing, _) => None,
    }
}
