//! Status management utilities.
//!
//! Provides helpers for building status conditions and assembling the status
//! object written back to a RedisCluster.

use crate::crd::{Condition, RedisClusterStatus};

/// Reasons used on the Ready condition.
pub mod reasons {
    pub const ALL_NODES_READY: &str = "AllNodesReady";
    pub const NODES_PENDING: &str = "NodesPending";
    pub const NODES_FAILED: &str = "NodesFailed";
}

/// Builder for managing conditions list
///
/// Seeded with the stored conditions so that a condition whose status did
/// not change keeps its `lastTransitionTime`.
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
}

impl ConditionBuilder {
    /// Create a new condition builder
    pub fn new() -> Self {
        Self {
            conditions: Vec::new(),
        }
    }

    /// Start from previously stored conditions
    pub fn from_existing(conditions: &[Condition]) -> Self {
        Self {
            conditions: conditions.to_vec(),
        }
    }

    /// Add or update a condition
    pub fn set(&mut self, mut condition: Condition) -> &mut Self {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
        self
    }

    /// Set Ready condition
    pub fn ready(
        &mut self,
        ready: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::ready(ready, reason, message, generation))
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

impl Default for ConditionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if a condition type is true
pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .is_some_and(|c| c.status == "True")
}

/// Get the reason for a condition
pub fn get_condition_reason<'a>(
    conditions: &'a [Condition],
    condition_type: &str,
) -> Option<&'a str> {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .map(|c| c.reason.as_str())
}

/// Pick the Ready condition for a node count summary.
pub fn ready_condition_for(
    previous: &[Condition],
    ready: i32,
    desired: i32,
    failed: usize,
    generation: Option<i64>,
) -> Vec<Condition> {
    let message = format!("{}/{} nodes ready", ready, desired);
    let mut builder = ConditionBuilder::from_existing(previous);
    if ready == desired {
        builder.ready(true, reasons::ALL_NODES_READY, &message, generation);
    } else if failed > 0 {
        let message = format!("{}, {} failed", message, failed);
        builder.ready(false, reasons::NODES_FAILED, &message, generation);
    } else {
        builder.ready(false, reasons::NODES_PENDING, &message, generation);
    }
    builder.build()
}

/// Whether a computed status differs from the stored one.
pub fn status_changed(stored: Option<&RedisClusterStatus>, computed: &RedisClusterStatus) -> bool {
    stored != Some(computed)
}

/// Equality that ignores condition transition times.
///
/// Two writers that observed the same topology agree on everything except the
/// instant they stamped a flipped condition.
pub fn same_observed_state(a: &RedisClusterStatus, b: &RedisClusterStatus) -> bool {
    fn without_times(status: &RedisClusterStatus) -> RedisClusterStatus {
        let mut status = status.clone();
        for condition in &mut status.conditions {
            condition.last_transition_time.clear();
        }
        status
    }
    without_times(a) == without_times(b)
}
