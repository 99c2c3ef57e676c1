//! Resource generation module.
//!
//! Contains utilities for generating the Kubernetes resources owned by a
//! RedisCluster. Every node runs in its own Pod, owned by the cluster.

pub mod common;
pub mod node;

// Re-export commonly used items from common
pub use common::{owner_reference, standard_labels};
