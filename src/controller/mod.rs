//! Controller module for redis-cluster-operator.
//!
//! Contains the reconciliation engine and its building blocks:
//!
//! - `inventory`: lists the node pods of a cluster
//! - `node_state_machine`: per-node lifecycle transitions
//! - `topology`: tracks node states for one cycle and renders status maps
//! - `reconciler`: the engine driving one cluster towards its spec
//! - `cluster_reconciler`: the `kube::runtime::Controller` entry points

pub mod cluster_reconciler;
pub mod context;
pub mod error;
pub mod inventory;
pub mod node_state_machine;
pub mod reconciler;
pub mod status;
pub mod topology;
