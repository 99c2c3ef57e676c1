//! Custom Resource Definitions (CRDs) for redis-cluster-operator.
//!
//! - `RedisCluster`: desired master/replica layout and per-role node status

mod redis_cluster;

pub use redis_cluster::*;
