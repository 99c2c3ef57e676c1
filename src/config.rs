//! Operator configuration read from the environment.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Default delay before re-checking a cluster that has not converged.
pub const DEFAULT_REQUEUE_SECS: u64 = 5;
/// Default upper bound for one reconcile invocation.
pub const DEFAULT_RECONCILE_TIMEOUT_SECS: u64 = 30;
/// Default resync interval for converged clusters.
pub const DEFAULT_RESYNC_SECS: u64 = 300;
/// Default number of clusters reconciled in parallel.
pub const DEFAULT_RECONCILE_CONCURRENCY: u16 = 4;
/// Default timeout for a single exec into a node.
pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 10;
/// Default port of the health and metrics server.
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Runtime settings of the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Namespace to watch. `None` watches all namespaces.
    pub watch_namespace: Option<String>,
    pub requeue_after: Duration,
    pub reconcile_timeout: Duration,
    pub resync_interval: Duration,
    pub concurrency: u16,
    pub exec_timeout: Duration,
    pub health_port: u16,
    /// Probe ready nodes for their cluster node id.
    pub probe_node_ids: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            requeue_after: Duration::from_secs(DEFAULT_REQUEUE_SECS),
            reconcile_timeout: Duration::from_secs(DEFAULT_RECONCILE_TIMEOUT_SECS),
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_SECS),
            concurrency: DEFAULT_RECONCILE_CONCURRENCY,
            exec_timeout: Duration::from_secs(DEFAULT_EXEC_TIMEOUT_SECS),
            health_port: DEFAULT_HEALTH_PORT,
            probe_node_ids: true,
        }
    }
}

impl OperatorConfig {
    /// Read the configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`. Unset or invalid values use defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            watch_namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.trim().is_empty()),
            requeue_after: secs(&lookup, "REQUEUE_SECS", defaults.requeue_after),
            reconcile_timeout: secs(&lookup, "RECONCILE_TIMEOUT_SECS", defaults.reconcile_timeout),
            resync_interval: secs(&lookup, "RESYNC_SECS", defaults.resync_interval),
            concurrency: parsed(&lookup, "RECONCILE_CONCURRENCY", defaults.concurrency),
            exec_timeout: secs(&lookup, "EXEC_TIMEOUT_SECS", defaults.exec_timeout),
            health_port: parsed(&lookup, "HEALTH_PORT", defaults.health_port),
            probe_node_ids: parsed(&lookup, "PROBE_NODE_IDS", defaults.probe_node_ids),
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(key = %key, value = %raw, default = ?default, "Invalid configuration value, using default");
            default
        }
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    match parsed(lookup, key, default.as_secs()) {
        0 => {
            warn!(key = %key, "Zero duration is not allowed, using default");
            default
        }
        n => Duration::from_secs(n),
    }
}
