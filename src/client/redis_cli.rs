//! `redis-cli` commands issued through the command channel.
//!
//! Node pods ship `redis-cli`, so cluster administration runs inside the
//! target container instead of over a direct TCP connection from the operator.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::client::command_channel::{CommandChannel, ExecError};

/// Name of the container that runs the Redis server in every node pod.
pub const REDIS_CONTAINER: &str = "redis";

/// Length of a Redis cluster node id.
const NODE_ID_LEN: usize = 40;

/// Errors from `redis-cli` invocations.
#[derive(Error, Debug)]
pub enum RedisCliError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("Unexpected reply to `{command}`: {reply}")]
    UnexpectedReply { command: String, reply: String },
}

/// Build the argv for `redis-cli -p <port> <args...>`.
pub fn redis_cli_args(port: i32, args: &[&str]) -> Vec<String> {
    let mut argv = vec!["redis-cli".to_string(), "-p".to_string(), port.to_string()];
    argv.extend(args.iter().map(|a| (*a).to_string()));
    argv
}

/// Parse the reply of `CLUSTER MYID`.
///
/// redis-cli prints error replies on stdout with an `ERR` prefix and still
/// exits 0, so the reply text is validated rather than trusted.
pub fn parse_node_id(reply: &str) -> Option<String> {
    let id = reply.trim();
    (id.len() == NODE_ID_LEN && id.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| id.to_ascii_lowercase())
}

/// Ask a node for its cluster node id.
pub async fn cluster_myid(
    channel: &dyn CommandChannel,
    namespace: &str,
    pod: &str,
    port: i32,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<String, RedisCliError> {
    let argv = redis_cli_args(port, &["cluster", "myid"]);
    let reply = channel
        .exec(namespace, pod, REDIS_CONTAINER, &argv, timeout, cancel)
        .await?;
    parse_node_id(&reply).ok_or_else(|| RedisCliError::UnexpectedReply {
        command: "CLUSTER MYID".to_string(),
        reply: reply.trim().to_string(),
    })
}
