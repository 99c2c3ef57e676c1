//! Clients for talking to running Redis nodes.
//!
//! ## Architecture
//!
//! - `command_channel`: exec a command inside a node container (pod exec)
//! - `redis_cli`: `redis-cli` argv builders and reply parsing on top of the channel
//!
//! ## Example
//!
//! ```rust,ignore
//! use redis_cluster_operator::client::{KubeCommandChannel, redis_cli};
//!
//! let channel = KubeCommandChannel::new(client);
//! let id = redis_cli::cluster_myid(&channel, "default", "cache-master-0", 6379, timeout, &cancel).await?;
//! ```

pub mod command_channel;
pub mod redis_cli;

pub use command_channel::{CommandChannel, ExecError, KubeCommandChannel};
pub use redis_cli::{REDIS_CONTAINER, RedisCliError};
