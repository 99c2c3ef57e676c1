//! Command channel into running node pods.
//!
//! Runs a command inside a pod container through the Kubernetes exec
//! subresource and returns its captured output. The [`CommandChannel`] trait
//! is the seam the reconciler depends on, [`KubeCommandChannel`] is the
//! websocket-backed implementation.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::AttachParams;
use kube::{Api, Client};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Errors that can occur while executing a command in a pod.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// The exec session could not be opened or broke mid-stream.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The remote command ran and reported failure.
    #[error("Remote command failed: {message}; output: {output}")]
    RemoteFailure { message: String, output: String },

    /// The command did not finish in time.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the exec.
    #[error("Exec cancelled")]
    Cancelled,
}

impl ExecError {
    /// Check if the exec may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecError::Connection(_) | ExecError::Timeout(_) | ExecError::Cancelled => true,
            ExecError::RemoteFailure { .. } => false,
        }
    }
}

/// Executes commands inside node containers.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Run `argv` in `container` of pod `namespace/pod` and return the combined
    /// stdout and stderr.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        argv: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, ExecError>;
}

/// Command channel backed by the Kubernetes pod exec subresource.
#[derive(Clone)]
pub struct KubeCommandChannel {
    client: Client,
}

impl KubeCommandChannel {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn run(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        argv: &[String],
    ) -> Result<String, ExecError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = pods
            .exec(pod, argv.to_vec(), &params)
            .await
            .map_err(|e| ExecError::Connection(e.to_string()))?;

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();

        let (out, err) = tokio::try_join!(read_stream(stdout), read_stream(stderr))?;
        let mut combined = out;
        combined.push_str(&err);

        let status = match status {
            Some(status) => status.await,
            None => None,
        };

        attached
            .join()
            .await
            .map_err(|e| ExecError::Connection(e.to_string()))?;

        match status {
            Some(s) if s.status.as_deref() == Some("Failure") => Err(ExecError::RemoteFailure {
                message: s.message.unwrap_or_else(|| "command failed".to_string()),
                output: combined,
            }),
            _ => Ok(combined),
        }
    }
}

#[async_trait]
impl CommandChannel for KubeCommandChannel {
    #[instrument(skip(self, cancel), fields(namespace = %namespace, pod = %pod))]
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        argv: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, ExecError> {
        debug!(argv = ?argv, "Executing command in pod");
        tokio::select! {
            _ = cancel.cancelled() => Err(ExecError::Cancelled),
            result = tokio::time::timeout(timeout, self.run(namespace, pod, container, argv)) => {
                result.map_err(|_| ExecError::Timeout(timeout))?
            }
        }
    }
}

async fn read_stream<R>(stream: Option<R>) -> Result<String, ExecError>
where
    R: AsyncRead + Unpin,
{
    let Some(mut stream) = stream else {
        return Ok(String::new());
    };
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .await
        .map_err(|e| ExecError::Connection(e.to_string()))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
