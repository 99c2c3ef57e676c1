//! redis-cluster-operator - A Kubernetes operator that runs Redis clusters as bare pods.
//!
//! Startup order: logging, configuration, Kubernetes client, health server,
//! leader election, then the controller. Only the lease holder reconciles.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use redis_cluster_operator::OperatorConfig;
use redis_cluster_operator::health::{HealthState, run_health_server};
use redis_cluster_operator::run_controller;

const LEASE_NAME: &str = "redis-cluster-operator-leader";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Time given to in-flight reconciles after a shutdown signal
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;
    info!("Starting redis-cluster-operator");

    let config = OperatorConfig::from_env();
    info!(
        watch_namespace = ?config.watch_namespace,
        requeue_secs = config.requeue_after.as_secs(),
        reconcile_timeout_secs = config.reconcile_timeout.as_secs(),
        concurrency = config.concurrency,
        probe_node_ids = config.probe_node_ids,
        "Loaded configuration"
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    // Probes answer even while this instance waits for the lease.
    let health_state = Arc::new(HealthState::new());
    let health_handle = {
        let health_state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!(error = %e, "Health server failed");
            }
        })
    };

    let (holder_id, lease_namespace) = lease_identity();
    info!(
        holder_id = %holder_id,
        namespace = %lease_namespace,
        lease_name = LEASE_NAME,
        "Initializing leader election"
    );
    let lease_lock = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: LEASE_TTL,
        },
    );
    acquire_leadership(&lease_lock).await;
    let renewal_handle = spawn_lease_renewal(lease_lock);

    let controller_handle = {
        let health_state = health_state.clone();
        tokio::spawn(run_controller(client, Some(health_state), config))
    };

    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!(error = %e, "Health server task panicked");
            }
        }
        // Renewal only returns by panicking; a lost lease exits the process.
        Err(e) = renewal_handle => {
            error!(error = %e, "Lease renewal task panicked");
        }
        result = shutdown_signal() => {
            result?;
            drain(&health_state).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("redis_cluster_operator=info".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("kube_leader_election=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).json().init();
    Ok(())
}

/// Lease holder id and the namespace the Lease lives in.
fn lease_identity() -> (String, String) {
    let holder_id = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, using 'default'");
        "default".to_string()
    });
    (holder_id, namespace)
}

/// Block until this instance holds the lease.
async fn acquire_leadership(lease_lock: &LeaseLock) {
    info!("Waiting to acquire leadership");
    loop {
        match lease_lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership");
                return;
            }
            Ok(_) => info!("Another instance holds the lease, waiting"),
            Err(e) => warn!(error = %e, "Failed to acquire lease, retrying"),
        }
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
    }
}

/// Keep renewing the lease. Losing it exits the process so that Kubernetes
/// restarts it into a fresh election.
#[allow(clippy::exit)]
fn spawn_lease_renewal(lease_lock: LeaseLock) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
            match lease_lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {}
                Ok(_) => {
                    error!("Lost leadership, exiting");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(error = %e, "Failed to renew lease, exiting");
                    std::process::exit(1);
                }
            }
        }
    })
}

/// Stop taking new work and give in-flight reconciles a grace period.
async fn drain(health_state: &HealthState) {
    info!("Received shutdown signal");
    health_state.set_ready(false).await;
    info!(
        grace_secs = SHUTDOWN_GRACE_PERIOD.as_secs(),
        "Marked not ready, waiting for in-flight reconciles"
    );
    tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
}

/// Resolve on SIGINT or SIGTERM. Fails if a handler cannot be installed.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}
