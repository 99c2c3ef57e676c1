//! Controller entry points for RedisCluster.
//!
//! `reconcile` and `error_policy` are the functions handed to
//! `kube::runtime::Controller`. They bound each cycle with a timeout, run the
//! engine, and translate its outcome into metrics, Kubernetes events and a
//! requeue decision.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::ResourceExt;
use kube::runtime::controller::Action;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::controller::context::Context;
use crate::controller::error::Error;
use crate::controller::node_state_machine::NodeState;
use crate::controller::reconciler::ReconcileOutcome;
use crate::controller::status::is_condition_true;
use crate::crd::{ClusterIdentity, RedisCluster};

/// Reconcile a RedisCluster
///
/// This is the main reconciliation function called by the controller.
pub async fn reconcile(obj: Arc<RedisCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start_time = Instant::now();
    let identity = ClusterIdentity::of(&obj);

    debug!(name = %identity.name, namespace = %identity.namespace, "Reconciling RedisCluster");

    let cancel = CancellationToken::new();
    let deadline = spawn_deadline(cancel.clone(), ctx.config.reconcile_timeout);
    let result = ctx.reconciler.reconcile(&identity, &cancel).await;
    deadline.abort();

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Error::Validation(message) = &e {
                ctx.publish_warning_event(&obj, "ValidationFailed", "Validating", Some(message.clone()))
                    .await;
            }
            return Err(e);
        }
    };

    if !outcome.found {
        return Ok(Action::await_change());
    }

    publish_outcome_events(&obj, &ctx, &outcome).await;

    if let Some(ref health_state) = ctx.health_state {
        let duration = start_time.elapsed().as_secs_f64();
        let metrics = &health_state.metrics;
        metrics.record_reconcile(&identity.namespace, &identity.name, duration);
        metrics.set_cluster_nodes(
            &identity.namespace,
            &identity.name,
            i64::from(outcome.desired),
            i64::from(outcome.ready),
            i64::try_from(outcome.failed).unwrap_or(i64::MAX),
        );
        metrics.record_pods_created(
            &identity.namespace,
            &identity.name,
            u64::try_from(outcome.created.len()).unwrap_or_default(),
        );
        health_state.touch_reconcile();
    }

    Ok(next_action(&outcome, ctx.config.resync_interval))
}

/// Requeue while converging, otherwise fall back to the periodic resync.
pub fn next_action(outcome: &ReconcileOutcome, resync: Duration) -> Action {
    match outcome.requeue_after {
        Some(delay) => Action::requeue(delay),
        None => Action::requeue(resync),
    }
}

fn spawn_deadline(cancel: CancellationToken, timeout: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        cancel.cancel();
    })
}

async fn publish_outcome_events(obj: &RedisCluster, ctx: &Context, outcome: &ReconcileOutcome) {
    if !outcome.created.is_empty() {
        ctx.publish_normal_event(
            obj,
            "NodesCreated",
            "CreateNodes",
            Some(format!(
                "Created {} node pod(s): {}",
                outcome.created.len(),
                outcome.created.join(", ")
            )),
        )
        .await;
    }

    for transition in outcome
        .transitions
        .iter()
        .filter(|t| t.to == NodeState::Failed && t.from != NodeState::Failed)
    {
        ctx.publish_warning_event(
            obj,
            "NodeFailed",
            "Reconciling",
            Some(format!("Node {} failed ({})", transition.node, transition.event)),
        )
        .await;
    }

    let was_ready = obj
        .status
        .as_ref()
        .is_some_and(|s| is_condition_true(&s.conditions, "Ready"));
    if outcome.is_converged() && outcome.status_written && !was_ready {
        ctx.publish_normal_event(
            obj,
            "ClusterReady",
            "Reconciling",
            Some(format!("{}/{} nodes ready", outcome.ready, outcome.desired)),
        )
        .await;
    }
}

/// Error policy for the controller
pub fn error_policy(obj: Arc<RedisCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    // Record error metric
    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    if matches!(error, Error::Cancelled) {
        warn!(name = %name, "Reconcile timed out, retrying");
        return Action::requeue(ctx.config.requeue_after);
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable error, will retry");
        Action::requeue(error.requeue_after())
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
        Action::requeue(error.requeue_after())
    }
}
