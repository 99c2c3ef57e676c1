//! Shared context for the controller.
//!
//! The Context struct holds shared state that is passed to the reconciler:
//! the reconciliation engine, the event recorder, health state and settings.

use std::sync::Arc;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::client::KubeCommandChannel;
use crate::config::OperatorConfig;
use crate::controller::reconciler::{ReconcileSettings, Reconciler};
use crate::crd::RedisCluster;
use crate::health::HealthState;
use crate::platform::KubePlatform;

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "redis-cluster-operator";

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Reconciliation engine
    pub reconciler: Reconciler,
    /// Event recorder
    recorder: Recorder,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
    /// Operator settings
    pub config: OperatorConfig,
}

impl Context {
    /// Create a context backed by the Kubernetes API
    pub fn new(client: Client, health_state: Option<Arc<HealthState>>, config: OperatorConfig) -> Self {
        let reconciler = Reconciler::new(
            Arc::new(KubePlatform::new(client.clone())),
            Arc::new(KubeCommandChannel::new(client.clone())),
            ReconcileSettings::from(&config),
        );
        let reporter = Reporter {
            controller: FIELD_MANAGER.into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            reconciler,
            recorder: Recorder::new(client, reporter),
            health_state,
            config,
        }
    }

    async fn publish(
        &self,
        resource: &RedisCluster,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let object_ref = resource.object_ref(&());
        if let Err(e) = self
            .recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }

    /// Publish a normal event for a resource
    pub async fn publish_normal_event(
        &self,
        resource: &RedisCluster,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish(resource, EventType::Normal, reason, action, note)
            .await;
    }

    /// Publish a warning event for a resource
    pub async fn publish_warning_event(
        &self,
        resource: &RedisCluster,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish(resource, EventType::Warning, reason, action, note)
            .await;
    }
}
