//! [`ClusterPlatform`] backed by the Kubernetes API server.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::debug;

use super::{ClusterPlatform, CreateOutcome, NodeUnit, StatusWrite};
use crate::controller::context::FIELD_MANAGER;
use crate::controller::error::{Error, Result};
use crate::crd::{ClusterIdentity, RedisCluster, RedisClusterStatus};

/// Platform implementation talking to a live cluster.
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
}

impl KubePlatform {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn clusters(&self, namespace: &str) -> Api<RedisCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterPlatform for KubePlatform {
    async fn get_cluster(&self, cluster: &ClusterIdentity) -> Result<Option<RedisCluster>> {
        Ok(self
            .clusters(&cluster.namespace)
            .get_opt(&cluster.name)
            .await?)
    }

    async fn get_node(&self, namespace: &str, name: &str) -> Result<Option<NodeUnit>> {
        let pod = self.pods(namespace).get_opt(name).await?;
        Ok(pod.as_ref().map(NodeUnit::from))
    }

    async fn create_node(&self, pod: &Pod) -> Result<CreateOutcome> {
        let namespace = pod
            .namespace()
            .ok_or_else(|| Error::MissingField("metadata.namespace".to_string()))?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        match self.pods(&namespace).create(&params, pod).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(e) => {
                let err = Error::from(e);
                if err.is_already_exists() {
                    debug!(pod = %pod.name_any(), "Pod already exists");
                    Ok(CreateOutcome::AlreadyExists)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn list_nodes(&self, namespace: &str, label_selector: &str) -> Result<Vec<NodeUnit>> {
        let pods = self
            .pods(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(pods.items.iter().map(NodeUnit::from).collect())
    }

    async fn replace_status(
        &self,
        cluster: &RedisCluster,
        status: &RedisClusterStatus,
    ) -> Result<StatusWrite> {
        let identity = ClusterIdentity::of(cluster);
        if cluster.resource_version().is_none() {
            return Err(Error::MissingField("metadata.resourceVersion".to_string()));
        }

        // The resourceVersion carried over from the read makes this a
        // compare-and-swap: the API server rejects it with 409 if the object moved.
        let mut updated = cluster.clone();
        updated.status = Some(status.clone());
        let body = serde_json::to_vec(&updated)?;

        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match self
            .clusters(&identity.namespace)
            .replace_status(&identity.name, &params, body)
            .await
        {
            Ok(_) => Ok(StatusWrite::Applied),
            Err(e) => {
                let err = Error::from(e);
                if err.is_conflict() {
                    Ok(StatusWrite::Conflict)
                } else {
                    Err(err)
                }
            }
        }
    }
}
