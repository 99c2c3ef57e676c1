//! In-memory platform and command channel for functional tests.
//!
//! `MockPlatform` stores RedisCluster objects and node pods behind a mutex and
//! mimics the API server semantics the engine relies on:
//! - creating an existing pod reports `AlreadyExists`
//! - status writes are compare-and-swap on `resourceVersion`
//!
//! Every call yields to the runtime first, so two reconciles joined on the
//! same task interleave at each platform call.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_util::sync::CancellationToken;

use redis_cluster_operator::client::{CommandChannel, ExecError};
use redis_cluster_operator::controller::error::{Error, Result};
use redis_cluster_operator::controller::reconciler::{ReconcileOutcome, ReconcileSettings, Reconciler};
use redis_cluster_operator::crd::{
    ClusterIdentity, RedisCluster, RedisClusterSpec, RedisClusterStatus,
};
use redis_cluster_operator::platform::{ClusterPlatform, CreateOutcome, NodeUnit, StatusWrite};
use redis_cluster_operator::resources::common::CLUSTER_NAME_LABEL;

pub const NAMESPACE: &str = "default";

#[derive(Default)]
struct PlatformState {
    clusters: BTreeMap<(String, String), RedisCluster>,
    pods: BTreeMap<(String, String), NodeUnit>,
    pod_specs: BTreeMap<(String, String), Pod>,
    create_calls: usize,
    created: Vec<String>,
    status_writes: usize,
    conflicts: usize,
    fail_list: bool,
    fail_create: BTreeSet<String>,
    cancel_on_list: Option<CancellationToken>,
    interfering_status: Option<RedisClusterStatus>,
}

/// In-memory stand-in for the Kubernetes API.
#[derive(Default)]
pub struct MockPlatform {
    state: Mutex<PlatformState>,
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store a cluster object with resourceVersion "1".
    pub fn add_cluster(&self, mut cluster: RedisCluster) {
        cluster.metadata.resource_version = Some("1".to_string());
        let namespace = cluster.metadata.namespace.clone().unwrap_or_default();
        let name = cluster.metadata.name.clone().unwrap_or_default();
        self.state
            .lock()
            .unwrap()
            .clusters
            .insert(key(&namespace, &name), cluster);
    }

    /// Replace the desired layout of a stored cluster, bumping generation.
    pub fn update_spec(&self, name: &str, spec: RedisClusterSpec) {
        let mut state = self.state.lock().unwrap();
        let cluster = state.clusters.get_mut(&key(NAMESPACE, name)).unwrap();
        cluster.spec = spec;
        cluster.metadata.generation = cluster.metadata.generation.map(|g| g + 1);
        bump(cluster);
    }

    pub fn cluster(&self, name: &str) -> RedisCluster {
        self.state.lock().unwrap().clusters[&key(NAMESPACE, name)].clone()
    }

    pub fn status(&self, name: &str) -> RedisClusterStatus {
        self.cluster(name).status.unwrap_or_default()
    }

    /// Overwrite status out of band, as another writer would.
    pub fn set_status(&self, name: &str, status: RedisClusterStatus) {
        let mut state = self.state.lock().unwrap();
        let cluster = state.clusters.get_mut(&key(NAMESPACE, name)).unwrap();
        cluster.status = Some(status);
        bump(cluster);
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .pods
            .keys()
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn pod_spec(&self, name: &str) -> Pod {
        self.state.lock().unwrap().pod_specs[&key(NAMESPACE, name)].clone()
    }

    /// Mark a pod Running with its redis container ready or not ready.
    pub fn set_ready(&self, name: &str, ready: bool) {
        let mut state = self.state.lock().unwrap();
        let unit = state.pods.get_mut(&key(NAMESPACE, name)).unwrap();
        unit.phase = Some("Running".to_string());
        unit.ready_containers = if ready {
            BTreeSet::from(["redis".to_string()])
        } else {
            BTreeSet::new()
        };
    }

    pub fn set_all_ready(&self) {
        for name in self.pod_names() {
            self.set_ready(&name, true);
        }
    }

    pub fn delete_pod(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.pods.remove(&key(NAMESPACE, name));
        state.pod_specs.remove(&key(NAMESPACE, name));
    }

    /// Insert a pod that was not created by the engine.
    pub fn add_pod(&self, namespace: &str, name: &str, cluster_label: &str, ready: bool) {
        let unit = NodeUnit {
            name: name.to_string(),
            namespace: namespace.to_string(),
            labels: BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), cluster_label.to_string())]),
            phase: Some("Running".to_string()),
            ready_containers: if ready {
                BTreeSet::from(["redis".to_string()])
            } else {
                BTreeSet::new()
            },
        };
        self.state
            .lock()
            .unwrap()
            .pods
            .insert(key(namespace, name), unit);
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().unwrap().create_calls
    }

    /// Pods actually created, in creation order.
    pub fn created(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn status_writes(&self) -> usize {
        self.state.lock().unwrap().status_writes
    }

    pub fn conflicts(&self) -> usize {
        self.state.lock().unwrap().conflicts
    }

    pub fn fail_list(&self, fail: bool) {
        self.state.lock().unwrap().fail_list = fail;
    }

    pub fn fail_create(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_create
            .insert(name.to_string());
    }

    /// Have another writer store `status` right before the next status write.
    pub fn interfere_before_write(&self, status: RedisClusterStatus) {
        self.state.lock().unwrap().interfering_status = Some(status);
    }

    /// Cancel `token` when the node inventory is listed.
    pub fn cancel_on_list(&self, token: CancellationToken) {
        self.state.lock().unwrap().cancel_on_list = Some(token);
    }
}

fn bump(cluster: &mut RedisCluster) {
    let next = cluster
        .metadata
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    cluster.metadata.resource_version = Some(next.to_string());
}

#[async_trait]
impl ClusterPlatform for MockPlatform {
    async fn get_cluster(&self, cluster: &ClusterIdentity) -> Result<Option<RedisCluster>> {
        tokio::task::yield_now().await;
        Ok(self
            .state
            .lock()
            .unwrap()
            .clusters
            .get(&key(&cluster.namespace, &cluster.name))
            .cloned())
    }

    async fn get_node(&self, namespace: &str, name: &str) -> Result<Option<NodeUnit>> {
        tokio::task::yield_now().await;
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .get(&key(namespace, name))
            .cloned())
    }

    async fn create_node(&self, pod: &Pod) -> Result<CreateOutcome> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().unwrap();
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();
        state.create_calls += 1;
        if state.fail_create.contains(&name) {
            return Err(Error::Transient(format!("create of {} failed", name)));
        }
        let k = key(&namespace, &name);
        if state.pods.contains_key(&k) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        state.pods.insert(k.clone(), NodeUnit::from(pod));
        state.pod_specs.insert(k, pod.clone());
        state.created.push(name);
        Ok(CreateOutcome::Created)
    }

    async fn list_nodes(&self, namespace: &str, label_selector: &str) -> Result<Vec<NodeUnit>> {
        tokio::task::yield_now().await;
        let state = self.state.lock().unwrap();
        if let Some(token) = &state.cancel_on_list {
            token.cancel();
        }
        if state.fail_list {
            return Err(Error::Transient("list failed".to_string()));
        }
        let (label, value) = label_selector.split_once('=').unwrap();
        Ok(state
            .pods
            .iter()
            .filter(|((ns, _), unit)| ns == namespace && unit.label(label) == Some(value))
            .map(|(_, unit)| unit.clone())
            .collect())
    }

    async fn replace_status(
        &self,
        cluster: &RedisCluster,
        status: &RedisClusterStatus,
    ) -> Result<StatusWrite> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().unwrap();
        let namespace = cluster.metadata.namespace.clone().unwrap_or_default();
        let name = cluster.metadata.name.clone().unwrap_or_default();
        let interfering = state.interfering_status.take();
        let Some(stored) = state.clusters.get_mut(&key(&namespace, &name)) else {
            return Err(Error::Transient("cluster vanished".to_string()));
        };
        if let Some(other) = interfering {
            stored.status = Some(other);
            bump(stored);
        }
        if stored.metadata.resource_version != cluster.metadata.resource_version {
            state.conflicts += 1;
            return Ok(StatusWrite::Conflict);
        }
        stored.status = Some(status.clone());
        bump(stored);
        state.status_writes += 1;
        Ok(StatusWrite::Applied)
    }
}

/// Command channel answering `CLUSTER MYID` from a table of node ids.
#[derive(Default)]
pub struct MockChannel {
    ids: Mutex<BTreeMap<String, String>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl MockChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_id(&self, pod: &str, id: impl Into<String>) {
        self.ids.lock().unwrap().insert(pod.to_string(), id.into());
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandChannel for MockChannel {
    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        _container: &str,
        argv: &[String],
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<String, ExecError> {
        tokio::task::yield_now().await;
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        self.calls
            .lock()
            .unwrap()
            .push((pod.to_string(), argv.to_vec()));
        match self.ids.lock().unwrap().get(pod) {
            Some(id) => Ok(format!("{}\n", id)),
            None => Err(ExecError::Connection(format!("{} unreachable", pod))),
        }
    }
}

/// Command channel whose sessions never answer; they only end on cancellation.
#[derive(Default)]
pub struct HangingChannel {
    calls: Mutex<usize>,
}

impl HangingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl CommandChannel for HangingChannel {
    async fn exec(
        &self,
        _namespace: &str,
        _pod: &str,
        _container: &str,
        _argv: &[String],
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<String, ExecError> {
        *self.calls.lock().unwrap() += 1;
        cancel.cancelled().await;
        Err(ExecError::Cancelled)
    }
}

/// Deterministic 40-character node id for a pod.
pub fn node_id_for(pod: &str) -> String {
    let seed = pod.bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(u64::from(b)));
    format!("{:040x}", seed)
}

/// Build a RedisCluster named `name` in the default namespace.
pub fn redis_cluster(name: &str, masters: i32, replicas: i32) -> RedisCluster {
    let mut cluster = RedisCluster::new(
        name,
        RedisClusterSpec {
            masters,
            replicas,
            ..Default::default()
        },
    );
    cluster.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(NAMESPACE.to_string()),
        uid: Some(format!("{}-uid", name)),
        generation: Some(1),
        ..Default::default()
    };
    cluster
}

/// Test harness wiring a reconciler to the mocks.
pub struct Harness {
    pub platform: Arc<MockPlatform>,
    pub channel: Arc<MockChannel>,
    pub reconciler: Reconciler,
    pub identity: ClusterIdentity,
}

impl Harness {
    /// Harness with a stored cluster `name` of the given shape.
    pub fn new(name: &str, masters: i32, replicas: i32) -> Self {
        let platform = MockPlatform::new();
        platform.add_cluster(redis_cluster(name, masters, replicas));
        Self::with_platform(platform, name)
    }

    pub fn with_platform(platform: Arc<MockPlatform>, name: &str) -> Self {
        let channel = MockChannel::new();
        let reconciler = Reconciler::new(
            platform.clone(),
            channel.clone(),
            ReconcileSettings::default(),
        );
        Self {
            platform,
            channel,
            reconciler,
            identity: ClusterIdentity::new(NAMESPACE, name),
        }
    }

    /// Give every existing pod a node id the channel will report.
    pub fn assign_ids(&self) {
        for pod in self.platform.pod_names() {
            self.channel.set_id(&pod, node_id_for(&pod));
        }
    }

    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        self.reconciler
            .reconcile(&self.identity, &CancellationToken::new())
            .await
    }
}
