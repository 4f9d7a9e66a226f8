//! Shared fixtures for unit tests.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{DeploymentConfig, RetryConfig, SaltConfig};
use crate::deployment::{CreateClusterRequest, DeploymentManager};
use crate::error::{ControlError, ControlResult};
use crate::pipeline::{InstallerSettings, NodeInstaller};
use crate::salt::MockConfigManagement;
use crate::scale::ScaleGate;
use crate::ssh::{MockShell, NodeCredentials, SshExecutionLog, SshExecutor};
use crate::store::{ClusterStore, DeploymentFilter, LogFilter, MemoryStore, StoreLogSink};
use crate::tracker::{DeploymentSnapshot, DeploymentTracker};
use crate::types::{
    Cluster, ClusterConfig, ClusterId, ClusterStatus, DeploymentId, DeploymentRecord, InstallStep,
    InstallTask, Node, NodeId, NodeRole, NodeSpec, NodeStatus, Step,
};

pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    /// What the manager and pipelines actually write through.
    pub faults: Arc<FaultyStore>,
    pub shell: Arc<MockShell>,
    pub salt: Arc<MockConfigManagement>,
    pub manager: Arc<DeploymentManager>,
    pub gate: ScaleGate,
}

pub(crate) fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 1,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        multiplier: 2.0,
    }
}

impl Harness {
    pub fn new(shell: MockShell, salt: MockConfigManagement) -> Self {
        let store = Arc::new(MemoryStore::new());
        let faults = Arc::new(FaultyStore::new(store.clone()));
        let shell = Arc::new(shell);
        let salt = Arc::new(salt);
        let ssh = Arc::new(SshExecutor::new(
            shell.clone(),
            Arc::new(StoreLogSink(faults.clone())),
            Duration::from_secs(5),
        ));
        let installer = Arc::new(NodeInstaller::new(
            faults.clone(),
            ssh,
            salt.clone(),
            InstallerSettings {
                salt: SaltConfig::default(),
                download_command: "stage {packages}".to_owned(),
                retry: fast_retry(),
                agent_registration: Duration::from_millis(100),
                agent_poll: Duration::from_millis(5),
            },
        ));
        let config = DeploymentConfig {
            retry: fast_retry(),
            ..DeploymentConfig::default()
        };
        let tracker = Arc::new(DeploymentTracker::new(Duration::from_secs(60)));
        let manager = Arc::new(DeploymentManager::new(
            faults.clone(),
            installer,
            tracker,
            config,
            "10.0.0.1",
        ));
        let gate = ScaleGate::new(manager.clone(), salt.clone());
        Self {
            store,
            faults,
            shell,
            salt,
            manager,
            gate,
        }
    }

    pub fn permissive() -> Self {
        Self::new(MockShell::new(), MockConfigManagement::permissive())
    }

    /// Create `hpc1`: master `m1` plus computes `c1` and `c2`.
    pub async fn hpc1(&self) -> ClusterId {
        self.manager
            .create_cluster(CreateClusterRequest {
                name: "hpc1".to_owned(),
                description: None,
                salt_master: None,
                config: ClusterConfig::default(),
                nodes: vec![
                    spec("m1", NodeRole::Master, "10.0.0.1"),
                    spec("c1", NodeRole::Compute, "10.0.0.2"),
                    spec("c2", NodeRole::Compute, "10.0.0.3"),
                ],
            })
            .await
            .unwrap()
            .cluster
            .id
    }

    pub async fn wait_terminal(&self, id: &DeploymentId) -> DeploymentSnapshot {
        let mut rx = self.manager.tracker().subscribe(id).unwrap();
        let snapshot = tokio::time::timeout(
            Duration::from_secs(10),
            rx.wait_for(DeploymentSnapshot::is_terminal),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        snapshot
    }
}

pub(crate) fn spec(name: &str, role: NodeRole, host: &str) -> NodeSpec {
    NodeSpec {
        name: name.to_owned(),
        role,
        host: host.to_owned(),
        port: 22,
        credentials: NodeCredentials::default(),
        resources: Default::default(),
        config: serde_json::Value::Null,
    }
}

/// Memory store that can be told to fail cluster status writes.
pub(crate) struct FaultyStore {
    inner: Arc<MemoryStore>,
    fail_cluster_status: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_cluster_status: AtomicBool::new(false),
        }
    }

    pub fn fail_cluster_status(&self, fail: bool) {
        self.fail_cluster_status.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterStore for FaultyStore {
    async fn create_cluster(&self, cluster: &Cluster, nodes: &[Node]) -> ControlResult<()> {
        self.inner.create_cluster(cluster, nodes).await
    }

    async fn get_cluster(&self, id: &ClusterId) -> ControlResult<Option<Cluster>> {
        self.inner.get_cluster(id).await
    }

    async fn list_clusters(&self) -> ControlResult<Vec<Cluster>> {
        self.inner.list_clusters().await
    }

    async fn update_cluster_status(
        &self,
        id: &ClusterId,
        status: ClusterStatus,
    ) -> ControlResult<()> {
        if self.fail_cluster_status.load(Ordering::SeqCst) {
            return Err(ControlError::internal("cluster status write refused"));
        }
        self.inner.update_cluster_status(id, status).await
    }

    async fn insert_nodes(&self, nodes: &[Node]) -> ControlResult<()> {
        self.inner.insert_nodes(nodes).await
    }

    async fn get_node(&self, id: &NodeId) -> ControlResult<Option<Node>> {
        self.inner.get_node(id).await
    }

    async fn list_nodes(&self, cluster_id: &ClusterId) -> ControlResult<Vec<Node>> {
        self.inner.list_nodes(cluster_id).await
    }

    async fn update_node_status(&self, id: &NodeId, status: NodeStatus) -> ControlResult<()> {
        self.inner.update_node_status(id, status).await
    }

    async fn create_deployment(
        &self,
        record: &DeploymentRecord,
        tasks: &[InstallTask],
    ) -> ControlResult<()> {
        self.inner.create_deployment(record, tasks).await
    }

    async fn get_deployment(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        self.inner.get_deployment(id).await
    }

    async fn update_deployment(&self, record: &DeploymentRecord) -> ControlResult<()> {
        self.inner.update_deployment(record).await
    }

    async fn list_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> ControlResult<Vec<DeploymentRecord>> {
        self.inner.list_deployments(filter).await
    }

    async fn active_deployment(
        &self,
        cluster_id: &ClusterId,
    ) -> ControlResult<Option<DeploymentRecord>> {
        self.inner.active_deployment(cluster_id).await
    }

    async fn list_tasks(&self, deployment_id: &DeploymentId) -> ControlResult<Vec<InstallTask>> {
        self.inner.list_tasks(deployment_id).await
    }

    async fn update_task(&self, task: &InstallTask) -> ControlResult<()> {
        self.inner.update_task(task).await
    }

    async fn upsert_step(&self, step: &Step) -> ControlResult<()> {
        self.inner.upsert_step(step).await
    }

    async fn list_steps(&self, deployment_id: &DeploymentId) -> ControlResult<Vec<Step>> {
        self.inner.list_steps(deployment_id).await
    }

    async fn upsert_install_step(&self, step: &InstallStep) -> ControlResult<()> {
        self.inner.upsert_install_step(step).await
    }

    async fn list_install_steps(
        &self,
        deployment_id: &DeploymentId,
    ) -> ControlResult<Vec<InstallStep>> {
        self.inner.list_install_steps(deployment_id).await
    }

    async fn insert_ssh_log(&self, log: &SshExecutionLog) -> ControlResult<()> {
        self.inner.insert_ssh_log(log).await
    }

    async fn list_ssh_logs(
        &self,
        deployment_id: &DeploymentId,
        filter: &LogFilter,
    ) -> ControlResult<Vec<SshExecutionLog>> {
        self.inner.list_ssh_logs(deployment_id, filter).await
    }
}
