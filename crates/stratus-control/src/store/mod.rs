//! Registry storage backends.
//!
//! This module provides the trait and implementations for persisting
//! clusters, nodes, deployments and their execution history. The primary
//! implementation uses PostgreSQL; an in-memory implementation backs tests
//! and runs when no database is reachable.
//!
//! History (deployments, steps, install steps, SSH logs) is append-only:
//! records are inserted and updated in place, never deleted.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ControlResult;
use crate::ssh::{ExecutionLogSink, SshExecutionLog};
use crate::types::{
    Cluster, ClusterId, ClusterStatus, DeploymentAction, DeploymentId, DeploymentRecord,
    DeploymentStatus, InstallStep, InstallTask, Node, NodeId, NodeStatus, Step, TaskId,
};

/// Filter criteria for listing deployments.
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    /// Filter by cluster.
    pub cluster_id: Option<ClusterId>,
    /// Filter by status.
    pub status: Option<DeploymentStatus>,
    /// Filter by action.
    pub action: Option<DeploymentAction>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

impl DeploymentFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cluster_id: None,
            status: None,
            action: None,
            limit: None,
            offset: None,
        }
    }

    /// Filter by cluster.
    #[must_use]
    pub fn with_cluster(mut self, cluster_id: ClusterId) -> Self {
        self.cluster_id = Some(cluster_id);
        self
    }

    /// Filter by status.
    #[must_use]
    pub const fn with_status(mut self, status: DeploymentStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filter by action.
    #[must_use]
    pub const fn with_action(mut self, action: DeploymentAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Set maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set pagination offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    fn matches(&self, record: &DeploymentRecord) -> bool {
        self.cluster_id
            .as_ref()
            .map_or(true, |c| &record.data.cluster_id == c)
            && self.status.map_or(true, |s| record.status == s)
            && self.action.map_or(true, |a| record.data.action == a)
    }
}

/// Filter criteria for SSH execution logs of one deployment.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    /// Only logs for this node.
    pub node_id: Option<NodeId>,
    /// Only logs for this task.
    pub task_id: Option<TaskId>,
}

/// Backend for the cluster registry.
///
/// Implementations must make [`create_cluster`](Self::create_cluster) and
/// [`create_deployment`](Self::create_deployment) atomic, and must reject a
/// second non-terminal deployment for the same cluster.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    // -- clusters and nodes ---------------------------------------------------

    /// Insert a cluster and its initial nodes in one write.
    ///
    /// Returns a validation error if the cluster name is taken.
    async fn create_cluster(&self, cluster: &Cluster, nodes: &[Node]) -> ControlResult<()>;

    /// Get a cluster by ID.
    async fn get_cluster(&self, id: &ClusterId) -> ControlResult<Option<Cluster>>;

    /// List clusters, newest first.
    async fn list_clusters(&self) -> ControlResult<Vec<Cluster>>;

    /// Update a cluster's status.
    async fn update_cluster_status(&self, id: &ClusterId, status: ClusterStatus)
        -> ControlResult<()>;

    /// Add nodes to an existing cluster.
    async fn insert_nodes(&self, nodes: &[Node]) -> ControlResult<()>;

    /// Get a node by ID.
    async fn get_node(&self, id: &NodeId) -> ControlResult<Option<Node>>;

    /// List the nodes of a cluster, ordered by name.
    async fn list_nodes(&self, cluster_id: &ClusterId) -> ControlResult<Vec<Node>>;

    /// Update a node's status.
    async fn update_node_status(&self, id: &NodeId, status: NodeStatus) -> ControlResult<()>;

    // -- deployments ----------------------------------------------------------

    /// Insert a deployment together with one task per target node.
    ///
    /// Fails with [`ControlError::DeploymentInProgress`](crate::error::ControlError::DeploymentInProgress)
    /// if the cluster already has a pending or running deployment.
    async fn create_deployment(
        &self,
        record: &DeploymentRecord,
        tasks: &[InstallTask],
    ) -> ControlResult<()>;

    /// Get a deployment by ID.
    async fn get_deployment(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>>;

    /// Replace a deployment's mutable fields.
    async fn update_deployment(&self, record: &DeploymentRecord) -> ControlResult<()>;

    /// List deployments matching the filter, newest first.
    async fn list_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> ControlResult<Vec<DeploymentRecord>>;

    /// The pending or running deployment of a cluster, if any.
    async fn active_deployment(
        &self,
        cluster_id: &ClusterId,
    ) -> ControlResult<Option<DeploymentRecord>>;

    // -- tasks and steps ------------------------------------------------------

    /// List the tasks of a deployment, ordered by node name.
    async fn list_tasks(&self, deployment_id: &DeploymentId) -> ControlResult<Vec<InstallTask>>;

    /// Replace a task's mutable fields.
    async fn update_task(&self, task: &InstallTask) -> ControlResult<()>;

    /// Insert or update a deployment-level step.
    async fn upsert_step(&self, step: &Step) -> ControlResult<()>;

    /// List the deployment-level steps of a deployment, in phase order.
    async fn list_steps(&self, deployment_id: &DeploymentId) -> ControlResult<Vec<Step>>;

    /// Insert or update an install step.
    async fn upsert_install_step(&self, step: &InstallStep) -> ControlResult<()>;

    /// List the install steps of every task in a deployment, ordered by task
    /// then sequence.
    async fn list_install_steps(
        &self,
        deployment_id: &DeploymentId,
    ) -> ControlResult<Vec<InstallStep>>;

    // -- ssh audit ------------------------------------------------------------

    /// Append an SSH execution log.
    async fn insert_ssh_log(&self, log: &SshExecutionLog) -> ControlResult<()>;

    /// List the SSH logs recorded for a deployment's tasks, oldest first.
    async fn list_ssh_logs(
        &self,
        deployment_id: &DeploymentId,
        filter: &LogFilter,
    ) -> ControlResult<Vec<SshExecutionLog>>;
}

/// Adapts a [`ClusterStore`] into the SSH executor's log sink.
#[derive(Clone)]
pub struct StoreLogSink(pub Arc<dyn ClusterStore>);

#[async_trait]
impl ExecutionLogSink for StoreLogSink {
    async fn record(&self, log: SshExecutionLog) -> ControlResult<()> {
        self.0.insert_ssh_log(&log).await
    }
}
