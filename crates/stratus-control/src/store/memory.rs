//! In-memory registry store.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{ControlError, ControlResult};
use crate::ssh::SshExecutionLog;
use crate::types::{
    Cluster, ClusterId, ClusterStatus, DeploymentId, DeploymentRecord, InstallStep, InstallTask,
    Node, NodeId, NodeStatus, Step,
};

use super::{ClusterStore, DeploymentFilter, LogFilter};

#[derive(Debug, Default)]
struct Tables {
    clusters: HashMap<String, Cluster>,
    nodes: HashMap<String, Node>,
    deployments: HashMap<String, DeploymentRecord>,
    tasks: HashMap<String, InstallTask>,
    steps: HashMap<String, Step>,
    install_steps: HashMap<String, InstallStep>,
    ssh_logs: Vec<SshExecutionLog>,
}

/// In-memory registry store.
///
/// Data is lost when the process exits. All tables share one lock so that
/// multi-record writes are atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> ControlResult<T> {
        let tables = self
            .tables
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        Ok(f(&tables))
    }

    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> ControlResult<T>) -> ControlResult<T> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        f(&mut tables)
    }
}

fn paginate<T>(items: Vec<T>, offset: Option<u32>, limit: Option<u32>) -> Vec<T> {
    let offset = offset.and_then(|o| usize::try_from(o).ok()).unwrap_or(0);
    let limit = limit
        .and_then(|l| usize::try_from(l).ok())
        .unwrap_or(usize::MAX);
    items.into_iter().skip(offset).take(limit).collect()
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn create_cluster(&self, cluster: &Cluster, nodes: &[Node]) -> ControlResult<()> {
        self.write(|t| {
            if t.clusters.values().any(|c| c.name == cluster.name) {
                return Err(ControlError::validation(format!(
                    "cluster name {} already exists",
                    cluster.name
                )));
            }
            t.clusters
                .insert(cluster.id.as_str().to_owned(), cluster.clone());
            for node in nodes {
                t.nodes.insert(node.id.as_str().to_owned(), node.clone());
            }
            Ok(())
        })
    }

    async fn get_cluster(&self, id: &ClusterId) -> ControlResult<Option<Cluster>> {
        self.read(|t| t.clusters.get(id.as_str()).cloned())
    }

    async fn list_clusters(&self) -> ControlResult<Vec<Cluster>> {
        self.read(|t| {
            let mut clusters: Vec<_> = t.clusters.values().cloned().collect();
            clusters.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            clusters
        })
    }

    async fn update_cluster_status(
        &self,
        id: &ClusterId,
        status: ClusterStatus,
    ) -> ControlResult<()> {
        self.write(|t| {
            let cluster = t
                .clusters
                .get_mut(id.as_str())
                .ok_or_else(|| ControlError::ClusterNotFound(id.to_string()))?;
            cluster.status = status;
            cluster.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn insert_nodes(&self, nodes: &[Node]) -> ControlResult<()> {
        self.write(|t| {
            for node in nodes {
                let clash = t
                    .nodes
                    .values()
                    .any(|n| n.cluster_id == node.cluster_id && n.name == node.name);
                if clash {
                    return Err(ControlError::validation(format!(
                        "node {} already exists in cluster {}",
                        node.name, node.cluster_id
                    )));
                }
            }
            for node in nodes {
                t.nodes.insert(node.id.as_str().to_owned(), node.clone());
            }
            Ok(())
        })
    }

    async fn get_node(&self, id: &NodeId) -> ControlResult<Option<Node>> {
        self.read(|t| t.nodes.get(id.as_str()).cloned())
    }

    async fn list_nodes(&self, cluster_id: &ClusterId) -> ControlResult<Vec<Node>> {
        self.read(|t| {
            let mut nodes: Vec<_> = t
                .nodes
                .values()
                .filter(|n| &n.cluster_id == cluster_id)
                .cloned()
                .collect();
            nodes.sort_by(|a, b| a.name.cmp(&b.name));
            nodes
        })
    }

    async fn update_node_status(&self, id: &NodeId, status: NodeStatus) -> ControlResult<()> {
        self.write(|t| {
            let node = t
                .nodes
                .get_mut(id.as_str())
                .ok_or_else(|| ControlError::NodeNotFound(id.to_string()))?;
            node.status = status;
            node.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn create_deployment(
        &self,
        record: &DeploymentRecord,
        tasks: &[InstallTask],
    ) -> ControlResult<()> {
        self.write(|t| {
            let key = record.data.id.as_str().to_owned();
            if t.deployments.contains_key(&key) {
                return Err(ControlError::internal(format!(
                    "deployment {key} already exists"
                )));
            }
            if let Some(active) = t.deployments.values().find(|d| {
                d.data.cluster_id == record.data.cluster_id && !d.status.is_terminal()
            }) {
                return Err(ControlError::DeploymentInProgress {
                    cluster: record.data.cluster_id.to_string(),
                    deployment: active.data.id.to_string(),
                });
            }

            t.deployments.insert(key, record.clone());
            for task in tasks {
                t.tasks.insert(task.id.as_str().to_owned(), task.clone());
            }
            Ok(())
        })
    }

    async fn get_deployment(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        self.read(|t| t.deployments.get(id.as_str()).cloned())
    }

    async fn update_deployment(&self, record: &DeploymentRecord) -> ControlResult<()> {
        self.write(|t| {
            let existing = t
                .deployments
                .get_mut(record.data.id.as_str())
                .ok_or_else(|| ControlError::DeploymentNotFound(record.data.id.to_string()))?;
            *existing = record.clone();
            Ok(())
        })
    }

    async fn list_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> ControlResult<Vec<DeploymentRecord>> {
        self.read(|t| {
            let mut results: Vec<_> = t
                .deployments
                .values()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect();
            results.sort_by(|a, b| b.data.created_at.cmp(&a.data.created_at));
            paginate(results, filter.offset, filter.limit)
        })
    }

    async fn active_deployment(
        &self,
        cluster_id: &ClusterId,
    ) -> ControlResult<Option<DeploymentRecord>> {
        self.read(|t| {
            t.deployments
                .values()
                .find(|d| &d.data.cluster_id == cluster_id && !d.status.is_terminal())
                .cloned()
        })
    }

    async fn list_tasks(&self, deployment_id: &DeploymentId) -> ControlResult<Vec<InstallTask>> {
        self.read(|t| {
            let mut tasks: Vec<_> = t
                .tasks
                .values()
                .filter(|task| &task.deployment_id == deployment_id)
                .cloned()
                .collect();
            tasks.sort_by(|a, b| a.node_name.cmp(&b.node_name));
            tasks
        })
    }

    async fn update_task(&self, task: &InstallTask) -> ControlResult<()> {
        self.write(|t| {
            let existing = t
                .tasks
                .get_mut(task.id.as_str())
                .ok_or_else(|| ControlError::internal(format!("task {} not found", task.id)))?;
            *existing = task.clone();
            Ok(())
        })
    }

    async fn upsert_step(&self, step: &Step) -> ControlResult<()> {
        self.write(|t| {
            t.steps.insert(step.id.as_str().to_owned(), step.clone());
            Ok(())
        })
    }

    async fn list_steps(&self, deployment_id: &DeploymentId) -> ControlResult<Vec<Step>> {
        self.read(|t| {
            let mut steps: Vec<_> = t
                .steps
                .values()
                .filter(|s| &s.deployment_id == deployment_id)
                .cloned()
                .collect();
            steps.sort_by_key(|s| s.kind);
            steps
        })
    }

    async fn upsert_install_step(&self, step: &InstallStep) -> ControlResult<()> {
        self.write(|t| {
            t.install_steps
                .insert(step.id.as_str().to_owned(), step.clone());
            Ok(())
        })
    }

    async fn list_install_steps(
        &self,
        deployment_id: &DeploymentId,
    ) -> ControlResult<Vec<InstallStep>> {
        self.read(|t| {
            let mut steps: Vec<_> = t
                .install_steps
                .values()
                .filter(|s| {
                    t.tasks
                        .get(s.task_id.as_str())
                        .is_some_and(|task| &task.deployment_id == deployment_id)
                })
                .cloned()
                .collect();
            steps.sort_by(|a, b| {
                a.task_id
                    .cmp(&b.task_id)
                    .then_with(|| a.sequence.cmp(&b.sequence))
            });
            steps
        })
    }

    async fn insert_ssh_log(&self, log: &SshExecutionLog) -> ControlResult<()> {
        self.write(|t| {
            t.ssh_logs.push(log.clone());
            Ok(())
        })
    }

    async fn list_ssh_logs(
        &self,
        deployment_id: &DeploymentId,
        filter: &LogFilter,
    ) -> ControlResult<Vec<SshExecutionLog>> {
        self.read(|t| {
            t.ssh_logs
                .iter()
                .filter(|log| {
                    log.task_id
                        .as_ref()
                        .and_then(|id| t.tasks.get(id.as_str()))
                        .is_some_and(|task| &task.deployment_id == deployment_id)
                })
                .filter(|log| {
                    filter
                        .node_id
                        .as_ref()
                        .map_or(true, |n| log.node_id.as_ref() == Some(n))
                })
                .filter(|log| {
                    filter
                        .task_id
                        .as_ref()
                        .map_or(true, |id| log.task_id.as_ref() == Some(id))
                })
                .cloned()
                .collect()
        })
    }
}
