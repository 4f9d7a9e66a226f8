//! Process-wide registry of live deployments.
//!
//! Each tracked deployment owns a `watch` channel carrying its latest
//! [`DeploymentSnapshot`] and a [`CancellationToken`] its pipelines observe.
//! The tracker also holds one claim per cluster so two deployments can never
//! run against the same cluster from this process. Finished entries are kept
//! for a retention period so late subscribers still see the final state,
//! then pruned.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ControlError, ControlResult};
use crate::types::{
    ClusterId, DeploymentAction, DeploymentId, DeploymentRecord, DeploymentResult,
    DeploymentStatus, InstallStepKind, InstallTask, NodeId, StepKind, TaskId, TaskStatus,
};

/// Per-node view inside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Install task.
    pub task_id: TaskId,
    /// Node.
    pub node_id: NodeId,
    /// Node name.
    pub node_name: String,
    /// Task status.
    pub status: TaskStatus,
    /// Task progress, 0-100.
    pub progress: u8,
    /// Step running or where the task stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<InstallStepKind>,
    /// Error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Point-in-time view of a deployment, as streamed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSnapshot {
    /// Deployment.
    pub deployment_id: DeploymentId,
    /// Target cluster.
    pub cluster_id: ClusterId,
    /// Requested action.
    pub action: DeploymentAction,
    /// Status.
    pub status: DeploymentStatus,
    /// Progress, 0-100.
    pub progress: u8,
    /// Deployment-level phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<StepKind>,
    /// Error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Aggregate result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<DeploymentResult>,
    /// Per-node state.
    pub tasks: Vec<TaskSnapshot>,
    /// When the deployment last changed.
    pub updated_at: DateTime<Utc>,
}

impl DeploymentSnapshot {
    /// Build a snapshot from committed rows.
    #[must_use]
    pub fn new(record: &DeploymentRecord, tasks: &[InstallTask]) -> Self {
        let data = &record.data;
        Self {
            deployment_id: data.id.clone(),
            cluster_id: data.cluster_id.clone(),
            action: data.action,
            status: record.status,
            progress: data.progress,
            current_step: data.current_step,
            error: data.error.clone(),
            result: data.result.clone(),
            tasks: tasks
                .iter()
                .map(|t| TaskSnapshot {
                    task_id: t.id.clone(),
                    node_id: t.node_id.clone(),
                    node_name: t.node_name.clone(),
                    status: t.status,
                    progress: t.progress,
                    current_step: t.current_step,
                    error: t.error.clone(),
                })
                .collect(),
            updated_at: data.updated_at,
        }
    }

    /// Whether the deployment reached a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

struct TrackedDeployment {
    cluster_id: ClusterId,
    sender: watch::Sender<DeploymentSnapshot>,
    cancel: CancellationToken,
    finished_at: Option<Instant>,
}

/// In-memory index of deployments this process is running.
pub struct DeploymentTracker {
    deployments: DashMap<DeploymentId, TrackedDeployment>,
    clusters: DashMap<ClusterId, DeploymentId>,
    retention: Duration,
}

impl DeploymentTracker {
    /// Create a tracker that keeps finished deployments for `retention`.
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            deployments: DashMap::new(),
            clusters: DashMap::new(),
            retention,
        }
    }

    /// Claim a cluster for a deployment.
    ///
    /// Fails if another deployment already holds the claim.
    pub fn claim_cluster(
        &self,
        cluster_id: &ClusterId,
        deployment_id: &DeploymentId,
    ) -> ControlResult<()> {
        match self.clusters.entry(cluster_id.clone()) {
            Entry::Occupied(existing) => Err(ControlError::DeploymentInProgress {
                cluster: cluster_id.to_string(),
                deployment: existing.get().to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(deployment_id.clone());
                Ok(())
            }
        }
    }

    /// Release a cluster claim held by `deployment_id`.
    pub fn release_cluster(&self, cluster_id: &ClusterId, deployment_id: &DeploymentId) {
        self.clusters
            .remove_if(cluster_id, |_, holder| holder == deployment_id);
    }

    /// The deployment holding a cluster's claim.
    #[must_use]
    pub fn cluster_claim(&self, cluster_id: &ClusterId) -> Option<DeploymentId> {
        self.clusters.get(cluster_id).map(|d| d.value().clone())
    }

    /// Start tracking a deployment. Returns the token its pipelines observe.
    pub fn register(&self, snapshot: DeploymentSnapshot) -> CancellationToken {
        let cancel = CancellationToken::new();
        let id = snapshot.deployment_id.clone();
        let cluster_id = snapshot.cluster_id.clone();
        let (sender, _) = watch::channel(snapshot);
        self.deployments.insert(
            id.clone(),
            TrackedDeployment {
                cluster_id,
                sender,
                cancel: cancel.clone(),
                finished_at: None,
            },
        );
        debug!(deployment_id = %id, "deployment tracked");
        cancel
    }

    /// Publish a new snapshot to every subscriber.
    ///
    /// A terminal snapshot starts the retention clock and releases the
    /// cluster claim.
    pub fn publish(&self, snapshot: DeploymentSnapshot) {
        let Some(mut entry) = self.deployments.get_mut(&snapshot.deployment_id) else {
            return;
        };
        let terminal = snapshot.is_terminal();
        let id = snapshot.deployment_id.clone();
        entry.sender.send_replace(snapshot);

        if terminal && entry.finished_at.is_none() {
            entry.finished_at = Some(Instant::now());
            let cluster_id = entry.cluster_id.clone();
            drop(entry);
            self.release_cluster(&cluster_id, &id);
        }
    }

    /// Subscribe to a deployment's snapshots.
    #[must_use]
    pub fn subscribe(&self, id: &DeploymentId) -> Option<watch::Receiver<DeploymentSnapshot>> {
        self.deployments.get(id).map(|e| e.sender.subscribe())
    }

    /// Latest snapshot of a tracked deployment.
    #[must_use]
    pub fn snapshot(&self, id: &DeploymentId) -> Option<DeploymentSnapshot> {
        self.deployments.get(id).map(|e| e.sender.borrow().clone())
    }

    /// Cancellation token of a running deployment.
    #[must_use]
    pub fn cancel_token(&self, id: &DeploymentId) -> Option<CancellationToken> {
        self.deployments
            .get(id)
            .filter(|e| e.finished_at.is_none())
            .map(|e| e.cancel.clone())
    }

    /// Number of deployments not yet finished.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.deployments
            .iter()
            .filter(|e| e.finished_at.is_none())
            .count()
    }

    /// Drop finished deployments older than the retention period.
    pub fn prune(&self) -> usize {
        let before = self.deployments.len();
        let retention = self.retention;
        self.deployments
            .retain(|_, e| e.finished_at.map_or(true, |at| at.elapsed() < retention));
        let pruned = before.saturating_sub(self.deployments.len());
        if pruned > 0 {
            debug!(pruned, "pruned finished deployments");
        }
        pruned
    }

    /// Prune periodically until `shutdown` fires.
    pub async fn run_pruner(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.prune();
                }
                () = shutdown.cancelled() => {
                    info!("tracker pruner stopped");
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for DeploymentTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentTracker")
            .field("deployments", &self.deployments.len())
            .field("clusters", &self.clusters.len())
            .field("retention", &self.retention)
            .finish()
    }
}
