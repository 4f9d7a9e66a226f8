//! Scale gate and scale operations.
//!
//! Scaling is all-or-nothing: every requested node must have a registered,
//! online agent before any node or task is written.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::deployment::{select_targets, DeploymentManager};
use crate::error::{ControlError, ControlResult, NodeFailure};
use crate::salt::ConfigManagement;
use crate::ssh::NodeCredentials;
use crate::types::{
    ClusterId, DeploymentAction, DeploymentId, DeploymentOptions, Node, NodeResources, NodeRole,
    NodeSpec,
};

/// Readiness of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReadiness {
    /// Node (minion) name.
    pub name: String,
    /// Agent key accepted by the master.
    pub registered: bool,
    /// Agent answered a ping.
    pub online: bool,
    /// Agent version, when online.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Registered and online.
    pub ready: bool,
    /// Why the node is not ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Readiness of a batch of nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessReport {
    /// Per-node readiness, in request order.
    pub nodes: Vec<NodeReadiness>,
    /// Nodes checked.
    pub total: usize,
    /// Nodes ready.
    pub ready: usize,
    /// Nodes not ready.
    pub not_ready: usize,
}

impl ReadinessReport {
    fn new(nodes: Vec<NodeReadiness>) -> Self {
        let ready = nodes.iter().filter(|n| n.ready).count();
        Self {
            total: nodes.len(),
            not_ready: nodes.len() - ready,
            ready,
            nodes,
        }
    }

    /// Whether every node is ready.
    #[must_use]
    pub const fn all_ready(&self) -> bool {
        self.not_ready == 0
    }

    /// Failing nodes with their reasons.
    #[must_use]
    pub fn failures(&self) -> Vec<NodeFailure> {
        self.nodes
            .iter()
            .filter(|n| !n.ready)
            .map(|n| NodeFailure {
                node: n.name.clone(),
                reason: n.reason.clone().unwrap_or_else(|| "not ready".to_owned()),
            })
            .collect()
    }
}

/// Body of a readiness check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessRequest {
    /// Nodes to check.
    pub node_names: Vec<String>,
}

/// Scale direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    /// Add nodes.
    Up,
    /// Remove nodes.
    Down,
}

impl ScaleDirection {
    const fn action(self) -> DeploymentAction {
        match self {
            Self::Up => DeploymentAction::ScaleUp,
            Self::Down => DeploymentAction::ScaleDown,
        }
    }
}

/// Request to scale a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleRequest {
    /// Add or remove.
    pub direction: ScaleDirection,
    /// Nodes to add or remove.
    pub node_names: Vec<String>,
    /// Role of nodes created by a scale-up.
    #[serde(default)]
    pub role: Option<NodeRole>,
    /// Host per new node. Defaults to the node name.
    #[serde(default)]
    pub hosts: BTreeMap<String, String>,
    /// SSH port of new nodes.
    #[serde(default)]
    pub port: Option<u16>,
    /// Credentials of new nodes.
    #[serde(default)]
    pub credentials: Option<NodeCredentials>,
    /// Deployment overrides. `node_names` is taken from the request.
    #[serde(default)]
    pub options: DeploymentOptions,
}

/// Runs readiness checks and gated scale operations.
pub struct ScaleGate {
    manager: Arc<DeploymentManager>,
    salt: Arc<dyn ConfigManagement>,
}

impl ScaleGate {
    /// Create a gate.
    pub fn new(manager: Arc<DeploymentManager>, salt: Arc<dyn ConfigManagement>) -> Self {
        Self { manager, salt }
    }

    /// Check agent readiness of `names`. Nodes need not exist in the
    /// cluster yet.
    pub async fn check_readiness(
        &self,
        cluster_id: &ClusterId,
        names: &[String],
    ) -> ControlResult<ReadinessReport> {
        self.manager.get_cluster(cluster_id).await?;
        if names.is_empty() {
            return Err(ControlError::validation("at least one node name is required"));
        }

        let checks = names.iter().map(|name| async move {
            let readiness = self.salt.readiness(name).await;
            NodeReadiness {
                name: name.clone(),
                registered: readiness.registered,
                online: readiness.online,
                ready: readiness.is_ready(),
                version: readiness.version,
                reason: readiness.reason,
            }
        });
        Ok(ReadinessReport::new(join_all(checks).await))
    }

    /// Scale a cluster. Nothing is written unless every node is ready.
    pub async fn scale(
        &self,
        cluster_id: &ClusterId,
        request: ScaleRequest,
    ) -> ControlResult<DeploymentId> {
        let names = request.node_names.clone();
        let unique: HashSet<&String> = names.iter().collect();
        if unique.len() != names.len() {
            return Err(ControlError::validation("duplicate node names"));
        }

        let detail = self.manager.get_cluster(cluster_id).await?;
        let action = request.direction.action();
        let mut options = request.options.clone();
        options.node_names = names.clone();

        // Role and name checks that do not depend on agents run first.
        let new_names: Vec<&String> = names
            .iter()
            .filter(|name| !detail.nodes.iter().any(|n| &n.name == *name))
            .collect();
        match request.direction {
            ScaleDirection::Down => {
                select_targets(&detail.nodes, action, &options)?;
            }
            ScaleDirection::Up => {
                if new_names.len() < names.len() {
                    let existing: Vec<_> = detail
                        .nodes
                        .iter()
                        .filter(|n| names.contains(&n.name))
                        .cloned()
                        .collect();
                    let existing_options = DeploymentOptions {
                        node_names: existing.iter().map(|n| n.name.clone()).collect(),
                        ..options.clone()
                    };
                    select_targets(&existing, action, &existing_options)?;
                }
            }
        }

        // Held across the readiness check so no other deployment can start
        // between the check and the node writes.
        let reservation = self.manager.reserve(cluster_id).await?;
        let targets = match self
            .prepare(cluster_id, &request, &new_names, action, &options)
            .await
        {
            Ok(targets) => targets,
            Err(e) => {
                self.manager.release(reservation);
                return Err(e);
            }
        };
        self.manager
            .launch(reservation, detail.cluster, targets, action, options)
            .await
    }

    /// Gate on readiness, then add the new nodes and resolve targets.
    async fn prepare(
        &self,
        cluster_id: &ClusterId,
        request: &ScaleRequest,
        new_names: &[&String],
        action: DeploymentAction,
        options: &DeploymentOptions,
    ) -> ControlResult<Vec<Node>> {
        let report = self.check_readiness(cluster_id, &request.node_names).await?;
        if !report.all_ready() {
            let failed = report.failures();
            warn!(
                cluster_id = %cluster_id,
                failed = failed.len(),
                "scale rejected, nodes not ready"
            );
            return Err(ControlError::NodesNotReady { failed });
        }

        let specs: Vec<NodeSpec> = new_names
            .iter()
            .map(|name| NodeSpec {
                name: (*name).clone(),
                role: request.role.unwrap_or(NodeRole::Compute),
                host: request
                    .hosts
                    .get(*name)
                    .cloned()
                    .unwrap_or_else(|| (*name).clone()),
                port: request.port.unwrap_or(22),
                credentials: request.credentials.clone().unwrap_or_default(),
                resources: NodeResources::default(),
                config: serde_json::Value::Null,
            })
            .collect();
        if !specs.is_empty() {
            let created = self.manager.add_nodes(cluster_id, specs).await?;
            info!(cluster_id = %cluster_id, nodes = created.len(), "nodes added for scale-up");
        }

        let nodes = self.manager.store().list_nodes(cluster_id).await?;
        select_targets(&nodes, action, options)
    }
}

impl std::fmt::Debug for ScaleGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScaleGate").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::salt::MockConfigManagement;
    use crate::ssh::MockShell;
    use crate::testing::Harness;
    use crate::types::{DeploymentStatus, NodeStatus};

    fn scale_up(names: &[&str]) -> ScaleRequest {
        ScaleRequest {
            direction: ScaleDirection::Up,
            node_names: names.iter().map(|n| (*n).to_owned()).collect(),
            role: None,
            hosts: BTreeMap::new(),
            port: None,
            credentials: None,
            options: DeploymentOptions::default(),
        }
    }

    fn registered(names: &[&str]) -> MockConfigManagement {
        let salt = MockConfigManagement::new();
        for name in names {
            salt.register(name);
        }
        salt
    }

    #[tokio::test]
    async fn readiness_reports_each_node() {
        let salt = registered(&["m1", "c1", "c2"]);
        salt.register_offline("c4");
        let h = Harness::new(MockShell::new(), salt);
        let cluster_id = h.hpc1().await;

        let names: Vec<String> = ["c1", "c3", "c4"].iter().map(|n| (*n).to_owned()).collect();
        let report = h.gate.check_readiness(&cluster_id, &names).await.unwrap();
        assert_eq!((report.total, report.ready, report.not_ready), (3, 1, 2));

        let by_name = |n: &str| report.nodes.iter().find(|r| r.name == n).unwrap();
        let c1 = by_name("c1");
        assert!(c1.registered && c1.online && c1.ready);
        assert!(c1.version.is_some());

        let c3 = by_name("c3");
        assert!(!c3.registered && !c3.ready);
        assert_eq!(c3.reason.as_deref(), Some("not registered"));

        let c4 = by_name("c4");
        assert!(c4.registered && !c4.online && !c4.ready);
    }

    #[tokio::test]
    async fn unregistered_node_blocks_the_whole_batch() {
        let salt = registered(&["m1", "c1", "c2", "c4"]);
        let h = Harness::new(MockShell::new(), salt);
        let cluster_id = h.hpc1().await;

        let err = h
            .gate
            .scale(&cluster_id, scale_up(&["c3", "c4"]))
            .await
            .unwrap_err();
        match err {
            ControlError::NodesNotReady { failed } => {
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].node, "c3");
                assert_eq!(failed[0].reason, "not registered");
            }
            other => panic!("unexpected {other:?}"),
        }

        let nodes = h.manager.store().list_nodes(&cluster_id).await.unwrap();
        assert_eq!(nodes.len(), 3);
        let deployments = h
            .manager
            .list_deployments(&Default::default())
            .await
            .unwrap();
        assert!(deployments.is_empty());
    }

    #[tokio::test]
    async fn scale_up_creates_nodes_after_gate() {
        let salt = registered(&["m1", "c1", "c2", "c3"]);
        let h = Harness::new(MockShell::new(), salt);
        let cluster_id = h.hpc1().await;

        let mut request = scale_up(&["c3"]);
        request
            .hosts
            .insert("c3".to_owned(), "10.0.0.4".to_owned());
        let id = h.gate.scale(&cluster_id, request).await.unwrap();
        let snapshot = h.wait_terminal(&id).await;
        assert_eq!(snapshot.status, DeploymentStatus::Completed);
        assert_eq!(snapshot.tasks.len(), 1);

        let nodes = h.manager.store().list_nodes(&cluster_id).await.unwrap();
        let c3 = nodes.iter().find(|n| n.name == "c3").unwrap();
        assert_eq!(c3.host, "10.0.0.4");
        assert_eq!(c3.role, NodeRole::Compute);
        assert_eq!(c3.status, NodeStatus::Active);

        let cluster = h.manager.get_cluster(&cluster_id).await.unwrap();
        assert_eq!(cluster.cluster.status, crate::types::ClusterStatus::Running);
    }

    #[tokio::test]
    async fn scale_down_decommissions_node() {
        let h = Harness::permissive();
        let cluster_id = h.hpc1().await;

        let request = ScaleRequest {
            direction: ScaleDirection::Down,
            ..scale_up(&["c2"])
        };
        let id = h.gate.scale(&cluster_id, request).await.unwrap();
        let snapshot = h.wait_terminal(&id).await;
        assert_eq!(snapshot.status, DeploymentStatus::Completed);

        let nodes = h.manager.store().list_nodes(&cluster_id).await.unwrap();
        let c2 = nodes.iter().find(|n| n.name == "c2").unwrap();
        assert_eq!(c2.status, NodeStatus::Removing);
        assert!(h.salt.calls().iter().any(|c| c == "decommission c2"));

        // c1 is now the last compute node.
        let request = ScaleRequest {
            direction: ScaleDirection::Down,
            ..scale_up(&["c1"])
        };
        let err = h.gate.scale(&cluster_id, request).await.unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
    }

    #[tokio::test]
    async fn held_cluster_rejects_scale_before_adding_nodes() {
        let salt = registered(&["m1", "c1", "c2", "c3"]);
        let h = Harness::new(MockShell::new(), salt);
        let cluster_id = h.hpc1().await;

        let reservation = h.manager.reserve(&cluster_id).await.unwrap();
        let err = h
            .gate
            .scale(&cluster_id, scale_up(&["c3"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::DeploymentInProgress { .. }));
        let nodes = h.manager.store().list_nodes(&cluster_id).await.unwrap();
        assert_eq!(nodes.len(), 3);
        assert!(h.salt.calls().is_empty());

        h.manager.release(reservation);
        let mut request = scale_up(&["c3"]);
        request
            .hosts
            .insert("c3".to_owned(), "10.0.0.4".to_owned());
        let id = h.gate.scale(&cluster_id, request).await.unwrap();
        let snapshot = h.wait_terminal(&id).await;
        assert_eq!(snapshot.status, DeploymentStatus::Completed);
        let nodes = h.manager.store().list_nodes(&cluster_id).await.unwrap();
        assert_eq!(nodes.len(), 4);
    }

    #[tokio::test]
    async fn duplicate_names_rejected() {
        let h = Harness::permissive();
        let cluster_id = h.hpc1().await;
        let err = h
            .gate
            .scale(&cluster_id, scale_up(&["c3", "c3"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
    }
}
