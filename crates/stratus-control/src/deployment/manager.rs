//! Request validation and deployment lifecycle operations.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::coordinator::Coordinator;
use crate::config::DeploymentConfig;
use crate::error::{ControlError, ControlResult};
use crate::pipeline::{InstallJob, NodeInstaller, Plan};
use crate::ssh::SshExecutionLog;
use crate::state::{AnyDeployment, Deployment, Pending};
use crate::store::{ClusterStore, DeploymentFilter, LogFilter};
use crate::tracker::{DeploymentSnapshot, DeploymentTracker};
use crate::types::{
    Cluster, ClusterConfig, ClusterId, ClusterStatus, DeploymentAction, DeploymentData,
    DeploymentId, DeploymentOptions, DeploymentRecord, DeploymentResult, InstallStep,
    InstallStepKind, InstallTask, Node, NodeId, NodeRole, NodeSpec, NodeStatus, Step, TaskStatus,
    TaskType,
};

/// How long a cancel request waits for the coordinator to settle.
const CANCEL_WAIT: Duration = Duration::from_secs(10);

/// A cluster claimed for a deployment that has not been persisted yet.
#[derive(Debug)]
#[must_use = "a reservation holds the cluster until launched or released"]
pub(crate) struct Reservation {
    cluster_id: ClusterId,
    deployment_id: DeploymentId,
}

/// Request to create a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClusterRequest {
    /// Cluster name (unique).
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Salt master address agents register with. Defaults to the
    /// configured master address.
    #[serde(default)]
    pub salt_master: Option<String>,
    /// Workload-manager configuration.
    #[serde(default)]
    pub config: ClusterConfig,
    /// Initial nodes. At least one must be a master.
    pub nodes: Vec<NodeSpec>,
}

/// Request to run an operation against a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    /// Operation to run.
    #[serde(default = "default_action")]
    pub action: DeploymentAction,
    /// Per-request overrides.
    #[serde(default, flatten)]
    pub options: DeploymentOptions,
}

const fn default_action() -> DeploymentAction {
    DeploymentAction::Deploy
}

impl DeploymentRequest {
    /// A request with default options.
    #[must_use]
    pub fn new(action: DeploymentAction) -> Self {
        Self {
            action,
            options: DeploymentOptions::default(),
        }
    }
}

/// A cluster with its nodes.
#[derive(Debug, Clone)]
pub struct ClusterDetail {
    /// The cluster.
    pub cluster: Cluster,
    /// Its nodes, ordered by name.
    pub nodes: Vec<Node>,
}

/// A deployment with its tasks and phase steps.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentDetail {
    /// The deployment.
    #[serde(flatten)]
    pub deployment: DeploymentRecord,
    /// Per-node tasks, ordered by node name.
    pub tasks: Vec<InstallTask>,
    /// Deployment-level steps, in phase order.
    pub steps: Vec<Step>,
}

/// Filters for [`DeploymentManager::logs`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogQuery {
    /// Only this node.
    #[serde(default)]
    pub node_id: Option<NodeId>,
    /// Only this install step kind.
    #[serde(default)]
    pub step_type: Option<InstallStepKind>,
}

/// Execution history of a deployment.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentLogs {
    /// Deployment-level steps.
    pub steps: Vec<Step>,
    /// Per-node install steps.
    pub install_steps: Vec<InstallStep>,
    /// Raw SSH audit rows.
    pub ssh_logs: Vec<SshExecutionLog>,
}

/// Orchestrates clusters and their deployments.
pub struct DeploymentManager {
    store: Arc<dyn ClusterStore>,
    installer: Arc<NodeInstaller>,
    tracker: Arc<DeploymentTracker>,
    config: DeploymentConfig,
    default_salt_master: String,
}

impl DeploymentManager {
    /// Create a new deployment manager.
    pub fn new(
        store: Arc<dyn ClusterStore>,
        installer: Arc<NodeInstaller>,
        tracker: Arc<DeploymentTracker>,
        config: DeploymentConfig,
        default_salt_master: impl Into<String>,
    ) -> Self {
        Self {
            store,
            installer,
            tracker,
            config,
            default_salt_master: default_salt_master.into(),
        }
    }

    /// The registry store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ClusterStore> {
        &self.store
    }

    /// The live deployment tracker.
    #[must_use]
    pub fn tracker(&self) -> &Arc<DeploymentTracker> {
        &self.tracker
    }

    // -- clusters -------------------------------------------------------------

    /// Create a cluster and its initial nodes.
    pub async fn create_cluster(&self, request: CreateClusterRequest) -> ControlResult<ClusterDetail> {
        if request.name.trim().is_empty() {
            return Err(ControlError::validation("cluster name must not be empty"));
        }
        validate_node_specs(&request.nodes, &[])?;

        let master = request
            .nodes
            .iter()
            .find(|n| n.role == NodeRole::Master)
            .ok_or_else(|| ControlError::validation("cluster needs at least one master node"))?;

        let now = Utc::now();
        let cluster = Cluster {
            id: ClusterId::generate(),
            name: request.name,
            description: request.description,
            status: ClusterStatus::Pending,
            master_host: master.host.clone(),
            master_port: master.port,
            salt_master: request
                .salt_master
                .unwrap_or_else(|| self.default_salt_master.clone()),
            config: request.config,
            created_at: now,
            updated_at: now,
        };

        let mut nodes: Vec<Node> = request
            .nodes
            .into_iter()
            .map(|spec| spec.into_node(&cluster.id))
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));

        self.store.create_cluster(&cluster, &nodes).await?;
        info!(cluster_id = %cluster.id, name = %cluster.name, nodes = nodes.len(), "cluster created");

        Ok(ClusterDetail { cluster, nodes })
    }

    /// List clusters, newest first.
    pub async fn list_clusters(&self) -> ControlResult<Vec<Cluster>> {
        self.store.list_clusters().await
    }

    /// Get a cluster with its nodes.
    pub async fn get_cluster(&self, id: &ClusterId) -> ControlResult<ClusterDetail> {
        let cluster = self
            .store
            .get_cluster(id)
            .await?
            .ok_or_else(|| ControlError::ClusterNotFound(id.to_string()))?;
        let nodes = self.store.list_nodes(id).await?;
        Ok(ClusterDetail { cluster, nodes })
    }

    /// Add nodes to a cluster.
    pub(crate) async fn add_nodes(
        &self,
        cluster_id: &ClusterId,
        specs: Vec<NodeSpec>,
    ) -> ControlResult<Vec<Node>> {
        let existing = self.store.list_nodes(cluster_id).await?;
        let taken: Vec<&str> = existing.iter().map(|n| n.name.as_str()).collect();
        validate_node_specs(&specs, &taken)?;

        let nodes: Vec<Node> = specs
            .into_iter()
            .map(|spec| spec.into_node(cluster_id))
            .collect();
        self.store.insert_nodes(&nodes).await?;
        Ok(nodes)
    }

    // -- deployments ----------------------------------------------------------

    /// Validate and start a deployment. Returns as soon as the deployment is
    /// persisted; pipelines run in the background.
    pub async fn deploy(
        &self,
        cluster_id: &ClusterId,
        request: DeploymentRequest,
    ) -> ControlResult<DeploymentId> {
        let detail = self.get_cluster(cluster_id).await?;
        let targets = select_targets(&detail.nodes, request.action, &request.options)?;
        validate_options(&request.options)?;
        let reservation = self.reserve(cluster_id).await?;
        self.launch(
            reservation,
            detail.cluster,
            targets,
            request.action,
            request.options,
        )
        .await
    }

    /// Claim a cluster for a deployment that is not persisted yet.
    ///
    /// Fails while another deployment holds the claim or is still open in
    /// the registry. The claim is held until [`launch`](Self::launch) hands it
    /// to a coordinator or [`release`](Self::release) drops it.
    pub(crate) async fn reserve(&self, cluster_id: &ClusterId) -> ControlResult<Reservation> {
        let reservation = Reservation {
            cluster_id: cluster_id.clone(),
            deployment_id: DeploymentId::generate(),
        };
        self.tracker
            .claim_cluster(&reservation.cluster_id, &reservation.deployment_id)?;

        let open = match self.store.active_deployment(cluster_id).await {
            Ok(None) => return Ok(reservation),
            Ok(Some(active)) => Err(ControlError::DeploymentInProgress {
                cluster: cluster_id.to_string(),
                deployment: active.data.id.to_string(),
            }),
            Err(e) => Err(e),
        };
        self.release(reservation);
        open
    }

    /// Drop a reservation that will not be launched.
    pub(crate) fn release(&self, reservation: Reservation) {
        self.tracker
            .release_cluster(&reservation.cluster_id, &reservation.deployment_id);
    }

    /// Persist a deployment for `targets` and start its coordinator. The
    /// reservation is released if the deployment does not start.
    pub(crate) async fn launch(
        &self,
        reservation: Reservation,
        cluster: Cluster,
        targets: Vec<Node>,
        action: DeploymentAction,
        options: DeploymentOptions,
    ) -> ControlResult<DeploymentId> {
        let started = self
            .start(&reservation, &cluster, &targets, action, options)
            .await;
        if started.is_err() {
            self.release(reservation);
        }
        started
    }

    async fn start(
        &self,
        reservation: &Reservation,
        cluster: &Cluster,
        targets: &[Node],
        action: DeploymentAction,
        options: DeploymentOptions,
    ) -> ControlResult<DeploymentId> {
        validate_options(&options)?;
        if targets.is_empty() {
            return Err(ControlError::validation("no nodes to deploy"));
        }
        if reservation.cluster_id != cluster.id {
            return Err(ControlError::Internal(format!(
                "reservation for cluster {} used for {}",
                reservation.cluster_id, cluster.id
            )));
        }

        let mut data = DeploymentData::new(cluster.id.clone(), action, options);
        data.id = reservation.deployment_id.clone();
        self.persist(cluster, targets, data).await
    }

    async fn persist(
        &self,
        cluster: &Cluster,
        targets: &[Node],
        data: DeploymentData,
    ) -> ControlResult<DeploymentId> {
        let action = data.action;
        let options = data.options.clone();
        let pending = Deployment::<Pending>::create(data);
        let deployment_id = pending.id().clone();

        let tasks: Vec<InstallTask> = targets
            .iter()
            .map(|node| {
                let task_type = if options.agent_only {
                    TaskType::AgentInstall
                } else {
                    node.role.task_type()
                };
                let snapshot = serde_json::json!({
                    "action": action,
                    "role": node.role,
                    "slurm_version": cluster.config.slurm_version,
                    "packages": cluster.config.required_packages(node.role),
                    "extra_packages": options.packages,
                });
                InstallTask::new(&deployment_id, node, task_type, snapshot)
            })
            .collect();

        let record = pending.to_record();
        self.store.create_deployment(&record, &tasks).await?;

        let previous_status = cluster.status;
        let running_status = if action.is_scale() {
            ClusterStatus::Scaling
        } else {
            ClusterStatus::Deploying
        };
        if let Err(e) = self
            .store
            .update_cluster_status(&cluster.id, running_status)
            .await
        {
            self.discard(pending, tasks, &e).await;
            return Err(e);
        }

        let cancel = self
            .tracker
            .register(DeploymentSnapshot::new(&record, &tasks));

        let cluster = Arc::new(cluster.clone());
        let max_retries = options
            .max_retries
            .unwrap_or(self.config.retry.max_retries);
        let jobs = targets
            .iter()
            .cloned()
            .zip(tasks)
            .map(|(node, task)| InstallJob {
                cluster: cluster.clone(),
                plan: Plan::for_task(action, task.task_type),
                node,
                task,
                max_retries,
                bootstrap_agent: options.bootstrap_agent,
                extra_packages: options.packages.clone(),
            })
            .collect();

        let coordinator = Coordinator {
            store: self.store.clone(),
            installer: self.installer.clone(),
            tracker: self.tracker.clone(),
            deployment: pending,
            cluster,
            previous_status,
            jobs,
            parallelism: options.parallelism.unwrap_or(self.config.parallelism).max(1),
            timeout_secs: options.timeout_secs.unwrap_or(self.config.timeout_secs),
            max_retries,
            cancel,
        };

        info!(
            deployment_id = %deployment_id,
            cluster_id = %coordinator.cluster.id,
            action = %action,
            nodes = targets.len(),
            "deployment accepted"
        );
        tokio::spawn(coordinator.run());

        Ok(deployment_id)
    }

    /// List deployments, newest first.
    pub async fn list_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> ControlResult<Vec<DeploymentRecord>> {
        self.store.list_deployments(filter).await
    }

    /// Get a deployment with its tasks and steps.
    pub async fn get_deployment(&self, id: &DeploymentId) -> ControlResult<DeploymentDetail> {
        let deployment = self.get_record(id).await?;
        let tasks = self.store.list_tasks(id).await?;
        let steps = self.store.list_steps(id).await?;
        Ok(DeploymentDetail {
            deployment,
            tasks,
            steps,
        })
    }

    async fn get_record(&self, id: &DeploymentId) -> ControlResult<DeploymentRecord> {
        self.store
            .get_deployment(id)
            .await?
            .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))
    }

    /// Execution history of a deployment.
    pub async fn logs(&self, id: &DeploymentId, query: &LogQuery) -> ControlResult<DeploymentLogs> {
        self.get_record(id).await?;

        let tasks = self.store.list_tasks(id).await?;
        let task_ids: HashSet<_> = tasks
            .iter()
            .filter(|t| query.node_id.as_ref().map_or(true, |n| &t.node_id == n))
            .map(|t| t.id.clone())
            .collect();

        let install_steps: Vec<InstallStep> = self
            .store
            .list_install_steps(id)
            .await?
            .into_iter()
            .filter(|s| task_ids.contains(&s.task_id))
            .filter(|s| query.step_type.map_or(true, |k| s.kind == k))
            .collect();

        let filter = LogFilter {
            node_id: query.node_id.clone(),
            task_id: None,
        };
        let mut ssh_logs = self.store.list_ssh_logs(id, &filter).await?;
        if query.step_type.is_some() {
            let step_ids: HashSet<_> = install_steps.iter().map(|s| s.id.clone()).collect();
            ssh_logs.retain(|log| log.step_id.as_ref().is_some_and(|s| step_ids.contains(s)));
        }

        let steps = self
            .store
            .list_steps(id)
            .await?
            .into_iter()
            .filter(|s| query.step_type.map_or(true, |k| s.kind == k.phase()))
            .collect();

        Ok(DeploymentLogs {
            steps,
            install_steps,
            ssh_logs,
        })
    }

    /// Close out a deployment that was written but never started, so it
    /// does not hold the cluster.
    async fn discard(
        &self,
        pending: Deployment<Pending>,
        mut tasks: Vec<InstallTask>,
        cause: &ControlError,
    ) {
        let id = pending.id().clone();
        let now = Utc::now();
        for task in &mut tasks {
            task.status = TaskStatus::Cancelled;
            task.error = Some("deployment not started".to_owned());
            task.completed_at = Some(now);
            task.updated_at = now;
            if let Err(e) = self.store.update_task(task).await {
                warn!(deployment_id = %id, task_id = %task.id, error = %e, "failed to close task");
            }
        }

        let record = pending
            .fail(format!("deployment not started: {cause}"))
            .into_record();
        match self.store.update_deployment(&record).await {
            Ok(()) => warn!(deployment_id = %id, error = %cause, "deployment discarded"),
            Err(e) => error!(
                deployment_id = %id,
                error = %e,
                "failed to discard deployment, cancel it to free the cluster"
            ),
        }
    }

    /// Cancel a pending or running deployment.
    ///
    /// Tasks that have not started are cancelled without running; in-flight
    /// pipelines stop after their current step. Waits briefly for the
    /// coordinator to record the outcome and returns the latest record.
    pub async fn cancel(&self, id: &DeploymentId) -> ControlResult<DeploymentRecord> {
        let record = self.get_record(id).await?;
        let status = record.status;

        match self.tracker.cancel_token(id) {
            Some(token) => {
                info!(deployment_id = %id, "cancelling deployment");
                let receiver = self.tracker.subscribe(id);
                token.cancel();
                if let Some(mut receiver) = receiver {
                    let settled = tokio::time::timeout(
                        CANCEL_WAIT,
                        receiver.wait_for(DeploymentSnapshot::is_terminal),
                    )
                    .await;
                    if settled.is_err() {
                        warn!(deployment_id = %id, "cancel still settling");
                    }
                }
                self.get_record(id).await
            }
            None if status.is_terminal() => Err(ControlError::InvalidStateTransition {
                from: status.as_str(),
                to: "cancelled",
            }),
            // Left over from a previous process: nothing is running it.
            None => self.cancel_orphan(record).await,
        }
    }

    async fn cancel_orphan(&self, record: DeploymentRecord) -> ControlResult<DeploymentRecord> {
        let id = record.data.id.clone();
        let mut tasks = self.store.list_tasks(&id).await?;
        let now = Utc::now();
        for task in tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
            task.status = TaskStatus::Cancelled;
            task.error = Some("cancelled".to_owned());
            task.completed_at = Some(now);
            task.updated_at = now;
            self.store.update_task(task).await?;
        }

        let cancelled = AnyDeployment::from_record(record)
            .cancel(DeploymentResult::from_tasks(&tasks))?
            .into_record();
        self.store.update_deployment(&cancelled).await?;
        warn!(deployment_id = %id, "cancelled deployment with no live coordinator");
        Ok(cancelled)
    }
}

impl std::fmt::Debug for DeploymentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn validate_node_specs(specs: &[NodeSpec], taken: &[&str]) -> ControlResult<()> {
    if specs.is_empty() {
        return Err(ControlError::validation("at least one node is required"));
    }
    let mut seen = BTreeSet::new();
    for spec in specs {
        if spec.name.trim().is_empty() {
            return Err(ControlError::validation("node name must not be empty"));
        }
        if spec.host.trim().is_empty() {
            return Err(ControlError::validation(format!(
                "node {} has no host",
                spec.name
            )));
        }
        if !seen.insert(spec.name.as_str()) || taken.contains(&spec.name.as_str()) {
            return Err(ControlError::validation(format!(
                "duplicate node name {}",
                spec.name
            )));
        }
    }
    Ok(())
}

fn validate_options(options: &DeploymentOptions) -> ControlResult<()> {
    if options.parallelism == Some(0) {
        return Err(ControlError::validation("parallelism must be at least 1"));
    }
    if options.timeout_secs == Some(0) {
        return Err(ControlError::validation("timeout must be at least 1 second"));
    }
    Ok(())
}

/// Resolve the nodes an action applies to and check role constraints.
pub(crate) fn select_targets(
    nodes: &[Node],
    action: DeploymentAction,
    options: &DeploymentOptions,
) -> ControlResult<Vec<Node>> {
    for name in &options.node_names {
        if !nodes.iter().any(|n| &n.name == name) {
            return Err(ControlError::NodeNotFound(name.clone()));
        }
    }

    let live = |n: &&Node| n.status != NodeStatus::Removing;
    let named = |n: &&Node| options.node_names.is_empty() || options.node_names.contains(&n.name);

    let targets: Vec<Node> = match action {
        DeploymentAction::Deploy | DeploymentAction::Update => {
            nodes.iter().filter(live).filter(named).cloned().collect()
        }
        DeploymentAction::Destroy => nodes.iter().filter(live).cloned().collect(),
        DeploymentAction::ScaleUp | DeploymentAction::ScaleDown => {
            if options.node_names.is_empty() {
                return Err(ControlError::validation(format!(
                    "{action} requires node names"
                )));
            }
            nodes.iter().filter(named).cloned().collect()
        }
    };

    match action {
        DeploymentAction::Deploy => {
            if !targets.iter().any(|n| n.role == NodeRole::Master) {
                return Err(ControlError::validation(
                    "deploy requires at least one master node",
                ));
            }
        }
        DeploymentAction::ScaleDown => {
            if let Some(node) = targets.iter().find(|n| n.status == NodeStatus::Removing) {
                return Err(ControlError::validation(format!(
                    "node {} is already being removed",
                    node.name
                )));
            }
            for role in [NodeRole::Master, NodeRole::Compute] {
                let remaining = nodes
                    .iter()
                    .filter(live)
                    .filter(|n| n.role == role)
                    .filter(|n| !options.node_names.contains(&n.name))
                    .count();
                let present = nodes.iter().filter(live).any(|n| n.role == role);
                if present && remaining == 0 {
                    return Err(ControlError::validation(format!(
                        "scale-down would remove the last {role} node"
                    )));
                }
            }
        }
        DeploymentAction::ScaleUp => {
            if let Some(node) = targets.iter().find(|n| n.status == NodeStatus::Removing) {
                return Err(ControlError::validation(format!(
                    "node {} has been removed",
                    node.name
                )));
            }
        }
        DeploymentAction::Update | DeploymentAction::Destroy => {}
    }

    if targets.is_empty() {
        return Err(ControlError::validation(format!(
            "no nodes for {action}"
        )));
    }
    Ok(targets)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ssh::NodeCredentials;
    use crate::testing::Harness;
    use crate::types::DeploymentStatus;

    fn node(name: &str, role: NodeRole) -> Node {
        NodeSpec {
            name: name.to_owned(),
            role,
            host: format!("{name}.hpc"),
            port: 22,
            credentials: NodeCredentials::default(),
            resources: Default::default(),
            config: serde_json::Value::Null,
        }
        .into_node(&ClusterId::new("hpc1"))
    }

    fn cluster_nodes() -> Vec<Node> {
        vec![
            node("c1", NodeRole::Compute),
            node("c2", NodeRole::Compute),
            node("m1", NodeRole::Master),
        ]
    }

    fn names(nodes: &[Node]) -> Vec<&str> {
        nodes.iter().map(|n| n.name.as_str()).collect()
    }

    fn with_names(names: &[&str]) -> DeploymentOptions {
        DeploymentOptions {
            node_names: names.iter().map(|n| (*n).to_owned()).collect(),
            ..DeploymentOptions::default()
        }
    }

    #[test]
    fn deploy_targets_every_live_node() {
        let mut nodes = cluster_nodes();
        nodes[1].status = NodeStatus::Removing;
        let targets =
            select_targets(&nodes, DeploymentAction::Deploy, &DeploymentOptions::default())
                .unwrap();
        assert_eq!(names(&targets), vec!["c1", "m1"]);
    }

    #[test]
    fn deploy_requires_master() {
        let err = select_targets(&cluster_nodes(), DeploymentAction::Deploy, &with_names(&["c1"]))
            .unwrap_err();
        assert!(err.to_string().contains("master"));
    }

    #[test]
    fn unknown_node_names_rejected() {
        let err = select_targets(&cluster_nodes(), DeploymentAction::Update, &with_names(&["x9"]))
            .unwrap_err();
        assert!(matches!(err, ControlError::NodeNotFound(name) if name == "x9"));
    }

    #[test]
    fn scale_down_keeps_last_of_each_role() {
        let nodes = cluster_nodes();
        assert!(
            select_targets(&nodes, DeploymentAction::ScaleDown, &with_names(&["c1"])).is_ok()
        );

        let err = select_targets(&nodes, DeploymentAction::ScaleDown, &with_names(&["c1", "c2"]))
            .unwrap_err();
        assert!(err.to_string().contains("last compute"));

        let err = select_targets(&nodes, DeploymentAction::ScaleDown, &with_names(&["m1"]))
            .unwrap_err();
        assert!(err.to_string().contains("last master"));
    }

    #[test]
    fn scale_requires_names() {
        assert!(select_targets(
            &cluster_nodes(),
            DeploymentAction::ScaleUp,
            &DeploymentOptions::default()
        )
        .is_err());
    }

    #[test]
    fn duplicate_specs_rejected() {
        let spec = NodeSpec {
            name: "c1".to_owned(),
            role: NodeRole::Compute,
            host: "10.0.0.2".to_owned(),
            port: 22,
            credentials: NodeCredentials::default(),
            resources: Default::default(),
            config: serde_json::Value::Null,
        };
        assert!(validate_node_specs(&[spec.clone(), spec.clone()], &[]).is_err());
        assert!(validate_node_specs(std::slice::from_ref(&spec), &["c1"]).is_err());
        assert!(validate_node_specs(&[spec], &["c2"]).is_ok());
    }

    #[tokio::test]
    async fn failed_cluster_write_discards_the_deployment() {
        let h = Harness::permissive();
        let cluster_id = h.hpc1().await;

        h.faults.fail_cluster_status(true);
        let err = h
            .manager
            .deploy(&cluster_id, DeploymentRequest::new(DeploymentAction::Deploy))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Internal(_)));

        let records = h
            .manager
            .list_deployments(&DeploymentFilter::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, DeploymentStatus::Failed);
        let tasks = h.store.list_tasks(&records[0].data.id).await.unwrap();
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Cancelled));
        assert!(h.manager.tracker().cluster_claim(&cluster_id).is_none());
        assert!(h.shell.calls().is_empty());

        h.faults.fail_cluster_status(false);
        let id = h
            .manager
            .deploy(&cluster_id, DeploymentRequest::new(DeploymentAction::Deploy))
            .await
            .unwrap();
        let snapshot = h.wait_terminal(&id).await;
        assert_eq!(snapshot.status, DeploymentStatus::Completed);
    }

    #[tokio::test]
    async fn reservation_blocks_other_deployments() {
        let h = Harness::permissive();
        let cluster_id = h.hpc1().await;

        let reservation = h.manager.reserve(&cluster_id).await.unwrap();
        let err = h
            .manager
            .deploy(&cluster_id, DeploymentRequest::new(DeploymentAction::Deploy))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::DeploymentInProgress { .. }));

        h.manager.release(reservation);
        h.manager
            .deploy(&cluster_id, DeploymentRequest::new(DeploymentAction::Deploy))
            .await
            .unwrap();
    }

    #[test]
    fn request_defaults_to_deploy() {
        let request: DeploymentRequest =
            serde_json::from_str(r#"{"node_names": ["c1"], "parallelism": 2}"#).unwrap();
        assert_eq!(request.action, DeploymentAction::Deploy);
        assert_eq!(request.options.parallelism, Some(2));
        assert_eq!(request.options.node_names, vec!["c1".to_owned()]);
    }
}
