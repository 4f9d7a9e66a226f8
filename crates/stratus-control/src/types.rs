//! Core types for stratus-control.
//!
//! These are the persisted entities of the registry: clusters, nodes,
//! deployments, per-node install tasks and the individually-timed steps
//! recorded while they run. SSH audit rows live in [`crate::ssh`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ssh::{NodeCredentials, SshTarget};

// =============================================================================
// Identifiers
// =============================================================================

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new unique identifier using ULID.
            #[must_use]
            pub fn generate() -> Self {
                Self(ulid::Ulid::new().to_string().to_lowercase())
            }

            /// Get the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

ulid_id!(
    /// Unique identifier for a cluster.
    ClusterId
);
ulid_id!(
    /// Unique identifier for a node.
    NodeId
);
ulid_id!(
    /// Opaque, globally unique deployment identifier. Never reused.
    DeploymentId
);
ulid_id!(
    /// Unique identifier for an install task.
    TaskId
);
ulid_id!(
    /// Unique identifier for a deployment-level step.
    StepId
);
ulid_id!(
    /// Unique identifier for a per-node install step.
    InstallStepId
);
ulid_id!(
    /// Groups the SSH commands issued by one pipeline run.
    SessionId
);
ulid_id!(
    /// Unique identifier for an SSH execution log row.
    LogId
);

// =============================================================================
// Status enums
// =============================================================================

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant,)+];

            /// Get the name as a static string.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(format!(concat!("unknown ", stringify!($name), ": {}"), s)),
                }
            }
        }
    };
}

string_enum! {
    /// Lifecycle status of a cluster.
    pub enum ClusterStatus {
        /// Created, nothing installed yet.
        Pending => "pending",
        /// A deploy, update or destroy is running.
        Deploying => "deploying",
        /// Installed and serving.
        Running => "running",
        /// A scale operation is running.
        Scaling => "scaling",
        /// The last deploy or update failed.
        Failed => "failed",
        /// Destroyed.
        Stopped => "stopped",
    }
}

string_enum! {
    /// Role a node plays in the SLURM cluster.
    pub enum NodeRole {
        /// Runs the controller (`slurmctld`).
        Master => "master",
        /// Runs jobs (`slurmd`).
        Compute => "compute",
        /// User-facing submission host.
        Login => "login",
    }
}

impl NodeRole {
    /// The SLURM daemon this role runs, if any.
    #[must_use]
    pub const fn daemon(&self) -> Option<&'static str> {
        match self {
            Self::Master => Some("slurmctld"),
            Self::Compute => Some("slurmd"),
            Self::Login => None,
        }
    }

    /// Install task type used for this role.
    #[must_use]
    pub const fn task_type(&self) -> TaskType {
        match self {
            Self::Master => TaskType::MasterInstall,
            Self::Compute => TaskType::NodeInstall,
            Self::Login => TaskType::LoginInstall,
        }
    }
}

string_enum! {
    /// Per-node installation status. Transitions are governed by
    /// [`NodeStatus::can_transition_to`].
    pub enum NodeStatus {
        /// Waiting for a task to pick it up.
        Pending => "pending",
        /// Reaching the host and its agent.
        Connecting => "connecting",
        /// Installing packages.
        Installing => "installing",
        /// Configuring and starting services.
        Configuring => "configuring",
        /// Fully installed and validated.
        Active => "active",
        /// The pipeline failed.
        Failed => "failed",
        /// Being decommissioned (terminal).
        Removing => "removing",
    }
}

string_enum! {
    /// Top-level operation requested against a cluster.
    pub enum DeploymentAction {
        /// Initial installation of every node.
        Deploy => "deploy",
        /// Add nodes.
        ScaleUp => "scale_up",
        /// Remove nodes.
        ScaleDown => "scale_down",
        /// Re-apply configuration to existing nodes.
        Update => "update",
        /// Decommission every node.
        Destroy => "destroy",
    }
}

impl DeploymentAction {
    /// Whether nodes targeted by this action are decommissioned.
    #[must_use]
    pub const fn is_decommission(&self) -> bool {
        matches!(self, Self::ScaleDown | Self::Destroy)
    }

    /// Whether this is a scale operation.
    #[must_use]
    pub const fn is_scale(&self) -> bool {
        matches!(self, Self::ScaleUp | Self::ScaleDown)
    }
}

string_enum! {
    /// Status of a deployment.
    pub enum DeploymentStatus {
        /// Accepted, pipelines not started.
        Pending => "pending",
        /// Pipelines running.
        Running => "running",
        /// Every node succeeded.
        Completed => "completed",
        /// At least one node failed.
        Failed => "failed",
        /// Cancelled by a user.
        Cancelled => "cancelled",
        /// The overall deployment ceiling was exceeded.
        TimedOut => "timed_out",
    }
}

impl DeploymentStatus {
    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

string_enum! {
    /// Kind of per-node install task.
    pub enum TaskType {
        /// Bootstrap and register the Salt agent only.
        AgentInstall => "agent_install",
        /// Compute node installation.
        NodeInstall => "node_install",
        /// Controller installation.
        MasterInstall => "master_install",
        /// Login node installation.
        LoginInstall => "login_install",
    }
}

string_enum! {
    /// Status of an install task.
    pub enum TaskStatus {
        /// Not started.
        Pending => "pending",
        /// Pipeline running.
        Running => "running",
        /// Pipeline succeeded.
        Completed => "completed",
        /// Pipeline failed.
        Failed => "failed",
        /// Never started because the deployment was cancelled.
        Cancelled => "cancelled",
    }
}

impl TaskStatus {
    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

string_enum! {
    /// Coarse deployment-level phase.
    pub enum StepKind {
        /// Reaching hosts and staging files.
        Ssh => "ssh",
        /// Salt state application.
        Salt => "salt",
        /// SLURM daemon start.
        Slurm => "slurm",
        /// Post-install validation.
        Validation => "validation",
    }
}

string_enum! {
    /// Fine-grained per-node pipeline step.
    pub enum InstallStepKind {
        /// SSH reachability and agent readiness.
        Connect => "connect",
        /// Package staging.
        Download => "download",
        /// Package installation.
        Install => "install",
        /// Configuration rendering.
        Configure => "configure",
        /// Service start.
        Start => "start",
        /// Post-install checks.
        Validate => "validate",
    }
}

impl InstallStepKind {
    /// The deployment-level phase this step rolls up into.
    #[must_use]
    pub const fn phase(&self) -> StepKind {
        match self {
            Self::Connect | Self::Download => StepKind::Ssh,
            Self::Install | Self::Configure => StepKind::Salt,
            Self::Start => StepKind::Slurm,
            Self::Validate => StepKind::Validation,
        }
    }
}

string_enum! {
    /// Status of a step or install step.
    pub enum StepStatus {
        /// Not started.
        Pending => "pending",
        /// Running (possibly retrying).
        Running => "running",
        /// Succeeded.
        Completed => "completed",
        /// Failed after exhausting retries.
        Failed => "failed",
        /// A command exceeded its time limit.
        TimedOut => "timed_out",
        /// Not run because an earlier step failed.
        Skipped => "skipped",
    }
}

impl StepStatus {
    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

// =============================================================================
// Clusters and nodes
// =============================================================================

/// A SLURM partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Partition name.
    pub name: String,
    /// Compute node names in the partition (empty means every compute node).
    #[serde(default)]
    pub nodes: Vec<String>,
    /// Whether this is the default partition.
    #[serde(default)]
    pub default: bool,
    /// Maximum job wall time (SLURM time format).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time: Option<String>,
}

/// Workload-manager configuration shared by every node of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// SLURM version to install.
    #[serde(default = "default_slurm_version")]
    pub slurm_version: String,
    /// Partitions rendered into `slurm.conf`.
    #[serde(default)]
    pub partitions: Vec<Partition>,
    /// Extra packages installed on every node.
    #[serde(default)]
    pub packages: Vec<String>,
    /// Additional `slurm.conf` settings.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

fn default_slurm_version() -> String {
    "23.11".to_owned()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            slurm_version: default_slurm_version(),
            partitions: Vec::new(),
            packages: Vec::new(),
            settings: BTreeMap::new(),
        }
    }
}

impl ClusterConfig {
    /// Packages that must be present on a node of the given role.
    #[must_use]
    pub fn required_packages(&self, role: NodeRole) -> Vec<String> {
        let mut packages = vec!["munge".to_owned(), "slurm".to_owned()];
        match role {
            NodeRole::Master => packages.push("slurm-slurmctld".to_owned()),
            NodeRole::Compute => packages.push("slurm-slurmd".to_owned()),
            NodeRole::Login => {}
        }
        for extra in &self.packages {
            if !packages.contains(extra) {
                packages.push(extra.clone());
            }
        }
        packages
    }
}

/// A cluster of nodes sharing one workload manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    /// Unique cluster identifier.
    pub id: ClusterId,
    /// Cluster name (unique).
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Current status.
    pub status: ClusterStatus,
    /// Host of the SLURM controller.
    pub master_host: String,
    /// SSH port of the SLURM controller.
    pub master_port: u16,
    /// Address of the Salt master the agents register with.
    pub salt_master: String,
    /// Workload-manager configuration.
    pub config: ClusterConfig,
    /// When the cluster was created.
    pub created_at: DateTime<Utc>,
    /// When the cluster was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Hardware description of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResources {
    /// Logical CPUs.
    #[serde(default)]
    pub cpus: u32,
    /// Memory in MB.
    #[serde(default)]
    pub memory_mb: u64,
    /// Local storage in GB.
    #[serde(default)]
    pub storage_gb: u64,
    /// Attached accelerators.
    #[serde(default)]
    pub accelerators: Vec<Accelerator>,
}

/// A GPU or other accelerator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accelerator {
    /// Generic resource type, e.g. `gpu`.
    pub kind: String,
    /// Model name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Number of devices.
    pub count: u32,
}

/// One host in a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier.
    pub id: NodeId,
    /// Owning cluster.
    pub cluster_id: ClusterId,
    /// Node name, unique within the cluster. Also the Salt minion id.
    pub name: String,
    /// Role in the cluster.
    pub role: NodeRole,
    /// SSH host.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// SSH credentials.
    pub credentials: NodeCredentials,
    /// Current status.
    pub status: NodeStatus,
    /// Hardware description.
    #[serde(default)]
    pub resources: NodeResources,
    /// Per-node configuration passed through to Salt pillar.
    #[serde(default)]
    pub config: serde_json::Value,
    /// When the node was created.
    pub created_at: DateTime<Utc>,
    /// When the node was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// SSH target for this node.
    #[must_use]
    pub fn target(&self) -> SshTarget {
        SshTarget {
            host: self.host.clone(),
            port: self.port,
            credentials: self.credentials.clone(),
        }
    }
}

const fn default_ssh_port() -> u16 {
    22
}

/// Description of a node supplied when creating a cluster or scaling up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node name (Salt minion id).
    pub name: String,
    /// Role in the cluster.
    pub role: NodeRole,
    /// SSH host.
    pub host: String,
    /// SSH port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// SSH credentials.
    #[serde(default)]
    pub credentials: NodeCredentials,
    /// Hardware description.
    #[serde(default)]
    pub resources: NodeResources,
    /// Per-node configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl NodeSpec {
    /// Create a pending node owned by the given cluster.
    #[must_use]
    pub fn into_node(self, cluster_id: &ClusterId) -> Node {
        let now = Utc::now();
        Node {
            id: NodeId::generate(),
            cluster_id: cluster_id.clone(),
            name: self.name,
            role: self.role,
            host: self.host,
            port: self.port,
            credentials: self.credentials,
            status: NodeStatus::Pending,
            resources: self.resources,
            config: self.config,
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// Deployments
// =============================================================================

/// Per-request overrides supplied when triggering a deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentOptions {
    /// Restrict the deployment to these node names (empty means every node
    /// the action applies to).
    #[serde(default)]
    pub node_names: Vec<String>,
    /// Override the pipeline parallelism limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
    /// Override the per-step retry bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Override the overall deployment timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Bootstrap the Salt agent over SSH when it is not yet registered.
    #[serde(default)]
    pub bootstrap_agent: bool,
    /// Only install and register the agent.
    #[serde(default)]
    pub agent_only: bool,
    /// Extra packages for this run, on top of the cluster config.
    #[serde(default)]
    pub packages: Vec<String>,
}

/// Outcome of one node within a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResult {
    /// Node identifier.
    pub node_id: NodeId,
    /// Install task identifier.
    pub task_id: TaskId,
    /// Final task status.
    pub status: TaskStatus,
    /// Number of steps that completed.
    pub steps_completed: u32,
    /// Wall-clock duration in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Error message if the node failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate result of a deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentResult {
    /// Per-node outcomes keyed by node name.
    pub node_results: BTreeMap<String, NodeResult>,
    /// Number of targeted nodes.
    pub nodes_total: usize,
    /// Nodes whose pipeline completed.
    pub nodes_success: usize,
    /// Nodes whose pipeline failed.
    pub nodes_failed: usize,
    /// Nodes that never started because of cancellation or timeout.
    pub nodes_cancelled: usize,
}

impl DeploymentResult {
    /// Recompute the result from the committed task rows.
    #[must_use]
    pub fn from_tasks(tasks: &[InstallTask]) -> Self {
        let mut result = Self {
            nodes_total: tasks.len(),
            ..Self::default()
        };

        for task in tasks {
            match task.status {
                TaskStatus::Completed => result.nodes_success += 1,
                TaskStatus::Failed => result.nodes_failed += 1,
                TaskStatus::Cancelled => result.nodes_cancelled += 1,
                TaskStatus::Pending | TaskStatus::Running => {}
            }

            let (steps_completed, duration_ms) = task
                .result
                .as_ref()
                .map_or((0, None), |r| (r.steps_completed, Some(r.duration_ms)));

            result.node_results.insert(
                task.node_name.clone(),
                NodeResult {
                    node_id: task.node_id.clone(),
                    task_id: task.id.clone(),
                    status: task.status,
                    steps_completed,
                    duration_ms,
                    error: task.error.clone(),
                },
            );
        }

        result
    }
}

/// Common data shared across all deployment states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentData {
    /// Unique deployment identifier.
    pub id: DeploymentId,
    /// Target cluster.
    pub cluster_id: ClusterId,
    /// Requested action.
    pub action: DeploymentAction,
    /// Progress, 0-100.
    pub progress: u8,
    /// Deployment-level phase currently running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<StepKind>,
    /// Request overrides.
    #[serde(default)]
    pub options: DeploymentOptions,
    /// Aggregate result, filled in as nodes finish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<DeploymentResult>,
    /// Error message if the deployment did not complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the deployment was created.
    pub created_at: DateTime<Utc>,
    /// When pipelines started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the deployment reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// When the deployment was last updated.
    pub updated_at: DateTime<Utc>,
}

impl DeploymentData {
    /// Create new deployment data with a freshly generated identifier.
    #[must_use]
    pub fn new(cluster_id: ClusterId, action: DeploymentAction, options: DeploymentOptions) -> Self {
        let now = Utc::now();
        Self {
            id: DeploymentId::generate(),
            cluster_id,
            action,
            progress: 0,
            current_step: None,
            options,
            result: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }
}

/// A deployment record as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// The deployment data.
    #[serde(flatten)]
    pub data: DeploymentData,
    /// Current status.
    pub status: DeploymentStatus,
}

impl DeploymentRecord {
    /// Create a new deployment record in the pending state.
    #[must_use]
    pub const fn new(data: DeploymentData) -> Self {
        Self {
            data,
            status: DeploymentStatus::Pending,
        }
    }
}

/// Final outcome recorded on an install task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Whether every step succeeded.
    pub success: bool,
    /// Number of steps that completed.
    pub steps_completed: u32,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

/// Per-node unit of work inside a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallTask {
    /// Unique task identifier.
    pub id: TaskId,
    /// Owning deployment.
    pub deployment_id: DeploymentId,
    /// Target node.
    pub node_id: NodeId,
    /// Target node name, denormalised for reporting.
    pub node_name: String,
    /// Task type.
    pub task_type: TaskType,
    /// Current status.
    pub status: TaskStatus,
    /// Progress, 0-100.
    pub progress: u8,
    /// Step currently running (or where the task stopped).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<InstallStepKind>,
    /// Install configuration snapshot.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Final outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    /// Error message if the task failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the pipeline started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// When the task was last updated.
    pub updated_at: DateTime<Utc>,
}

impl InstallTask {
    /// Create a pending task for a node.
    #[must_use]
    pub fn new(
        deployment_id: &DeploymentId,
        node: &Node,
        task_type: TaskType,
        config: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            deployment_id: deployment_id.clone(),
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            task_type,
            status: TaskStatus::Pending,
            progress: 0,
            current_step: None,
            config,
            result: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }
}

/// Coarse deployment-level step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique step identifier.
    pub id: StepId,
    /// Owning deployment.
    pub deployment_id: DeploymentId,
    /// Phase.
    pub kind: StepKind,
    /// Current status.
    pub status: StepStatus,
    /// Summary message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Total retries spent by nodes in this phase.
    pub retry_count: u32,
    /// Retry bound per node step.
    pub max_retries: u32,
    /// When the phase started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the phase finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Duration in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Fine-grained step within an install task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallStep {
    /// Unique step identifier.
    pub id: InstallStepId,
    /// Owning install task.
    pub task_id: TaskId,
    /// Node the step ran against.
    pub node_id: NodeId,
    /// Step kind.
    pub kind: InstallStepKind,
    /// Position in the task's plan, starting at 0.
    pub sequence: u32,
    /// Current status.
    pub status: StepStatus,
    /// Output of the last attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Error of the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Retries spent.
    pub retry_count: u32,
    /// Retry bound.
    pub max_retries: u32,
    /// When the step started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Duration in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl InstallStep {
    /// Create a pending step.
    #[must_use]
    pub fn new(task: &InstallTask, kind: InstallStepKind, sequence: u32, max_retries: u32) -> Self {
        Self {
            id: InstallStepId::generate(),
            task_id: task.id.clone(),
            node_id: task.node_id.clone(),
            kind,
            sequence,
            status: StepStatus::Pending,
            output: None,
            error: None,
            retry_count: 0,
            max_retries,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn task(name: &str, status: TaskStatus) -> InstallTask {
        let node = NodeSpec {
            name: name.to_owned(),
            role: NodeRole::Compute,
            host: "10.0.0.2".to_owned(),
            port: 22,
            credentials: NodeCredentials::default(),
            resources: NodeResources::default(),
            config: serde_json::Value::Null,
        }
        .into_node(&ClusterId::generate());
        let mut task = InstallTask::new(
            &DeploymentId::generate(),
            &node,
            TaskType::NodeInstall,
            serde_json::Value::Null,
        );
        task.status = status;
        task
    }

    #[test]
    fn ids_are_unique_and_lowercase() {
        let a = DeploymentId::generate();
        let b = DeploymentId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str(), a.as_str().to_lowercase());
    }

    #[test]
    fn enum_strings_match_serde() {
        for action in DeploymentAction::ALL {
            let json = serde_json::to_string(action).unwrap();
            assert_eq!(json, format!("\"{}\"", action.as_str()));
            assert_eq!(DeploymentAction::from_str(action.as_str()).unwrap(), *action);
        }
        assert!(NodeStatus::from_str("exploded").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!DeploymentStatus::Pending.is_terminal());
        assert!(!DeploymentStatus::Running.is_terminal());
        assert!(DeploymentStatus::Completed.is_terminal());
        assert!(DeploymentStatus::TimedOut.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn step_phases() {
        assert_eq!(InstallStepKind::Connect.phase(), StepKind::Ssh);
        assert_eq!(InstallStepKind::Configure.phase(), StepKind::Salt);
        assert_eq!(InstallStepKind::Start.phase(), StepKind::Slurm);
        assert_eq!(InstallStepKind::Validate.phase(), StepKind::Validation);
    }

    #[test]
    fn required_packages_depend_on_role() {
        let config = ClusterConfig {
            packages: vec!["slurm".to_owned(), "lmod".to_owned()],
            ..ClusterConfig::default()
        };
        let master = config.required_packages(NodeRole::Master);
        assert!(master.contains(&"slurm-slurmctld".to_owned()));
        assert!(master.contains(&"lmod".to_owned()));
        assert_eq!(master.iter().filter(|p| *p == "slurm").count(), 1);

        let login = config.required_packages(NodeRole::Login);
        assert!(!login.iter().any(|p| p.starts_with("slurm-")));
    }

    #[test]
    fn result_counts_every_task() {
        let tasks = vec![
            task("c1", TaskStatus::Completed),
            task("c2", TaskStatus::Failed),
            task("c3", TaskStatus::Cancelled),
        ];
        let result = DeploymentResult::from_tasks(&tasks);
        assert_eq!(result.nodes_total, 3);
        assert_eq!(result.nodes_success, 1);
        assert_eq!(result.nodes_failed, 1);
        assert_eq!(result.nodes_cancelled, 1);
        assert_eq!(result.node_results["c2"].status, TaskStatus::Failed);
    }
}
