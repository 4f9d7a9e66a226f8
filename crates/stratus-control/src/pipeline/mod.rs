//! Per-node installer pipeline.
//!
//! A [`NodeInstaller`] runs one [`InstallTask`] to completion: it walks the
//! task's [`Plan`] step by step, retrying each step with exponential backoff,
//! moving the node through its status table and persisting every change
//! before reporting it to the deployment coordinator.
//!
//! A worker owns its task, its install steps and its node for the whole run.
//! Nothing else writes them while the pipeline is running.

mod steps;

use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{RetryConfig, SaltConfig};
use crate::error::ControlResult;
use crate::salt::ConfigManagement;
use crate::ssh::{ExecContext, SshExecutor};
use crate::state::install_transition;
use crate::store::ClusterStore;
use crate::types::{
    Cluster, DeploymentAction, InstallStep, InstallStepKind, InstallTask, Node, NodeStatus,
    SessionId, StepStatus, TaskResult, TaskStatus, TaskType,
};

/// Ordered steps a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Full workload-manager installation.
    Install,
    /// Bootstrap and register the agent only.
    AgentOnly,
    /// Stop services and remove the node.
    Decommission,
}

impl Plan {
    /// Choose the plan for a task of a deployment.
    #[must_use]
    pub fn for_task(action: DeploymentAction, task_type: TaskType) -> Self {
        if action.is_decommission() {
            Self::Decommission
        } else if task_type == TaskType::AgentInstall {
            Self::AgentOnly
        } else {
            Self::Install
        }
    }

    /// Steps in execution order.
    #[must_use]
    pub const fn steps(&self) -> &'static [InstallStepKind] {
        match self {
            Self::Install => &[
                InstallStepKind::Connect,
                InstallStepKind::Download,
                InstallStepKind::Install,
                InstallStepKind::Configure,
                InstallStepKind::Start,
                InstallStepKind::Validate,
            ],
            Self::AgentOnly => &[InstallStepKind::Connect, InstallStepKind::Validate],
            Self::Decommission => &[
                InstallStepKind::Connect,
                InstallStepKind::Configure,
                InstallStepKind::Validate,
            ],
        }
    }

    /// Node status while `step` runs and after it succeeds.
    #[must_use]
    pub const fn node_transition(&self, step: InstallStepKind) -> (NodeStatus, NodeStatus) {
        match self {
            Self::Decommission => (NodeStatus::Removing, NodeStatus::Removing),
            Self::Install | Self::AgentOnly => install_transition(step),
        }
    }
}

/// Notification sent to the coordinator after a worker commits a change.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// The task's progress or current step changed.
    Progress(InstallTask),
    /// An install step was written.
    Step(InstallStep),
    /// The task reached a terminal status.
    Finished(InstallTask),
}

/// Everything one pipeline run needs.
#[derive(Debug, Clone)]
pub struct InstallJob {
    /// Cluster the node belongs to.
    pub cluster: Arc<Cluster>,
    /// Target node.
    pub node: Node,
    /// Task to run.
    pub task: InstallTask,
    /// Steps to run.
    pub plan: Plan,
    /// Retries per step after the first attempt.
    pub max_retries: u32,
    /// Bootstrap the agent over SSH when it is not registered.
    pub bootstrap_agent: bool,
    /// Packages added for this deployment.
    pub extra_packages: Vec<String>,
}

/// Stop requests a pipeline honours.
#[derive(Debug, Clone, Default)]
pub struct Signals {
    /// Stop before the next step or retry. Commands in flight finish.
    pub cancel: CancellationToken,
    /// Abandon commands in flight as well. The run fails.
    pub interrupt: CancellationToken,
}

impl Signals {
    /// How a halted run ends.
    fn halt(&self) -> (TaskStatus, &'static str) {
        if self.interrupt.is_cancelled() {
            (TaskStatus::Failed, "interrupted by deployment deadline")
        } else {
            (TaskStatus::Cancelled, "cancelled")
        }
    }
}

/// Runtime settings shared by every pipeline.
#[derive(Debug, Clone)]
pub struct InstallerSettings {
    /// Salt settings, used for the bootstrap command.
    pub salt: SaltConfig,
    /// Package staging command with a `{packages}` placeholder.
    pub download_command: String,
    /// Step retry backoff.
    pub retry: RetryConfig,
    /// How long to wait for a bootstrapped agent to register.
    pub agent_registration: Duration,
    /// Interval between registration polls.
    pub agent_poll: Duration,
}

/// Runs install tasks against nodes.
pub struct NodeInstaller {
    store: Arc<dyn ClusterStore>,
    ssh: Arc<SshExecutor>,
    salt: Arc<dyn ConfigManagement>,
    settings: InstallerSettings,
}

/// Why a step stopped.
enum StepOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Mutable state of one running pipeline.
struct Run {
    job: InstallJob,
    steps: Vec<InstallStep>,
    session_id: SessionId,
    events: mpsc::UnboundedSender<PipelineEvent>,
    signals: Signals,
    started: Instant,
}

impl Run {
    fn context(&self, step: &InstallStep) -> ExecContext {
        ExecContext {
            session_id: Some(self.session_id.clone()),
            node_id: Some(self.job.node.id.clone()),
            task_id: Some(self.job.task.id.clone()),
            step_id: Some(step.id.clone()),
            interrupt: self.signals.interrupt.clone(),
        }
    }

    fn completed_steps(&self) -> u32 {
        let done = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        u32::try_from(done).unwrap_or(u32::MAX)
    }

    fn progress(&self) -> u8 {
        let total = self.steps.len().max(1);
        let done = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        u8::try_from(done * 100 / total).unwrap_or(100)
    }

    fn notify(&self, event: PipelineEvent) {
        // The coordinator may already be gone after a timeout.
        let _ = self.events.send(event);
    }
}

impl NodeInstaller {
    /// Create an installer.
    #[must_use]
    pub fn new(
        store: Arc<dyn ClusterStore>,
        ssh: Arc<SshExecutor>,
        salt: Arc<dyn ConfigManagement>,
        settings: InstallerSettings,
    ) -> Self {
        Self {
            store,
            ssh,
            salt,
            settings,
        }
    }

    /// Run a job to a terminal task status.
    ///
    /// Never fails: persistence errors end the task as failed and are
    /// reported through the returned task.
    #[instrument(
        skip_all,
        fields(task_id = %job.task.id, node = %job.node.name, plan = ?job.plan)
    )]
    pub async fn run(
        &self,
        job: InstallJob,
        events: mpsc::UnboundedSender<PipelineEvent>,
        signals: Signals,
    ) -> InstallTask {
        let steps = job
            .plan
            .steps()
            .iter()
            .zip(0u32..)
            .map(|(kind, seq)| InstallStep::new(&job.task, *kind, seq, job.max_retries))
            .collect();

        let mut run = Run {
            job,
            steps,
            session_id: SessionId::generate(),
            events,
            signals,
            started: Instant::now(),
        };

        if let Err(e) = self.drive(&mut run).await {
            warn!(error = %e, "pipeline aborted");
            if !run.job.task.status.is_terminal() {
                let message = e.to_string();
                if let Err(e) = self
                    .finish(&mut run, TaskStatus::Failed, Some(message))
                    .await
                {
                    warn!(error = %e, "failed to record pipeline failure");
                }
            }
        }

        run.notify(PipelineEvent::Finished(run.job.task.clone()));
        run.job.task
    }

    async fn drive(&self, run: &mut Run) -> ControlResult<()> {
        for step in &run.steps {
            self.save_step(&run.events, step).await?;
        }

        let now = Utc::now();
        run.job.task.status = TaskStatus::Running;
        run.job.task.started_at = Some(now);
        run.job.task.updated_at = now;
        self.store.update_task(&run.job.task).await?;
        info!("pipeline started");

        for index in 0..run.steps.len() {
            if run.signals.cancel.is_cancelled() {
                let (status, message) = run.signals.halt();
                return self.stop(run, index, status, message).await;
            }

            match self.run_step(run, index).await? {
                StepOutcome::Completed => {}
                StepOutcome::Cancelled => {
                    let (status, message) = run.signals.halt();
                    return self.stop(run, index + 1, status, message).await;
                }
                StepOutcome::Failed(message) => {
                    return self
                        .stop(run, index + 1, TaskStatus::Failed, &message)
                        .await;
                }
            }
        }

        self.finish(run, TaskStatus::Completed, None).await?;
        info!(
            duration_ms = run.started.elapsed().as_millis(),
            "pipeline completed"
        );
        Ok(())
    }

    /// Skip the steps from `from` onwards and end the task.
    async fn stop(
        &self,
        run: &mut Run,
        from: usize,
        status: TaskStatus,
        message: &str,
    ) -> ControlResult<()> {
        for step in run.steps.iter_mut().skip(from) {
            if !step.status.is_terminal() {
                step.status = StepStatus::Skipped;
                self.save_step(&run.events, step).await?;
            }
        }

        if matches!(
            run.job.node.status,
            NodeStatus::Connecting | NodeStatus::Installing | NodeStatus::Configuring
        ) {
            self.move_node(run, NodeStatus::Failed).await?;
        }

        if status == TaskStatus::Failed {
            warn!(error = message, "pipeline failed");
        } else {
            info!("pipeline cancelled");
        }
        self.finish(run, status, Some(message.to_owned())).await
    }

    async fn finish(
        &self,
        run: &mut Run,
        status: TaskStatus,
        error: Option<String>,
    ) -> ControlResult<()> {
        let now = Utc::now();
        let result = TaskResult {
            success: status == TaskStatus::Completed,
            steps_completed: run.completed_steps(),
            duration_ms: u64::try_from(run.started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        let task = &mut run.job.task;
        task.status = status;
        task.error = error;
        task.completed_at = Some(now);
        task.updated_at = now;
        if status == TaskStatus::Completed {
            task.progress = 100;
        }
        task.result = Some(result);
        self.store.update_task(&run.job.task).await
    }

    /// Persist an install step and report it to the coordinator.
    async fn save_step(
        &self,
        events: &mpsc::UnboundedSender<PipelineEvent>,
        step: &InstallStep,
    ) -> ControlResult<()> {
        self.store.upsert_install_step(step).await?;
        // The coordinator may already be gone after a timeout.
        let _ = events.send(PipelineEvent::Step(step.clone()));
        Ok(())
    }

    async fn move_node(&self, run: &mut Run, next: NodeStatus) -> ControlResult<()> {
        let current = run.job.node.status;
        if current == next {
            return Ok(());
        }
        run.job.node.status = current.transition_to(next)?;
        self.store
            .update_node_status(&run.job.node.id, run.job.node.status)
            .await?;
        debug!(from = %current, to = %next, "node status changed");
        Ok(())
    }

    #[instrument(skip_all, fields(step = %run.steps[index].kind))]
    async fn run_step(&self, run: &mut Run, index: usize) -> ControlResult<StepOutcome> {
        let kind = run.steps[index].kind;
        let (during, after) = run.job.plan.node_transition(kind);
        self.move_node(run, during).await?;

        let now = Utc::now();
        run.steps[index].status = StepStatus::Running;
        run.steps[index].started_at = Some(now);
        self.save_step(&run.events, &run.steps[index]).await?;

        run.job.task.current_step = Some(kind);
        run.job.task.updated_at = now;
        self.store.update_task(&run.job.task).await?;
        run.notify(PipelineEvent::Progress(run.job.task.clone()));

        let started = Instant::now();
        let mut backoff = self.settings.retry.backoff();

        let outcome = loop {
            let context = run.context(&run.steps[index]);
            match self.attempt(run, kind, &context).await {
                Ok(output) => {
                    run.steps[index].output = Some(output);
                    run.steps[index].status = StepStatus::Completed;
                    break StepOutcome::Completed;
                }
                Err(e) => {
                    let step = &mut run.steps[index];
                    step.error = Some(e.to_string());
                    if run.signals.interrupt.is_cancelled() {
                        step.status = StepStatus::TimedOut;
                        break StepOutcome::Failed(format!("{kind} interrupted: {e}"));
                    }
                    if step.retry_count >= step.max_retries {
                        step.status = if e.is_timeout() {
                            StepStatus::TimedOut
                        } else {
                            StepStatus::Failed
                        };
                        break StepOutcome::Failed(format!("{kind} failed: {e}"));
                    }

                    step.retry_count += 1;
                    let wait = backoff.next_backoff().unwrap_or(backoff.max_interval);
                    warn!(
                        error = %e,
                        retry = step.retry_count,
                        max_retries = step.max_retries,
                        wait_ms = wait.as_millis(),
                        "step failed, retrying"
                    );
                    self.save_step(&run.events, step).await?;

                    tokio::select! {
                        () = tokio::time::sleep(wait) => {}
                        () = run.signals.cancel.cancelled() => {
                            step.status = StepStatus::Skipped;
                            break StepOutcome::Cancelled;
                        }
                    }
                }
            }
        };

        let step = &mut run.steps[index];
        step.completed_at = Some(Utc::now());
        step.duration_ms = Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));
        self.save_step(&run.events, step).await?;

        if matches!(outcome, StepOutcome::Completed) {
            self.move_node(run, after).await?;
            run.job.task.progress = run.progress();
            run.job.task.updated_at = Utc::now();
            self.store.update_task(&run.job.task).await?;
            run.notify(PipelineEvent::Progress(run.job.task.clone()));
        }

        Ok(outcome)
    }

    async fn attempt(
        &self,
        run: &Run,
        kind: InstallStepKind,
        context: &ExecContext,
    ) -> ControlResult<String> {
        let job = &run.job;
        match (job.plan, kind) {
            (_, InstallStepKind::Connect) => self.connect(run, context).await,
            (_, InstallStepKind::Download) => self.download(job, context).await,
            (_, InstallStepKind::Install) => self.install(job).await,
            (Plan::Decommission, InstallStepKind::Configure) => self.decommission(job).await,
            (_, InstallStepKind::Configure) => self.configure(job).await,
            (_, InstallStepKind::Start) => self.start(job).await,
            (Plan::Decommission, InstallStepKind::Validate) => {
                self.validate_removed(job, context).await
            }
            (Plan::AgentOnly, InstallStepKind::Validate) => self.validate_agent(job).await,
            (Plan::Install, InstallStepKind::Validate) => self.validate(job, context).await,
        }
    }
}

impl std::fmt::Debug for NodeInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeInstaller")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::salt::{MockConfigManagement, MockOp};
    use crate::ssh::{MockResponse, MockShell, NodeCredentials};
    use crate::store::{MemoryStore, StoreLogSink};
    use crate::types::{ClusterConfig, ClusterId, ClusterStatus, DeploymentId, NodeRole, NodeSpec};

    struct Harness {
        store: Arc<MemoryStore>,
        shell: Arc<MockShell>,
        salt: Arc<MockConfigManagement>,
        installer: NodeInstaller,
    }

    fn settings() -> InstallerSettings {
        InstallerSettings {
            salt: SaltConfig::default(),
            download_command: "stage {packages}".to_owned(),
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
                multiplier: 2.0,
            },
            agent_registration: Duration::from_millis(200),
            agent_poll: Duration::from_millis(5),
        }
    }

    fn harness(salt: MockConfigManagement) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let shell = Arc::new(MockShell::new());
        let salt = Arc::new(salt);
        let ssh = Arc::new(SshExecutor::new(
            shell.clone(),
            Arc::new(StoreLogSink(store.clone())),
            Duration::from_secs(5),
        ));
        let installer = NodeInstaller::new(store.clone(), ssh, salt.clone(), settings());
        Harness {
            store,
            shell,
            salt,
            installer,
        }
    }

    async fn job(h: &Harness, role: NodeRole, action: DeploymentAction) -> InstallJob {
        let now = Utc::now();
        let cluster = Cluster {
            id: ClusterId::generate(),
            name: "hpc1".to_owned(),
            description: None,
            status: ClusterStatus::Deploying,
            master_host: "10.0.0.1".to_owned(),
            master_port: 22,
            salt_master: "10.0.0.1".to_owned(),
            config: ClusterConfig::default(),
            created_at: now,
            updated_at: now,
        };
        let node = NodeSpec {
            name: "c1".to_owned(),
            role,
            host: "10.0.0.2".to_owned(),
            port: 22,
            credentials: NodeCredentials::default(),
            resources: Default::default(),
            config: serde_json::Value::Null,
        }
        .into_node(&cluster.id);
        h.store
            .create_cluster(&cluster, std::slice::from_ref(&node))
            .await
            .unwrap();

        let record = crate::types::DeploymentRecord::new(crate::types::DeploymentData::new(
            cluster.id.clone(),
            action,
            Default::default(),
        ));
        let task = InstallTask::new(
            &record.data.id,
            &node,
            role.task_type(),
            serde_json::Value::Null,
        );
        h.store
            .create_deployment(&record, std::slice::from_ref(&task))
            .await
            .unwrap();

        InstallJob {
            plan: Plan::for_task(action, task.task_type),
            cluster: Arc::new(cluster),
            node,
            task,
            max_retries: 2,
            bootstrap_agent: false,
            extra_packages: Vec::new(),
        }
    }

    async fn run(h: &Harness, job: InstallJob) -> (InstallTask, Vec<PipelineEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = h.installer.run(job, tx, Signals::default()).await;
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        (task, events)
    }

    async fn steps_of(h: &Harness, deployment: &DeploymentId) -> Vec<InstallStep> {
        h.store.list_install_steps(deployment).await.unwrap()
    }

    #[test]
    fn plans_by_action_and_type() {
        assert_eq!(
            Plan::for_task(DeploymentAction::Deploy, TaskType::NodeInstall),
            Plan::Install
        );
        assert_eq!(
            Plan::for_task(DeploymentAction::Deploy, TaskType::AgentInstall),
            Plan::AgentOnly
        );
        assert_eq!(
            Plan::for_task(DeploymentAction::ScaleDown, TaskType::NodeInstall),
            Plan::Decommission
        );
        assert_eq!(Plan::Install.steps().len(), 6);
    }

    #[tokio::test]
    async fn compute_node_installs_and_goes_active() {
        let h = harness(MockConfigManagement::permissive());
        let job = job(&h, NodeRole::Compute, DeploymentAction::Deploy).await;
        let deployment_id = job.task.deployment_id.clone();
        let node_id = job.node.id.clone();

        let (task, events) = run(&h, job).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(task.result.as_ref().unwrap().steps_completed, 6);
        assert!(matches!(events.last(), Some(PipelineEvent::Finished(_))));

        let node = h.store.get_node(&node_id).await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Active);
        assert!(h.salt.is_running("c1", "slurmd"));

        let steps = steps_of(&h, &deployment_id).await;
        assert_eq!(steps.len(), 6);
        assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
        assert!(h
            .shell
            .calls()
            .iter()
            .any(|c| c.command.contains("stage munge slurm slurm-slurmd")));
    }

    #[tokio::test]
    async fn install_skipped_when_packages_present() {
        let h = harness(MockConfigManagement::permissive());
        for package in ["munge", "slurm", "slurm-slurmd"] {
            h.salt.install_package("c1", package);
        }
        let job = job(&h, NodeRole::Compute, DeploymentAction::Deploy).await;
        let (task, _) = run(&h, job).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert!(!h.salt.calls().contains(&"install c1".to_owned()));
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let h = harness(MockConfigManagement::permissive());
        h.salt.fail_next(MockOp::Configure, "c1", 1);
        let job = job(&h, NodeRole::Compute, DeploymentAction::Deploy).await;
        let deployment_id = job.task.deployment_id.clone();

        let (task, _) = run(&h, job).await;
        assert_eq!(task.status, TaskStatus::Completed);

        let steps = steps_of(&h, &deployment_id).await;
        let configure = steps
            .iter()
            .find(|s| s.kind == InstallStepKind::Configure)
            .unwrap();
        assert_eq!(configure.retry_count, 1);
        assert_eq!(configure.status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_and_skip_the_rest() {
        let h = harness(MockConfigManagement::permissive());
        h.salt.fail_next(MockOp::Install, "c1", 10);
        let job = job(&h, NodeRole::Compute, DeploymentAction::Deploy).await;
        let deployment_id = job.task.deployment_id.clone();
        let node_id = job.node.id.clone();

        let (task, _) = run(&h, job).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.current_step, Some(InstallStepKind::Install));
        assert!(task.error.as_deref().unwrap().contains("scripted failure"));

        let steps = steps_of(&h, &deployment_id).await;
        let statuses: Vec<_> = steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                StepStatus::Completed,
                StepStatus::Completed,
                StepStatus::Failed,
                StepStatus::Skipped,
                StepStatus::Skipped,
                StepStatus::Skipped,
            ]
        );
        assert_eq!(steps[2].retry_count, 2);

        let node = h.store.get_node(&node_id).await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
    }

    #[tokio::test]
    async fn unreachable_host_fails_connect() {
        let h = harness(MockConfigManagement::permissive());
        h.shell
            .respond_on("10.0.0.2", "", MockResponse::Unreachable);
        let job = job(&h, NodeRole::Compute, DeploymentAction::Deploy).await;
        let deployment_id = job.task.deployment_id.clone();

        let (task, _) = run(&h, job).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_deref().unwrap().contains("connect failed"));

        // First attempt plus two retries, one log row each.
        let logs = h
            .store
            .list_ssh_logs(&deployment_id, &Default::default())
            .await
            .unwrap();
        assert_eq!(logs.len(), 3);
        assert!(logs.iter().all(|l| !l.success));
    }

    #[tokio::test]
    async fn unregistered_agent_is_bootstrapped() {
        let h = harness(MockConfigManagement::new());
        h.salt.register_after("c1", 2);
        let mut job = job(&h, NodeRole::Compute, DeploymentAction::Deploy).await;
        job.bootstrap_agent = true;

        let (task, _) = run(&h, job).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(h
            .shell
            .calls()
            .iter()
            .any(|c| c.command.contains("bootstrap")));
    }

    #[tokio::test]
    async fn unregistered_agent_without_bootstrap_fails() {
        let h = harness(MockConfigManagement::new());
        let job = job(&h, NodeRole::Compute, DeploymentAction::Deploy).await;

        let (task, _) = run(&h, job).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_deref().unwrap().contains("not registered"));
    }

    #[tokio::test]
    async fn decommission_stops_daemon_and_keeps_removing() {
        let h = harness(MockConfigManagement::permissive());
        let job = job(&h, NodeRole::Compute, DeploymentAction::ScaleDown).await;
        let node_id = job.node.id.clone();

        let (task, _) = run(&h, job).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_ref().unwrap().steps_completed, 3);

        let calls = h.salt.calls();
        assert!(calls.contains(&"stopservice c1".to_owned()));
        assert!(calls.contains(&"decommission c1".to_owned()));

        let node = h.store.get_node(&node_id).await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Removing);
    }

    #[tokio::test]
    async fn cancelled_before_first_step() {
        let h = harness(MockConfigManagement::permissive());
        let job = job(&h, NodeRole::Compute, DeploymentAction::Deploy).await;
        let node_id = job.node.id.clone();

        let (tx, _rx) = mpsc::unbounded_channel();
        let signals = Signals::default();
        signals.cancel.cancel();
        let task = h.installer.run(job, tx, signals).await;

        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(h.shell.calls().is_empty());
        let node = h.store.get_node(&node_id).await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Pending);
    }
}
