//! Background fan-out of one deployment.
//!
//! Pipelines run on a [`JoinSet`], at most `parallelism` at a time. Every
//! pipeline event carries the task or install step a worker just committed;
//! the coordinator folds it into its in-memory view, re-aggregates progress,
//! phase steps and result, persists what changed and publishes to the
//! tracker.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ControlError, ControlResult};
use crate::pipeline::{InstallJob, NodeInstaller, PipelineEvent, Signals};
use crate::state::{AnyDeployment, Deployment, Pending, Running};
use crate::store::ClusterStore;
use crate::tracker::{DeploymentSnapshot, DeploymentTracker};
use crate::types::{
    Cluster, ClusterStatus, DeploymentAction, DeploymentId, DeploymentRecord, DeploymentResult,
    DeploymentStatus, InstallStep, InstallStepId, InstallTask, NodeStatus, Step, StepId, StepKind,
    StepStatus, TaskStatus,
};

/// How long interrupted pipelines get to record their outcome after the
/// deadline before they are aborted.
const INTERRUPT_GRACE: Duration = Duration::from_secs(5);

/// How a fan-out ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Finished,
    TimedOut,
}

pub(super) struct Coordinator {
    pub(super) store: Arc<dyn ClusterStore>,
    pub(super) installer: Arc<NodeInstaller>,
    pub(super) tracker: Arc<DeploymentTracker>,
    pub(super) deployment: Deployment<Pending>,
    pub(super) cluster: Arc<Cluster>,
    pub(super) previous_status: ClusterStatus,
    pub(super) jobs: Vec<InstallJob>,
    pub(super) parallelism: usize,
    pub(super) timeout_secs: u64,
    pub(super) max_retries: u32,
    pub(super) cancel: CancellationToken,
}

/// Coordinator state once pipelines are running.
struct Fanout {
    store: Arc<dyn ClusterStore>,
    tracker: Arc<DeploymentTracker>,
    deployment: Deployment<Running>,
    tasks: Vec<InstallTask>,
    install_steps: HashMap<InstallStepId, InstallStep>,
    steps: BTreeMap<StepKind, Step>,
}

impl Coordinator {
    /// Drive the deployment to a terminal status.
    pub(super) async fn run(self) {
        let id = self.deployment.id().clone();
        let store = self.store.clone();
        let tracker = self.tracker.clone();
        let cluster_id = self.cluster.id.clone();
        let previous_status = self.previous_status;

        if let Err(e) = self.execute().await {
            error!(deployment_id = %id, error = %e, "deployment coordinator failed");
            abandon(&*store, &tracker, &id, previous_status, &e).await;
            tracker.release_cluster(&cluster_id, &id);
        }
    }

    async fn execute(self) -> ControlResult<()> {
        let Self {
            store,
            installer,
            tracker,
            deployment,
            cluster,
            previous_status,
            jobs,
            parallelism,
            timeout_secs,
            max_retries,
            cancel,
        } = self;
        let action = deployment.data().action;
        let id = deployment.id().clone();

        let mut tasks: Vec<InstallTask> = jobs.iter().map(|j| j.task.clone()).collect();

        if cancel.is_cancelled() {
            info!(deployment_id = %id, "deployment cancelled before start");
            cancel_tasks(&*store, &mut tasks, "cancelled before start").await?;
            let record = deployment
                .cancel(DeploymentResult::from_tasks(&tasks))
                .into_record();
            store.update_deployment(&record).await?;
            store
                .update_cluster_status(&cluster.id, previous_status)
                .await?;
            tracker.publish(DeploymentSnapshot::new(&record, &tasks));
            return Ok(());
        }

        let mut phases: Vec<StepKind> = jobs
            .iter()
            .flat_map(|j| j.plan.steps().iter().map(|k| k.phase()))
            .collect();
        phases.sort_unstable();
        phases.dedup();
        let steps = phases
            .into_iter()
            .map(|kind| {
                (
                    kind,
                    Step {
                        id: StepId::generate(),
                        deployment_id: id.clone(),
                        kind,
                        status: StepStatus::Pending,
                        message: None,
                        retry_count: 0,
                        max_retries,
                        started_at: None,
                        completed_at: None,
                        duration_ms: None,
                    },
                )
            })
            .collect();

        let mut fanout = Fanout {
            store: store.clone(),
            tracker: tracker.clone(),
            deployment: deployment.start(),
            tasks: std::mem::take(&mut tasks),
            install_steps: HashMap::new(),
            steps,
        };
        for step in fanout.steps.values() {
            store.upsert_step(step).await?;
        }
        fanout.persist().await?;
        info!(deployment_id = %id, nodes = fanout.tasks.len(), parallelism, "deployment started");

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let signals = Signals {
            cancel: cancel.clone(),
            interrupt: CancellationToken::new(),
        };
        let mut running = JoinSet::new();
        for job in jobs {
            let installer = installer.clone();
            let semaphore = semaphore.clone();
            let events_tx = events_tx.clone();
            let signals = signals.clone();
            running.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    () = signals.cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                // Tasks that never got a slot stay pending and are cancelled
                // when the fan-out settles.
                let Some(_permit) = permit else {
                    return None;
                };
                Some(installer.run(job, events_tx, signals).await)
            });
        }
        drop(events_tx);

        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        let ending = loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    fanout.apply(event);
                    fanout.refresh().await?;
                }
                joined = running.join_next() => match joined {
                    None => break Ending::Finished,
                    Some(Err(e)) if e.is_panic() => {
                        error!(deployment_id = %id, error = %e, "pipeline panicked");
                    }
                    Some(_) => {}
                },
                () = tokio::time::sleep_until(deadline) => {
                    warn!(deployment_id = %id, timeout_secs, "deployment timed out");
                    signals.interrupt.cancel();
                    signals.cancel.cancel();
                    // Interrupted commands write their audit rows and the
                    // pipelines record the failure before exiting.
                    let drained = tokio::time::timeout(INTERRUPT_GRACE, async {
                        while running.join_next().await.is_some() {}
                    })
                    .await;
                    if drained.is_err() {
                        warn!(deployment_id = %id, "pipelines still running after deadline, aborting");
                        running.abort_all();
                        while running.join_next().await.is_some() {}
                    }
                    break Ending::TimedOut;
                }
            }
        };
        while let Ok(event) = events.try_recv() {
            fanout.apply(event);
        }

        let reason = match ending {
            Ending::TimedOut => ControlError::Timeout(timeout_secs).to_string(),
            Ending::Finished => "pipeline aborted".to_owned(),
        };
        fanout.settle(&reason).await?;

        let cancelled = cancel_took_effect(cancel.is_cancelled(), &fanout.tasks);
        let (record, tasks) = fanout.finish(ending, cancelled, timeout_secs);
        store.update_deployment(&record).await?;
        let cluster_status = cluster_status_after(action, record.status, previous_status);
        store
            .update_cluster_status(&cluster.id, cluster_status)
            .await?;

        info!(
            deployment_id = %id,
            status = %record.status,
            cluster_status = %cluster_status,
            "deployment finished"
        );
        tracker.publish(DeploymentSnapshot::new(&record, &tasks));
        Ok(())
    }
}

impl Fanout {
    /// Fold a committed change into the in-memory view.
    fn apply(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Step(step) => {
                self.install_steps.insert(step.id.clone(), step);
            }
            PipelineEvent::Progress(task) | PipelineEvent::Finished(task) => {
                if let Some(slot) = self.tasks.iter_mut().find(|t| t.id == task.id) {
                    *slot = task;
                }
            }
        }
    }

    /// Recompute aggregates from the in-memory view, persist what changed
    /// and publish.
    async fn refresh(&mut self) -> ControlResult<()> {
        let result = DeploymentResult::from_tasks(&self.tasks);
        let progress = aggregate_progress(&self.tasks);
        let current = current_phase(&self.tasks);
        if self.deployment.record_progress(progress, current, result) {
            self.store
                .update_deployment(&self.deployment.to_record())
                .await?;
        }

        for step in self.steps.values_mut() {
            let members: Vec<&InstallStep> = self
                .install_steps
                .values()
                .filter(|s| s.kind.phase() == step.kind)
                .collect();
            if roll_up(step, &members) {
                self.store.upsert_step(step).await?;
            }
        }

        self.publish();
        Ok(())
    }

    async fn persist(&self) -> ControlResult<()> {
        self.store
            .update_deployment(&self.deployment.to_record())
            .await?;
        self.publish();
        Ok(())
    }

    fn publish(&self) {
        self.tracker.publish(DeploymentSnapshot::new(
            &self.deployment.to_record(),
            &self.tasks,
        ));
    }

    /// Close out tasks no pipeline finished: never started ones are
    /// cancelled, interrupted ones fail with `reason`.
    async fn settle(&mut self, reason: &str) -> ControlResult<()> {
        let committed = self.store.list_tasks(self.deployment.id()).await?;
        for task in committed {
            if let Some(slot) = self.tasks.iter_mut().find(|t| t.id == task.id) {
                *slot = task;
            }
        }

        let open: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.status.is_terminal())
            .map(|(i, _)| i)
            .collect();
        if open.is_empty() {
            return self.refresh().await;
        }

        // Aborted pipelines may have committed rows they never reported.
        for step in self
            .store
            .list_install_steps(self.deployment.id())
            .await?
        {
            self.install_steps.insert(step.id.clone(), step);
        }
        let now = Utc::now();
        for index in open {
            let task = &mut self.tasks[index];
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::Cancelled;
                task.error = Some("not started".to_owned());
            } else {
                task.status = TaskStatus::Failed;
                task.error = Some(reason.to_owned());

                let unfinished: Vec<InstallStep> = self
                    .install_steps
                    .values()
                    .filter(|s| s.task_id == task.id && !s.status.is_terminal())
                    .cloned()
                    .collect();
                for mut step in unfinished {
                    step.status = if step.status == StepStatus::Running {
                        StepStatus::TimedOut
                    } else {
                        StepStatus::Skipped
                    };
                    step.error = Some(reason.to_owned());
                    step.completed_at = Some(now);
                    self.store.upsert_install_step(&step).await?;
                    self.install_steps.insert(step.id.clone(), step);
                }

                if let Some(node) = self.store.get_node(&task.node_id).await? {
                    if matches!(
                        node.status,
                        NodeStatus::Connecting | NodeStatus::Installing | NodeStatus::Configuring
                    ) {
                        self.store
                            .update_node_status(&node.id, NodeStatus::Failed)
                            .await?;
                    }
                }
            }
            task.completed_at = Some(now);
            task.updated_at = now;
            self.store.update_task(task).await?;
            debug!(task_id = %task.id, status = %task.status, "settled task");
        }

        self.refresh().await
    }

    fn finish(
        self,
        ending: Ending,
        cancelled: bool,
        timeout_secs: u64,
    ) -> (DeploymentRecord, Vec<InstallTask>) {
        let result = DeploymentResult::from_tasks(&self.tasks);
        let record = if ending == Ending::TimedOut {
            self.deployment.time_out(result, timeout_secs).into_record()
        } else if cancelled {
            self.deployment.cancel(result).into_record()
        } else if result.nodes_failed == 0 && result.nodes_cancelled == 0 {
            self.deployment.complete(result).into_record()
        } else {
            let error = failure_summary(&self.tasks, result.nodes_total);
            self.deployment.fail(result, error).into_record()
        };
        (record, self.tasks)
    }
}

/// A cancel that arrived after every task finished changes nothing.
fn cancel_took_effect(requested: bool, tasks: &[InstallTask]) -> bool {
    requested && tasks.iter().any(|t| t.status == TaskStatus::Cancelled)
}

fn failure_summary(tasks: &[InstallTask], total: usize) -> String {
    let failed: Vec<&str> = tasks
        .iter()
        .filter(|t| t.status != TaskStatus::Completed)
        .map(|t| t.node_name.as_str())
        .collect();
    format!("{} of {total} nodes failed: {}", failed.len(), failed.join(", "))
}

/// Mean task progress, counting finished tasks as complete.
fn aggregate_progress(tasks: &[InstallTask]) -> u8 {
    if tasks.is_empty() {
        return 0;
    }
    let total: usize = tasks
        .iter()
        .map(|t| {
            if t.status.is_terminal() {
                100
            } else {
                usize::from(t.progress)
            }
        })
        .sum();
    u8::try_from(total / tasks.len()).unwrap_or(100)
}

/// The earliest phase any running task is in.
fn current_phase(tasks: &[InstallTask]) -> Option<StepKind> {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Running)
        .filter_map(|t| t.current_step.map(|s| s.phase()))
        .min()
}

/// Fold a phase's install steps into its deployment-level step. Returns
/// whether the step changed.
fn roll_up(step: &mut Step, members: &[&InstallStep]) -> bool {
    if members.is_empty() {
        return false;
    }

    let terminal = members.iter().all(|s| s.status.is_terminal());
    let status = if members
        .iter()
        .any(|s| matches!(s.status, StepStatus::Failed | StepStatus::TimedOut))
        && terminal
    {
        StepStatus::Failed
    } else if members.iter().all(|s| s.status == StepStatus::Pending) {
        StepStatus::Pending
    } else if !terminal {
        StepStatus::Running
    } else if members.iter().any(|s| s.status == StepStatus::Completed) {
        StepStatus::Completed
    } else {
        StepStatus::Skipped
    };

    let done = members
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .count();
    let message = Some(format!("{done}/{} node steps completed", members.len()));
    let retry_count = members.iter().map(|s| s.retry_count).sum();
    let started_at = members.iter().filter_map(|s| s.started_at).min();
    let completed_at: Option<DateTime<Utc>> = if terminal {
        members.iter().filter_map(|s| s.completed_at).max()
    } else {
        None
    };
    let duration_ms = match (started_at, completed_at) {
        (Some(start), Some(end)) => u64::try_from((end - start).num_milliseconds()).ok(),
        _ => None,
    };

    let changed = step.status != status
        || step.message != message
        || step.retry_count != retry_count
        || step.started_at != started_at
        || step.completed_at != completed_at;
    if changed {
        step.status = status;
        step.message = message;
        step.retry_count = retry_count;
        step.started_at = started_at;
        step.completed_at = completed_at;
        step.duration_ms = duration_ms;
    }
    changed
}

/// Cluster status once a deployment ends.
fn cluster_status_after(
    action: DeploymentAction,
    outcome: DeploymentStatus,
    previous: ClusterStatus,
) -> ClusterStatus {
    use DeploymentStatus as D;

    match (outcome, action) {
        (D::Completed, DeploymentAction::Destroy) => ClusterStatus::Stopped,
        (D::Completed, _) => ClusterStatus::Running,
        (D::Cancelled, _) => previous,
        (_, DeploymentAction::ScaleUp | DeploymentAction::ScaleDown) => ClusterStatus::Running,
        _ => ClusterStatus::Failed,
    }
}

async fn cancel_tasks(
    store: &dyn ClusterStore,
    tasks: &mut [InstallTask],
    reason: &str,
) -> ControlResult<()> {
    let now = Utc::now();
    for task in tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
        task.status = TaskStatus::Cancelled;
        task.error = Some(reason.to_owned());
        task.completed_at = Some(now);
        task.updated_at = now;
        store.update_task(task).await?;
    }
    Ok(())
}

/// Best-effort failure record after the coordinator itself errored.
async fn abandon(
    store: &dyn ClusterStore,
    tracker: &DeploymentTracker,
    id: &DeploymentId,
    previous_status: ClusterStatus,
    cause: &ControlError,
) {
    match fail_abandoned(store, id, previous_status, cause).await {
        Ok(Some((record, tasks))) => {
            tracker.publish(DeploymentSnapshot::new(&record, &tasks));
        }
        Ok(None) => {}
        Err(e) => {
            error!(deployment_id = %id, error = %e, "failed to record aborted deployment");
        }
    }
}

async fn fail_abandoned(
    store: &dyn ClusterStore,
    id: &DeploymentId,
    previous_status: ClusterStatus,
    cause: &ControlError,
) -> ControlResult<Option<(DeploymentRecord, Vec<InstallTask>)>> {
    let record = store
        .get_deployment(id)
        .await?
        .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))?;
    let cluster_id = record.data.cluster_id.clone();
    let mut tasks = store.list_tasks(id).await?;
    cancel_tasks(store, &mut tasks, "deployment aborted").await?;
    let result = DeploymentResult::from_tasks(&tasks);
    let error = format!("deployment aborted: {cause}");

    let record = match AnyDeployment::from_record(record) {
        AnyDeployment::Pending(d) => d.fail(error).into_record(),
        AnyDeployment::Running(d) => d.fail(result, error).into_record(),
        _ => return Ok(None),
    };
    store.update_deployment(&record).await?;
    store
        .update_cluster_status(&cluster_id, previous_status)
        .await?;
    Ok(Some((record, tasks)))
}
