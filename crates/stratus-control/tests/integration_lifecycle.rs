//! Integration tests for deployment lifecycle against mock nodes.

mod common;

use std::time::Duration;

use common::TestControl;
use stratus_control::deployment::{DeploymentRequest, LogQuery};
use stratus_control::salt::MockConfigManagement;
use stratus_control::ssh::{MockResponse, MockShell};
use stratus_control::store::LogFilter;
use stratus_control::types::{
    ClusterStatus, DeploymentAction, DeploymentOptions, DeploymentStatus, InstallStepKind,
    NodeStatus, TaskStatus,
};
use stratus_control::ControlError;

#[tokio::test]
async fn deploy_installs_every_node() {
    let control = TestControl::new();
    let cluster_id = control.hpc1().await;

    let id = control
        .manager
        .deploy(&cluster_id, DeploymentRequest::new(DeploymentAction::Deploy))
        .await
        .unwrap();
    let snapshot = control.wait_terminal(&id).await;
    assert_eq!(snapshot.status, DeploymentStatus::Completed);
    assert_eq!(snapshot.progress, 100);

    let detail = control.manager.get_deployment(&id).await.unwrap();
    let result = detail.deployment.data.result.unwrap();
    assert_eq!(result.nodes_total, 3);
    assert_eq!(result.nodes_success, 3);
    assert_eq!(result.nodes_failed, 0);
    assert!(detail
        .tasks
        .iter()
        .all(|t| t.status == TaskStatus::Completed));

    let cluster = control.manager.get_cluster(&cluster_id).await.unwrap();
    assert_eq!(cluster.cluster.status, ClusterStatus::Running);
    assert!(cluster.nodes.iter().all(|n| n.status == NodeStatus::Active));

    // slurmctld on the master, slurmd everywhere else
    assert!(control.salt.is_running("m1", "slurmctld"));
    assert!(control.salt.is_running("c1", "slurmd"));
    assert!(control.salt.is_running("c2", "slurmd"));
}

#[tokio::test]
async fn every_command_leaves_one_audit_row() {
    let control = TestControl::new();
    let cluster_id = control.hpc1().await;

    let id = control
        .manager
        .deploy(&cluster_id, DeploymentRequest::new(DeploymentAction::Deploy))
        .await
        .unwrap();
    control.wait_terminal(&id).await;

    let logs = control
        .store
        .list_ssh_logs(&id, &LogFilter::default())
        .await
        .unwrap();
    assert_eq!(logs.len(), control.shell.calls().len());
    for log in &logs {
        assert_eq!(log.success, log.exit_code == Some(0));
        assert!(log.step_id.is_some());
        assert!(log.finished_at >= log.started_at);
    }
}

#[tokio::test]
async fn second_deployment_rejected_while_first_runs() {
    let control = TestControl::with(
        MockShell::new().with_delay(Duration::from_millis(50)),
        MockConfigManagement::permissive(),
    );
    let cluster_id = control.hpc1().await;

    let first = control
        .manager
        .deploy(&cluster_id, DeploymentRequest::new(DeploymentAction::Deploy))
        .await
        .unwrap();
    let err = control
        .manager
        .deploy(&cluster_id, DeploymentRequest::new(DeploymentAction::Deploy))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::DeploymentInProgress { .. }));

    control.wait_terminal(&first).await;
    let second = control
        .manager
        .deploy(&cluster_id, DeploymentRequest::new(DeploymentAction::Deploy))
        .await;
    assert!(second.is_ok());
}

#[tokio::test]
async fn cancel_leaves_no_task_open() {
    let control = TestControl::with(
        MockShell::new().with_delay(Duration::from_millis(30)),
        MockConfigManagement::permissive(),
    );
    let cluster_id = control.hpc1().await;

    let request = DeploymentRequest {
        action: DeploymentAction::Deploy,
        options: DeploymentOptions {
            parallelism: Some(1),
            ..DeploymentOptions::default()
        },
    };
    let id = control.manager.deploy(&cluster_id, request).await.unwrap();
    let record = control.manager.cancel(&id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Cancelled);

    let tasks = control.store.list_tasks(&id).await.unwrap();
    assert!(tasks.iter().all(|t| t.status.is_terminal()));
    assert!(tasks.iter().any(|t| t.status == TaskStatus::Cancelled));
}

#[tokio::test]
async fn progress_never_goes_backwards() {
    let control = TestControl::with(
        MockShell::new().with_delay(Duration::from_millis(5)),
        MockConfigManagement::permissive(),
    );
    let cluster_id = control.hpc1().await;

    let id = control
        .manager
        .deploy(&cluster_id, DeploymentRequest::new(DeploymentAction::Deploy))
        .await
        .unwrap();
    let mut rx = control.manager.tracker().subscribe(&id).unwrap();

    let mut last = 0;
    loop {
        let snapshot = rx.borrow_and_update().clone();
        assert!(
            snapshot.progress >= last,
            "progress went from {last} to {}",
            snapshot.progress
        );
        last = snapshot.progress;
        if snapshot.is_terminal() {
            break;
        }
        tokio::time::timeout(Duration::from_secs(10), rx.changed())
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(last, 100);
}

#[tokio::test]
async fn failed_node_is_named_in_the_error() {
    let shell = MockShell::new();
    shell.respond_on("10.0.0.3", "hostname", MockResponse::Unreachable);
    let control = TestControl::with(shell, MockConfigManagement::permissive());
    let cluster_id = control.hpc1().await;

    let id = control
        .manager
        .deploy(&cluster_id, DeploymentRequest::new(DeploymentAction::Deploy))
        .await
        .unwrap();
    let snapshot = control.wait_terminal(&id).await;
    assert_eq!(snapshot.status, DeploymentStatus::Failed);
    assert!(snapshot.error.unwrap().contains("c2"));

    let logs = control
        .manager
        .logs(
            &id,
            &LogQuery {
                node_id: None,
                step_type: Some(InstallStepKind::Connect),
            },
        )
        .await
        .unwrap();
    assert!(logs.ssh_logs.iter().any(|l| !l.success && l.host == "10.0.0.3"));
    assert!(logs
        .install_steps
        .iter()
        .all(|s| s.kind == InstallStepKind::Connect));
}
