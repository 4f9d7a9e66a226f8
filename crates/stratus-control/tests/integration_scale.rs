//! Integration tests for the scale gate.

mod common;

use common::TestControl;
use rstest::rstest;
use stratus_control::deployment::DeploymentRequest;
use stratus_control::salt::MockConfigManagement;
use stratus_control::scale::{ScaleDirection, ScaleRequest};
use stratus_control::ssh::MockShell;
use stratus_control::types::{DeploymentAction, DeploymentOptions, DeploymentStatus, NodeStatus};
use stratus_control::{ControlError, DeploymentFilter};

fn scale_request(direction: ScaleDirection, names: &[&str]) -> ScaleRequest {
    ScaleRequest {
        direction,
        node_names: names.iter().map(|n| (*n).to_owned()).collect(),
        role: None,
        hosts: Default::default(),
        port: None,
        credentials: None,
        options: DeploymentOptions::default(),
    }
}

fn agents(names: &[&str]) -> MockConfigManagement {
    let salt = MockConfigManagement::new();
    for name in names {
        salt.register(name);
    }
    salt
}

#[tokio::test]
async fn unregistered_node_rejects_scale_without_side_effects() {
    let control = TestControl::with(MockShell::new(), agents(&["m1", "c1", "c2"]));
    let cluster_id = control.hpc1().await;

    let err = control
        .gate
        .scale(&cluster_id, scale_request(ScaleDirection::Up, &["c3"]))
        .await
        .unwrap_err();
    match err {
        ControlError::NodesNotReady { failed } => {
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].node, "c3");
            assert_eq!(failed[0].reason, "not registered");
        }
        other => panic!("unexpected error: {other}"),
    }

    let deployments = control
        .manager
        .list_deployments(&DeploymentFilter::new().with_cluster(cluster_id.clone()))
        .await
        .unwrap();
    assert!(deployments.is_empty());
    let nodes = control.store.list_nodes(&cluster_id).await.unwrap();
    assert_eq!(nodes.len(), 3);
    assert!(control.shell.calls().is_empty());
}

#[derive(Debug, Clone, Copy)]
enum Agent {
    Online,
    Offline,
    Missing,
    MasterDown,
}

#[rstest]
#[case::online(Agent::Online, true, None)]
#[case::offline(Agent::Offline, false, Some("offline"))]
#[case::missing(Agent::Missing, false, Some("not registered"))]
#[case::master_down(Agent::MasterDown, false, Some("unreachable"))]
#[tokio::test]
async fn readiness_truth_table(
    #[case] agent: Agent,
    #[case] ready: bool,
    #[case] reason: Option<&str>,
) {
    let salt = agents(&["m1", "c1", "c2"]);
    match agent {
        Agent::Online => salt.register("c3"),
        Agent::Offline => salt.register_offline("c3"),
        Agent::Missing => {}
        Agent::MasterDown => {
            salt.register("c3");
            salt.set_master_reachable(false);
        }
    }
    let control = TestControl::with(MockShell::new(), salt);
    let cluster_id = control.hpc1().await;

    let report = control
        .gate
        .check_readiness(&cluster_id, &["c3".to_owned()])
        .await
        .unwrap();
    let node = &report.nodes[0];
    assert_eq!(node.ready, ready);
    assert_eq!(node.ready, node.registered && node.online);
    match reason {
        Some(expected) => assert!(node.reason.as_deref().unwrap().contains(expected)),
        None => assert!(node.reason.is_none()),
    }
}

#[tokio::test]
async fn offline_node_is_reported_as_offline() {
    let salt = agents(&["m1", "c1", "c2"]);
    salt.register_offline("c3");
    let control = TestControl::with(MockShell::new(), salt);
    let cluster_id = control.hpc1().await;

    let report = control
        .gate
        .check_readiness(&cluster_id, &["c1".to_owned(), "c3".to_owned()])
        .await
        .unwrap();
    assert_eq!(report.total, 2);
    assert_eq!(report.ready, 1);
    assert!(!report.all_ready());
    assert_eq!(report.failures()[0].reason, "offline");
}

#[tokio::test]
async fn scale_up_then_down() {
    let control = TestControl::with(MockShell::new(), agents(&["m1", "c1", "c2", "c3"]));
    let cluster_id = control.hpc1().await;

    let initial = control
        .manager
        .deploy(&cluster_id, DeploymentRequest::new(DeploymentAction::Deploy))
        .await
        .unwrap();
    control.wait_terminal(&initial).await;

    let up = control
        .gate
        .scale(&cluster_id, scale_request(ScaleDirection::Up, &["c3"]))
        .await
        .unwrap();
    let snapshot = control.wait_terminal(&up).await;
    assert_eq!(snapshot.status, DeploymentStatus::Completed);
    assert_eq!(snapshot.action, DeploymentAction::ScaleUp);
    assert_eq!(snapshot.tasks.len(), 1);
    assert_eq!(snapshot.tasks[0].node_name, "c3");

    let down = control
        .gate
        .scale(&cluster_id, scale_request(ScaleDirection::Down, &["c1"]))
        .await
        .unwrap();
    let snapshot = control.wait_terminal(&down).await;
    assert_eq!(snapshot.status, DeploymentStatus::Completed);

    let nodes = control.store.list_nodes(&cluster_id).await.unwrap();
    let c1 = nodes.iter().find(|n| n.name == "c1").unwrap();
    assert_eq!(c1.status, NodeStatus::Removing);
    let c3 = nodes.iter().find(|n| n.name == "c3").unwrap();
    assert_eq!(c3.status, NodeStatus::Active);
    assert!(control.salt.calls().contains(&"decommission c1".to_owned()));
}
