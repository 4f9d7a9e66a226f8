//! Common test utilities for control plane integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use stratus_control::api::AppState;
use stratus_control::config::{DeploymentConfig, RetryConfig, SaltConfig};
use stratus_control::deployment::CreateClusterRequest;
use stratus_control::pipeline::{InstallerSettings, NodeInstaller};
use stratus_control::salt::MockConfigManagement;
use stratus_control::ssh::{MockShell, NodeCredentials, SshExecutor};
use stratus_control::store::StoreLogSink;
use stratus_control::tracker::DeploymentSnapshot;
use stratus_control::types::{ClusterConfig, ClusterId, DeploymentId, NodeRole, NodeSpec};
use stratus_control::{
    ClusterStore, DeploymentManager, DeploymentTracker, MemoryStore, ProgressStreamer, ScaleGate,
};

/// Complete control plane with every component wired against in-memory
/// backends.
pub struct TestControl {
    pub store: Arc<dyn ClusterStore>,
    pub shell: Arc<MockShell>,
    pub salt: Arc<MockConfigManagement>,
    pub manager: Arc<DeploymentManager>,
    pub gate: Arc<ScaleGate>,
    pub app_state: AppState,
}

impl TestControl {
    /// Every command succeeds and every agent is registered and online.
    pub fn new() -> Self {
        Self::with(MockShell::new(), MockConfigManagement::permissive())
    }

    /// Creates a control plane over the given shell and agent backend.
    pub fn with(shell: MockShell, salt: MockConfigManagement) -> Self {
        let store: Arc<dyn ClusterStore> = Arc::new(MemoryStore::new());
        let shell = Arc::new(shell);
        let salt = Arc::new(salt);
        let retry = RetryConfig {
            max_retries: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 2.0,
        };

        let ssh = Arc::new(SshExecutor::new(
            shell.clone(),
            Arc::new(StoreLogSink(store.clone())),
            Duration::from_secs(5),
        ));
        let installer = Arc::new(NodeInstaller::new(
            store.clone(),
            ssh,
            salt.clone(),
            InstallerSettings {
                salt: SaltConfig::default(),
                download_command: "stage {packages}".to_owned(),
                retry: retry.clone(),
                agent_registration: Duration::from_millis(100),
                agent_poll: Duration::from_millis(5),
            },
        ));
        let tracker = Arc::new(DeploymentTracker::new(Duration::from_secs(60)));
        let manager = Arc::new(DeploymentManager::new(
            store.clone(),
            installer,
            tracker.clone(),
            DeploymentConfig {
                retry,
                ..DeploymentConfig::default()
            },
            "10.0.0.1",
        ));
        let gate = Arc::new(ScaleGate::new(manager.clone(), salt.clone()));
        let app_state = AppState {
            manager: manager.clone(),
            gate: gate.clone(),
            streamer: ProgressStreamer::new(tracker, store.clone(), Duration::from_millis(20)),
        };

        Self {
            store,
            shell,
            salt,
            manager,
            gate,
            app_state,
        }
    }

    /// Registers `hpc1`: master `m1` plus computes `c1` and `c2`.
    pub async fn hpc1(&self) -> ClusterId {
        self.manager
            .create_cluster(CreateClusterRequest {
                name: "hpc1".to_owned(),
                description: Some("integration cluster".to_owned()),
                salt_master: None,
                config: ClusterConfig::default(),
                nodes: vec![
                    node("m1", NodeRole::Master, "10.0.0.1"),
                    node("c1", NodeRole::Compute, "10.0.0.2"),
                    node("c2", NodeRole::Compute, "10.0.0.3"),
                ],
            })
            .await
            .unwrap()
            .cluster
            .id
    }

    /// Waits for a deployment to reach a terminal snapshot.
    pub async fn wait_terminal(&self, id: &DeploymentId) -> DeploymentSnapshot {
        let mut rx = self.manager.tracker().subscribe(id).unwrap();
        let snapshot = tokio::time::timeout(
            Duration::from_secs(10),
            rx.wait_for(DeploymentSnapshot::is_terminal),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        snapshot
    }
}

impl Default for TestControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Node spec with default credentials.
pub fn node(name: &str, role: NodeRole, host: &str) -> NodeSpec {
    NodeSpec {
        name: name.to_owned(),
        role,
        host: host.to_owned(),
        port: 22,
        credentials: NodeCredentials::default(),
        resources: Default::default(),
        config: serde_json::Value::Null,
    }
}
