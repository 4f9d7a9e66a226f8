//! Service lifecycle management.
//!
//! Provides the main service runner with signal handling and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api;
use crate::config::{ControlConfig, SaltMode};
use crate::deployment::DeploymentManager;
use crate::error::{ControlError, ControlResult};
use crate::pipeline::{InstallerSettings, NodeInstaller};
use crate::salt::{ConfigManagement, MockConfigManagement, SaltApiClient};
use crate::scale::ScaleGate;
use crate::ssh::{RusshShell, SshExecutor};
use crate::store::{ClusterStore, MemoryStore, PostgresStore, StoreLogSink};
use crate::stream::ProgressStreamer;
use crate::tracker::DeploymentTracker;

/// The control service.
///
/// Manages the lifecycle of the orchestrator, including:
/// - Database connections
/// - SSH and Salt clients
/// - HTTP API server
/// - Signal handling and graceful shutdown
pub struct ControlService {
    config: ControlConfig,
    cancel: CancellationToken,
}

impl ControlService {
    /// Create a new control service with the given configuration.
    #[must_use]
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Run the control service.
    ///
    /// This will:
    /// 1. Connect to the database (or use in-memory store as fallback)
    /// 2. Build the SSH executor, Salt client and node installer
    /// 3. Create the deployment manager, scale gate and progress streamer
    /// 4. Start the HTTP API server
    /// 5. Wait for shutdown signal
    pub async fn run(&self) -> ControlResult<()> {
        let store = self.create_store().await;
        let salt = self.create_salt()?;

        let ssh = Arc::new(SshExecutor::new(
            Arc::new(RusshShell::new(&self.config.ssh)),
            Arc::new(StoreLogSink(Arc::clone(&store))),
            self.config.ssh.command_timeout(),
        ));

        let deployment = &self.config.deployment;
        let installer = Arc::new(NodeInstaller::new(
            Arc::clone(&store),
            ssh,
            Arc::clone(&salt),
            InstallerSettings {
                salt: self.config.salt.clone(),
                download_command: self.config.ssh.download_command.clone(),
                retry: deployment.retry.clone(),
                agent_registration: deployment.agent_registration(),
                agent_poll: deployment.agent_poll(),
            },
        ));

        let tracker = Arc::new(DeploymentTracker::new(deployment.retention()));
        let manager = Arc::new(DeploymentManager::new(
            Arc::clone(&store),
            installer,
            Arc::clone(&tracker),
            deployment.clone(),
            self.config.salt.master_address.clone(),
        ));
        info!(
            parallelism = deployment.parallelism,
            timeout_secs = deployment.timeout_secs,
            "deployment manager initialised"
        );

        let pruner = tokio::spawn(
            Arc::clone(&tracker).run_pruner(deployment.retention(), self.cancel.clone()),
        );

        let state = api::AppState {
            gate: Arc::new(ScaleGate::new(Arc::clone(&manager), salt)),
            streamer: ProgressStreamer::new(tracker, Arc::clone(&store), self.config.stream.interval()),
            manager,
        };

        let request_timeout = Duration::from_secs(self.config.server.request_timeout_secs);
        let app = api::router(state).layer(middleware::from_fn_with_state(
            request_timeout,
            enforce_timeout,
        ));

        let listener = tokio::net::TcpListener::bind(self.config.server.listen)
            .await
            .map_err(|e| ControlError::Config(format!("failed to bind TCP: {e}")))?;
        info!(addr = %self.config.server.listen, "control service listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(self.cancel.clone()))
            .await
            .map_err(|e| ControlError::Config(format!("server error: {e}")))?;

        self.cancel.cancel();
        if let Err(e) = pruner.await {
            warn!(error = %e, "tracker pruner ended abnormally");
        }

        info!("control service shutdown complete");
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn create_store(&self) -> Arc<dyn ClusterStore> {
        match PostgresStore::connect(&self.config.database).await {
            Ok(store) => {
                info!("connected to PostgreSQL");
                Arc::new(store)
            }
            Err(e) => {
                error!(
                    error = %e,
                    "failed to connect to PostgreSQL, using in-memory store"
                );
                Arc::new(MemoryStore::new())
            }
        }
    }

    fn create_salt(&self) -> ControlResult<Arc<dyn ConfigManagement>> {
        match self.config.salt.mode {
            SaltMode::Api => {
                let client = SaltApiClient::new(&self.config.salt)?;
                info!(url = %self.config.salt.url, "salt-api client configured");
                Ok(Arc::new(client))
            }
            SaltMode::Mock => {
                warn!("using mock configuration management, no agents are contacted");
                Ok(Arc::new(MockConfigManagement::permissive()))
            }
        }
    }
}

/// Bound request handling time. Progress streams are exempt.
async fn enforce_timeout(
    State(limit): State<Duration>,
    request: Request,
    next: Next,
) -> Response {
    if request.uri().path().ends_with("/stream") {
        return next.run(request).await;
    }
    match tokio::time::timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => (StatusCode::GATEWAY_TIMEOUT, "request timed out").into_response(),
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}
