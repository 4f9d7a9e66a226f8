//! HTTP API for the control service.
//!
//! Provides endpoints for:
//! - Cluster registration and inspection
//! - Deployments (trigger, query, logs, cancel) and their progress streams
//! - Scale readiness checks and gated scale operations
//! - Health, readiness and Prometheus metrics

mod clusters;
mod deployments;
mod scale;

use std::fmt::Write as _;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::deployment::DeploymentManager;
use crate::error::{ControlError, NodeFailure};
use crate::salt::SaltError;
use crate::scale::ScaleGate;
use crate::store::DeploymentFilter;
use crate::stream::ProgressStreamer;
use crate::types::DeploymentStatus;

pub use clusters::{ClusterResponse, NodeView};
pub use deployments::{AcceptedResponse, ListDeploymentsQuery};

/// Shared application state for the control service.
#[derive(Clone)]
pub struct AppState {
    /// Cluster and deployment orchestration.
    pub manager: Arc<DeploymentManager>,
    /// Readiness gate for scale operations.
    pub gate: Arc<ScaleGate>,
    /// Progress streams.
    pub streamer: ProgressStreamer,
}

/// Creates the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        // Clusters
        .route(
            "/clusters",
            post(clusters::create_cluster).get(clusters::list_clusters),
        )
        .route("/clusters/{id}", get(clusters::get_cluster))
        .route(
            "/clusters/{id}/deployments",
            post(deployments::create_deployment),
        )
        .route("/clusters/{id}/scale/readiness", post(scale::readiness))
        .route("/clusters/{id}/scale", post(scale::scale))
        // Deployments
        .route("/deployments", get(deployments::list_deployments))
        .route("/deployments/{id}", get(deployments::get_deployment))
        .route("/deployments/{id}/stream", get(deployments::stream))
        .route("/deployments/{id}/logs", get(deployments::logs))
        .route("/deployments/{id}/cancel", post(deployments::cancel))
        .with_state(state)
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message.
    pub error: String,
    /// Nodes that failed a readiness gate.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_nodes: Vec<NodeFailure>,
}

pub(crate) type ApiError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn error_response(error: ControlError) -> ApiError {
    let status = error_to_status(&error);
    if status.is_server_error() {
        tracing::warn!(error = %error, "request failed");
    }
    let failed_nodes = match &error {
        ControlError::NodesNotReady { failed } => failed.clone(),
        _ => Vec::new(),
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            failed_nodes,
        }),
    )
}

fn error_to_status(error: &ControlError) -> StatusCode {
    match error {
        ControlError::Validation(_) | ControlError::Serialisation(_) => StatusCode::BAD_REQUEST,
        ControlError::ClusterNotFound(_)
        | ControlError::NodeNotFound(_)
        | ControlError::DeploymentNotFound(_) => StatusCode::NOT_FOUND,
        ControlError::DeploymentInProgress { .. }
        | ControlError::InvalidStateTransition { .. }
        | ControlError::NodesNotReady { .. } => StatusCode::CONFLICT,
        ControlError::Salt(SaltError::MasterUnreachable(_)) => StatusCode::BAD_GATEWAY,
        e if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Health check endpoint.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

/// Readiness check endpoint.
async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let active_deployments = state.manager.tracker().active_count();
    match state.manager.list_clusters().await {
        Ok(_) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                active_deployments,
            }),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                active_deployments,
            }),
        ),
    }
}

/// Metrics endpoint.
async fn metrics(State(state): State<AppState>) -> String {
    let mut output = String::new();

    output.push_str("# HELP stratus_deployments_total Number of deployments by status\n");
    output.push_str("# TYPE stratus_deployments_total gauge\n");

    for status in DeploymentStatus::ALL {
        let filter = DeploymentFilter::new().with_status(*status);
        let count = state
            .manager
            .list_deployments(&filter)
            .await
            .map(|d| d.len())
            .unwrap_or(0);
        let _ = writeln!(
            output,
            "stratus_deployments_total{{status=\"{status}\"}} {count}"
        );
    }

    output.push_str("# HELP stratus_deployments_tracked Deployments running in this process\n");
    output.push_str("# TYPE stratus_deployments_tracked gauge\n");
    let _ = writeln!(
        output,
        "stratus_deployments_tracked {}",
        state.manager.tracker().active_count()
    );

    let clusters = state
        .manager
        .list_clusters()
        .await
        .map(|c| c.len())
        .unwrap_or(0);
    output.push_str("# HELP stratus_clusters_total Number of registered clusters\n");
    output.push_str("# TYPE stratus_clusters_total gauge\n");
    let _ = writeln!(output, "stratus_clusters_total {clusters}");

    output
}

/// Health response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness response.
#[derive(Serialize)]
struct ReadyResponse {
    ready: bool,
    active_deployments: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    pub(super) fn app_state(h: &Harness) -> AppState {
        AppState {
            manager: h.manager.clone(),
            gate: Arc::new(ScaleGate::new(h.manager.clone(), h.salt.clone())),
            streamer: ProgressStreamer::new(
                h.manager.tracker().clone(),
                h.manager.store().clone(),
                Duration::from_millis(20),
            ),
        }
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn health_endpoint() {
        let h = Harness::permissive();
        let (status, _) = get(router(app_state(&h)), "/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_endpoint() {
        let h = Harness::permissive();
        let (status, body) = get(router(app_state(&h)), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"ready\":true"));
    }

    #[tokio::test]
    async fn metrics_endpoint() {
        let h = Harness::permissive();
        h.hpc1().await;
        let (status, body) = get(router(app_state(&h)), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("stratus_deployments_total{status=\"running\"} 0"));
        assert!(body.contains("stratus_clusters_total 1"));
    }

    #[test]
    fn errors_map_to_statuses() {
        let cases = [
            (ControlError::validation("bad"), StatusCode::BAD_REQUEST),
            (
                ControlError::ClusterNotFound("x".to_owned()),
                StatusCode::NOT_FOUND,
            ),
            (
                ControlError::NodesNotReady { failed: Vec::new() },
                StatusCode::CONFLICT,
            ),
            (
                ControlError::Salt(SaltError::MasterUnreachable("refused".to_owned())),
                StatusCode::BAD_GATEWAY,
            ),
            (ControlError::Timeout(5), StatusCode::GATEWAY_TIMEOUT),
            (ControlError::internal("boom"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, expected) in cases {
            assert_eq!(error_to_status(&error), expected, "{error}");
        }
    }
}
