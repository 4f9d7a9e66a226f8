//! Deployment endpoints.

use std::convert::Infallible;
use std::str::FromStr;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::deployment::{DeploymentDetail, DeploymentLogs, DeploymentRequest, LogQuery};
use crate::error::ControlError;
use crate::store::DeploymentFilter;
use crate::stream::StreamEvent;
use crate::types::{
    ClusterId, DeploymentAction, DeploymentId, DeploymentRecord, DeploymentStatus,
};

use super::{error_response, ApiError, AppState};

/// Query parameters for listing deployments.
#[derive(Debug, Default, Deserialize)]
pub struct ListDeploymentsQuery {
    /// Filter by cluster.
    pub cluster_id: Option<String>,
    /// Filter by status.
    pub status: Option<String>,
    /// Filter by action.
    pub action: Option<String>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

impl ListDeploymentsQuery {
    fn into_filter(self) -> Result<DeploymentFilter, ControlError> {
        let mut filter = DeploymentFilter::new();
        if let Some(cluster_id) = self.cluster_id {
            filter = filter.with_cluster(ClusterId::new(cluster_id));
        }
        if let Some(status) = self.status {
            filter = filter.with_status(
                DeploymentStatus::from_str(&status.to_lowercase())
                    .map_err(ControlError::validation)?,
            );
        }
        if let Some(action) = self.action {
            filter = filter.with_action(
                DeploymentAction::from_str(&action.to_lowercase())
                    .map_err(ControlError::validation)?,
            );
        }
        if let Some(limit) = self.limit {
            filter = filter.with_limit(limit);
        }
        if let Some(offset) = self.offset {
            filter = filter.with_offset(offset);
        }
        Ok(filter)
    }
}

/// Response for an accepted deployment.
#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptedResponse {
    /// The assigned deployment ID.
    pub deployment_id: DeploymentId,
    /// Initial status.
    pub status: DeploymentStatus,
}

impl AcceptedResponse {
    pub(super) const fn pending(deployment_id: DeploymentId) -> Self {
        Self {
            deployment_id,
            status: DeploymentStatus::Pending,
        }
    }
}

/// Trigger a deployment against a cluster.
pub async fn create_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<DeploymentRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    info!(cluster_id = %id, action = %request.action, "creating deployment via API");

    let deployment_id = state
        .manager
        .deploy(&ClusterId::new(id), request)
        .await
        .map_err(error_response)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse::pending(deployment_id)),
    ))
}

/// List deployments with optional filters.
pub async fn list_deployments(
    State(state): State<AppState>,
    Query(query): Query<ListDeploymentsQuery>,
) -> Result<Json<Vec<DeploymentRecord>>, ApiError> {
    let filter = query.into_filter().map_err(error_response)?;
    state
        .manager
        .list_deployments(&filter)
        .await
        .map(Json)
        .map_err(error_response)
}

/// Get a deployment with its tasks and steps.
pub async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentDetail>, ApiError> {
    state
        .manager
        .get_deployment(&DeploymentId::new(id))
        .await
        .map(Json)
        .map_err(error_response)
}

/// Execution history of a deployment.
pub async fn logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<Json<DeploymentLogs>, ApiError> {
    state
        .manager
        .logs(&DeploymentId::new(id), &query)
        .await
        .map(Json)
        .map_err(error_response)
}

/// Cancel a deployment.
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentRecord>, ApiError> {
    info!(deployment_id = %id, "cancelling deployment via API");
    state
        .manager
        .cancel(&DeploymentId::new(id))
        .await
        .map(Json)
        .map_err(error_response)
}

/// Server-sent progress events.
pub async fn stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = state
        .streamer
        .subscribe(DeploymentId::new(id))
        .map(|event| Ok(to_sse(&event)));
    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

fn to_sse(event: &StreamEvent) -> Event {
    let data = match event {
        StreamEvent::Snapshot(snapshot) | StreamEvent::Complete(snapshot) => {
            serde_json::to_string(snapshot)
        }
        StreamEvent::Error { message } => {
            serde_json::to_string(&serde_json::json!({ "error": message }))
        }
    };
    Event::default()
        .event(event.name())
        .data(data.unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}")))
}
