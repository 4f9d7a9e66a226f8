//! Scale endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::info;

use crate::scale::{ReadinessReport, ReadinessRequest, ScaleRequest};
use crate::types::ClusterId;

use super::deployments::AcceptedResponse;
use super::{error_response, ApiError, AppState};

/// Check agent readiness of nodes.
pub async fn readiness(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ReadinessRequest>,
) -> Result<Json<ReadinessReport>, ApiError> {
    state
        .gate
        .check_readiness(&ClusterId::new(id), &request.node_names)
        .await
        .map(Json)
        .map_err(error_response)
}

/// Scale a cluster. Rejected with 409 when any node is not ready.
pub async fn scale(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ScaleRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    info!(
        cluster_id = %id,
        direction = ?request.direction,
        nodes = request.node_names.len(),
        "scaling cluster via API"
    );
    let deployment_id = state
        .gate
        .scale(&ClusterId::new(id), request)
        .await
        .map_err(error_response)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse::pending(deployment_id)),
    ))
}
