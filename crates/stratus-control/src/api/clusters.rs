//! Cluster endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::deployment::{ClusterDetail, CreateClusterRequest};
use crate::types::{Cluster, ClusterId, Node, NodeId, NodeResources, NodeRole, NodeStatus};

use super::{error_response, ApiError, AppState};

/// A node as returned by the API. Credentials are never included.
#[derive(Debug, Serialize)]
pub struct NodeView {
    /// Node identifier.
    pub id: NodeId,
    /// Node name.
    pub name: String,
    /// Role.
    pub role: NodeRole,
    /// Host name or address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Remote user.
    pub user: String,
    /// Installation status.
    pub status: NodeStatus,
    /// Hardware description.
    pub resources: NodeResources,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl From<Node> for NodeView {
    fn from(node: Node) -> Self {
        Self {
            id: node.id,
            name: node.name,
            role: node.role,
            host: node.host,
            port: node.port,
            user: node.credentials.user,
            status: node.status,
            resources: node.resources,
            created_at: node.created_at,
            updated_at: node.updated_at,
        }
    }
}

/// A cluster with its nodes.
#[derive(Debug, Serialize)]
pub struct ClusterResponse {
    /// The cluster.
    #[serde(flatten)]
    pub cluster: Cluster,
    /// Its nodes.
    pub nodes: Vec<NodeView>,
}

impl From<ClusterDetail> for ClusterResponse {
    fn from(detail: ClusterDetail) -> Self {
        Self {
            cluster: detail.cluster,
            nodes: detail.nodes.into_iter().map(NodeView::from).collect(),
        }
    }
}

/// Register a cluster.
pub async fn create_cluster(
    State(state): State<AppState>,
    Json(request): Json<CreateClusterRequest>,
) -> Result<(StatusCode, Json<ClusterResponse>), ApiError> {
    info!(name = %request.name, nodes = request.nodes.len(), "creating cluster via API");
    let detail = state
        .manager
        .create_cluster(request)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(detail.into())))
}

/// List clusters.
pub async fn list_clusters(State(state): State<AppState>) -> Result<Json<Vec<Cluster>>, ApiError> {
    state
        .manager
        .list_clusters()
        .await
        .map(Json)
        .map_err(error_response)
}

/// Get a cluster with its nodes.
pub async fn get_cluster(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ClusterResponse>, ApiError> {
    state
        .manager
        .get_cluster(&ClusterId::new(id))
        .await
        .map(|detail| Json(detail.into()))
        .map_err(error_response)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::super::router;
    use super::super::tests::app_state;
    use crate::testing::Harness;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn create_cluster_hides_credentials() {
        let h = Harness::permissive();
        let app = router(app_state(&h));

        let response = app
            .oneshot(post(
                "/clusters",
                serde_json::json!({
                    "name": "hpc1",
                    "nodes": [
                        {
                            "name": "m1",
                            "role": "master",
                            "host": "10.0.0.1",
                            "credentials": {
                                "user": "admin",
                                "auth": {"method": "password", "password": "hunter2"}
                            }
                        },
                        {"name": "c1", "role": "compute", "host": "10.0.0.2"}
                    ]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let body = json(response).await;
        assert_eq!(body["name"], "hpc1");
        assert_eq!(body["master_host"], "10.0.0.1");
        assert_eq!(body["nodes"].as_array().unwrap().len(), 2);
        let text = body.to_string();
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("credentials"));
    }

    #[tokio::test]
    async fn cluster_without_master_rejected() {
        let h = Harness::permissive();
        let app = router(app_state(&h));

        let response = app
            .oneshot(post(
                "/clusters",
                serde_json::json!({
                    "name": "hpc2",
                    "nodes": [{"name": "c1", "role": "compute", "host": "10.0.0.2"}]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json(response).await;
        assert!(body["error"].as_str().unwrap().contains("master"));
    }

    #[tokio::test]
    async fn unknown_cluster_is_not_found() {
        let h = Harness::permissive();
        let response = router(app_state(&h))
            .oneshot(
                Request::builder()
                    .uri("/clusters/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
