//! Integration tests for the HTTP API.

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::TestControl;
use stratus_control::api::router;
use tower::ServiceExt;

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn read_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn api_deploy_flow_from_registration_to_logs() {
    let control = TestControl::new();
    let app = router(control.app_state.clone());

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/clusters",
            serde_json::json!({
                "name": "hpc1",
                "nodes": [
                    {"name": "m1", "role": "master", "host": "10.0.0.1"},
                    {"name": "c1", "role": "compute", "host": "10.0.0.2"},
                    {"name": "c2", "role": "compute", "host": "10.0.0.3"}
                ]
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let cluster = read_json(response).await;
    let cluster_id = cluster["id"].as_str().unwrap().to_owned();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/clusters/{cluster_id}/deployments"),
            serde_json::json!({"action": "deploy", "parallelism": 2}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted = read_json(response).await;
    assert_eq!(accepted["status"], "pending");
    let deployment_id = accepted["deployment_id"].as_str().unwrap().to_owned();

    // A second request while the first is tracked is a conflict or, if the
    // first already finished, a new deployment.
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/clusters/{cluster_id}/deployments"),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert!(matches!(
        response.status(),
        StatusCode::CONFLICT | StatusCode::ACCEPTED
    ));
    if response.status() == StatusCode::ACCEPTED {
        let second = read_json(response).await;
        let id = stratus_control::types::DeploymentId::new(
            second["deployment_id"].as_str().unwrap(),
        );
        control.wait_terminal(&id).await;
    }

    let id = stratus_control::types::DeploymentId::new(deployment_id.clone());
    tokio::time::timeout(Duration::from_secs(10), control.wait_terminal(&id))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(get(&format!("/deployments/{deployment_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let detail = read_json(response).await;
    assert_eq!(detail["status"], "completed");
    assert_eq!(detail["result"]["nodes_total"], 3);
    assert_eq!(detail["result"]["nodes_success"], 3);
    assert_eq!(detail["tasks"].as_array().unwrap().len(), 3);

    let response = app
        .clone()
        .oneshot(get(&format!(
            "/deployments/{deployment_id}/logs?step_type=connect"
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let logs = read_json(response).await;
    let ssh_logs = logs["ssh_logs"].as_array().unwrap();
    assert_eq!(ssh_logs.len(), 3);
    assert!(ssh_logs.iter().all(|l| l["command"] == "hostname"));

    let response = app
        .clone()
        .oneshot(get(&format!("/deployments?cluster_id={cluster_id}&status=completed")))
        .await
        .unwrap();
    let listed = read_json(response).await;
    assert!(!listed.as_array().unwrap().is_empty());

    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/deployments/{deployment_id}/cancel"),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn api_cluster_view_never_exposes_passwords() {
    let control = TestControl::new();
    let app = router(control.app_state.clone());

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/clusters",
            serde_json::json!({
                "name": "secure",
                "nodes": [{
                    "name": "m1",
                    "role": "master",
                    "host": "10.0.0.1",
                    "credentials": {
                        "user": "root",
                        "auth": {"method": "password", "password": "s3cret"}
                    }
                }]
            }),
        ))
        .await
        .unwrap();
    let cluster = read_json(response).await;
    let id = cluster["id"].as_str().unwrap();

    for uri in [format!("/clusters/{id}"), "/clusters".to_owned()] {
        let response = app.clone().oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = read_json(response).await.to_string();
        assert!(!text.contains("s3cret"), "{uri} leaked a password");
    }
}

#[tokio::test]
async fn api_unknown_routes_and_ids() {
    let control = TestControl::new();
    let app = router(control.app_state.clone());

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/clusters/missing/deployments",
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/clusters/missing/scale/readiness",
            serde_json::json!({"node_names": ["c1"]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.oneshot(get("/nope")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
