//! Implementation of the deployment commands.

use stratus_control::api::AcceptedResponse;
use stratus_control::deployment::DeploymentRequest;
use stratus_control::types::{DeploymentAction, DeploymentOptions, DeploymentRecord};

use super::client::{ClientError, ControlClient};

/// Arguments for `stratus deploy`.
pub struct DeployArgs {
    pub cluster: String,
    pub action: DeploymentAction,
    pub nodes: Vec<String>,
    pub parallelism: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub bootstrap_agent: bool,
    pub agent_only: bool,
}

pub async fn run(client: &ControlClient, args: DeployArgs) -> Result<String, ClientError> {
    let request = DeploymentRequest {
        action: args.action,
        options: DeploymentOptions {
            node_names: args.nodes,
            parallelism: args.parallelism,
            timeout_secs: args.timeout_secs,
            bootstrap_agent: args.bootstrap_agent,
            agent_only: args.agent_only,
            ..DeploymentOptions::default()
        },
    };
    let accepted: AcceptedResponse = client
        .post(&format!("/clusters/{}/deployments", args.cluster), &request)
        .await?;
    println!(
        "Deployment {} accepted ({})",
        accepted.deployment_id, accepted.status
    );
    Ok(accepted.deployment_id.to_string())
}

pub async fn status(client: &ControlClient, id: &str) -> Result<(), ClientError> {
    let detail: serde_json::Value = client.get(&format!("/deployments/{id}")).await?;
    println!("Deployment: {id}");
    println!("Action:     {}", detail["action"].as_str().unwrap_or_default());
    println!("Status:     {}", detail["status"].as_str().unwrap_or_default());
    if let Some(step) = detail["current_step"].as_str() {
        println!("Step:       {step}");
    }
    if let Some(error) = detail["error"].as_str() {
        println!("Error:      {error}");
    }
    println!();
    println!("{:<16} {:<10} {:>8}  ERROR", "NODE", "STATUS", "PROGRESS");
    for task in detail["tasks"].as_array().into_iter().flatten() {
        println!(
            "{:<16} {:<10} {:>7}%  {}",
            task["node_name"].as_str().unwrap_or_default(),
            task["status"].as_str().unwrap_or_default(),
            task["progress"].as_u64().unwrap_or_default(),
            task["error"].as_str().unwrap_or_default(),
        );
    }
    Ok(())
}

pub async fn logs(
    client: &ControlClient,
    id: &str,
    node: Option<&str>,
    step: Option<&str>,
) -> Result<(), ClientError> {
    let mut query = Vec::new();
    if let Some(node) = node {
        query.push(format!("node_id={node}"));
    }
    if let Some(step) = step {
        query.push(format!("step_type={step}"));
    }
    let path = if query.is_empty() {
        format!("/deployments/{id}/logs")
    } else {
        format!("/deployments/{id}/logs?{}", query.join("&"))
    };
    let logs: serde_json::Value = client.get(&path).await?;
    for log in logs["ssh_logs"].as_array().into_iter().flatten() {
        let exit = log["exit_code"]
            .as_i64()
            .map_or_else(|| "-".to_owned(), |c| c.to_string());
        println!(
            "[{}] {}@{} exit={} ({} ms) $ {}",
            log["started_at"].as_str().unwrap_or_default(),
            log["user"].as_str().unwrap_or_default(),
            log["host"].as_str().unwrap_or_default(),
            exit,
            log["duration_ms"],
            log["command"].as_str().unwrap_or_default(),
        );
        if let Some(stderr) = log["stderr"].as_str().filter(|s| !s.is_empty()) {
            println!("    {}", stderr.trim_end());
        }
    }
    Ok(())
}

pub async fn cancel(client: &ControlClient, id: &str) -> Result<(), ClientError> {
    let record: DeploymentRecord = client
        .post(&format!("/deployments/{id}/cancel"), &serde_json::json!({}))
        .await?;
    println!("Deployment {} is {}", record.data.id, record.status);
    Ok(())
}
