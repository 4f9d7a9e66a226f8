//! Implementation of the `stratus scale` and `stratus readiness` commands.

use std::collections::BTreeMap;

use stratus_control::api::AcceptedResponse;
use stratus_control::scale::{ReadinessReport, ReadinessRequest, ScaleDirection, ScaleRequest};
use stratus_control::types::{DeploymentOptions, NodeRole};

use super::client::{ClientError, ControlClient};

pub async fn readiness(
    client: &ControlClient,
    cluster: &str,
    nodes: Vec<String>,
) -> Result<bool, ClientError> {
    let report: ReadinessReport = client
        .post(
            &format!("/clusters/{cluster}/scale/readiness"),
            &ReadinessRequest { node_names: nodes },
        )
        .await?;
    println!("{:<16} {:<6} {:<12}  REASON", "NODE", "READY", "VERSION");
    for node in &report.nodes {
        println!(
            "{:<16} {:<6} {:<12}  {}",
            node.name,
            if node.ready { "yes" } else { "no" },
            node.version.as_deref().unwrap_or("-"),
            node.reason.as_deref().unwrap_or_default(),
        );
    }
    println!("{} of {} nodes ready", report.ready, report.total);
    Ok(report.all_ready())
}

/// Arguments for `stratus scale`.
pub struct ScaleArgs {
    pub cluster: String,
    pub direction: ScaleDirection,
    pub nodes: Vec<String>,
    pub role: Option<NodeRole>,
    pub hosts: Vec<(String, String)>,
    pub port: Option<u16>,
}

pub async fn run(client: &ControlClient, args: ScaleArgs) -> Result<String, ClientError> {
    let request = ScaleRequest {
        direction: args.direction,
        node_names: args.nodes,
        role: args.role,
        hosts: args.hosts.into_iter().collect::<BTreeMap<_, _>>(),
        port: args.port,
        credentials: None,
        options: DeploymentOptions::default(),
    };
    match client
        .post::<_, AcceptedResponse>(&format!("/clusters/{}/scale", args.cluster), &request)
        .await
    {
        Ok(accepted) => {
            println!("Scale deployment {} accepted", accepted.deployment_id);
            Ok(accepted.deployment_id.to_string())
        }
        Err(ClientError::Api {
            status,
            message,
            failed_nodes,
        }) if !failed_nodes.is_empty() => {
            println!("Scale rejected, nodes not ready:");
            for node in &failed_nodes {
                println!("  {}: {}", node.node, node.reason);
            }
            Err(ClientError::Api {
                status,
                message,
                failed_nodes,
            })
        }
        Err(e) => Err(e),
    }
}
