//! Implementation of the `stratus cluster` commands.

use std::path::Path;

use stratus_control::deployment::CreateClusterRequest;
use stratus_control::types::Cluster;
use thiserror::Error;

use super::client::{ClientError, ControlClient};

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid cluster definition: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Register a cluster described by a TOML file.
pub async fn create(client: &ControlClient, file: &Path) -> Result<(), ClusterError> {
    let text = tokio::fs::read_to_string(file)
        .await
        .map_err(|source| ClusterError::Read {
            path: file.display().to_string(),
            source,
        })?;
    let request: CreateClusterRequest = toml::from_str(&text)?;
    let created: serde_json::Value = client.post("/clusters", &request).await?;

    println!(
        "Created cluster {} ({})",
        created["name"].as_str().unwrap_or_default(),
        created["id"].as_str().unwrap_or_default()
    );
    print_nodes(&created["nodes"]);
    Ok(())
}

pub async fn list(client: &ControlClient) -> Result<(), ClusterError> {
    let clusters: Vec<Cluster> = client.get("/clusters").await?;
    if clusters.is_empty() {
        println!("No clusters registered.");
        return Ok(());
    }
    println!("{:<28} {:<16} {:<12} MASTER", "ID", "NAME", "STATUS");
    for cluster in clusters {
        println!(
            "{:<28} {:<16} {:<12} {}:{}",
            cluster.id, cluster.name, cluster.status, cluster.master_host, cluster.master_port
        );
    }
    Ok(())
}

pub async fn show(client: &ControlClient, id: &str) -> Result<(), ClusterError> {
    let cluster: serde_json::Value = client.get(&format!("/clusters/{id}")).await?;
    println!("Cluster:     {}", cluster["name"].as_str().unwrap_or_default());
    println!("ID:          {}", cluster["id"].as_str().unwrap_or_default());
    println!("Status:      {}", cluster["status"].as_str().unwrap_or_default());
    println!("Salt master: {}", cluster["salt_master"].as_str().unwrap_or_default());
    println!();
    print_nodes(&cluster["nodes"]);
    Ok(())
}

fn print_nodes(nodes: &serde_json::Value) {
    let Some(nodes) = nodes.as_array() else {
        return;
    };
    println!("{:<16} {:<8} {:<22} {:<12}", "NODE", "ROLE", "ADDRESS", "STATUS");
    for node in nodes {
        println!(
            "{:<16} {:<8} {:<22} {:<12}",
            node["name"].as_str().unwrap_or_default(),
            node["role"].as_str().unwrap_or_default(),
            format!(
                "{}:{}",
                node["host"].as_str().unwrap_or_default(),
                node["port"]
            ),
            node["status"].as_str().unwrap_or_default(),
        );
    }
}
