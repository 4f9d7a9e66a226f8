//! Stratus control service binary.
//!
//! Runs the control plane for deploying and scaling SLURM clusters.

use tracing::info;
use tracing_subscriber::EnvFilter;

use stratus_control::{ControlConfig, ControlService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("stratus_control=info".parse()?),
        )
        .init();

    info!("Stratus control service starting");

    let config = ControlConfig::load().unwrap_or_else(|e| {
        info!(error = %e, "failed to load config, using defaults");
        ControlConfig::default()
    });

    info!(
        listen_addr = %config.server.listen,
        salt_mode = ?config.salt.mode,
        parallelism = config.deployment.parallelism,
        "configuration loaded"
    );

    ControlService::new(config).run().await?;
    Ok(())
}
