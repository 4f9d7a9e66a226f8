//! Stratus CLI - manage SLURM clusters through the control plane.

mod commands;

use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};
use stratus_control::scale::ScaleDirection;
use stratus_control::types::{DeploymentAction, NodeRole};

use commands::client::ControlClient;
use commands::deploy::DeployArgs;
use commands::scale::ScaleArgs;

#[derive(Parser)]
#[command(name = "stratus")]
#[command(about = "Deploy and scale SLURM clusters")]
#[command(version)]
struct Cli {
    /// Control plane URL
    #[arg(
        long,
        global = true,
        env = "STRATUS_SERVER",
        default_value = "http://localhost:8090"
    )]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage clusters
    Cluster {
        #[command(subcommand)]
        command: ClusterCommands,
    },

    /// Run an operation against a cluster
    Deploy {
        /// Cluster ID
        cluster: String,

        /// Operation (deploy, update, destroy, scale_up, scale_down)
        #[arg(short, long, default_value = "deploy")]
        action: DeploymentAction,

        /// Restrict to these nodes
        #[arg(short, long = "node")]
        nodes: Vec<String>,

        /// Maximum nodes installed at once
        #[arg(short, long)]
        parallelism: Option<usize>,

        /// Overall timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Bootstrap Salt agents over SSH when missing
        #[arg(long)]
        bootstrap_agent: bool,

        /// Only install and register the agent
        #[arg(long)]
        agent_only: bool,

        /// Follow progress until the deployment finishes
        #[arg(short, long)]
        watch: bool,
    },

    /// Show a deployment
    Status {
        /// Deployment ID
        deployment: String,
    },

    /// Follow a deployment's progress
    Watch {
        /// Deployment ID
        deployment: String,
    },

    /// Show SSH execution logs of a deployment
    Logs {
        /// Deployment ID
        deployment: String,

        /// Only this node ID
        #[arg(long)]
        node: Option<String>,

        /// Only this step (connect, download, install, configure, start, validate)
        #[arg(long)]
        step: Option<String>,
    },

    /// Check agent readiness of nodes
    Readiness {
        /// Cluster ID
        cluster: String,

        /// Node names
        #[arg(required = true)]
        nodes: Vec<String>,
    },

    /// Add or remove nodes, gated on agent readiness
    Scale {
        /// Cluster ID
        cluster: String,

        #[command(subcommand)]
        direction: ScaleCommands,
    },

    /// Cancel a deployment
    Cancel {
        /// Deployment ID
        deployment: String,
    },
}

#[derive(Subcommand)]
enum ClusterCommands {
    /// Register a cluster from a TOML definition
    Create {
        /// Path to the cluster definition
        file: PathBuf,
    },

    /// List clusters
    List,

    /// Show a cluster and its nodes
    Show {
        /// Cluster ID
        cluster: String,
    },
}

#[derive(Subcommand)]
enum ScaleCommands {
    /// Add nodes
    Up {
        /// Node names
        #[arg(required = true)]
        nodes: Vec<String>,

        /// Role of the new nodes
        #[arg(long)]
        role: Option<NodeRole>,

        /// Address of a new node, as NAME=HOST
        #[arg(long = "host", value_parser = parse_host)]
        hosts: Vec<(String, String)>,

        /// SSH port of the new nodes
        #[arg(long)]
        port: Option<u16>,

        /// Follow progress until the deployment finishes
        #[arg(short, long)]
        watch: bool,
    },

    /// Remove nodes
    Down {
        /// Node names
        #[arg(required = true)]
        nodes: Vec<String>,

        /// Follow progress until the deployment finishes
        #[arg(short, long)]
        watch: bool,
    },
}

fn parse_host(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, host)) if !name.is_empty() && !host.is_empty() => {
            Ok((name.to_owned(), host.to_owned()))
        }
        _ => Err(format!("expected NAME=HOST, got {value}")),
    }
}

async fn follow(client: &ControlClient, id: &str) -> anyhow::Result<()> {
    let status = commands::watch::run(client, id).await?;
    if status != "completed" {
        bail!("deployment {id} finished as {status}");
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = ControlClient::new(&cli.server);

    match cli.command {
        Commands::Cluster { command } => match command {
            ClusterCommands::Create { file } => commands::cluster::create(&client, &file).await?,
            ClusterCommands::List => commands::cluster::list(&client).await?,
            ClusterCommands::Show { cluster } => commands::cluster::show(&client, &cluster).await?,
        },
        Commands::Deploy {
            cluster,
            action,
            nodes,
            parallelism,
            timeout,
            bootstrap_agent,
            agent_only,
            watch,
        } => {
            let id = commands::deploy::run(
                &client,
                DeployArgs {
                    cluster,
                    action,
                    nodes,
                    parallelism,
                    timeout_secs: timeout,
                    bootstrap_agent,
                    agent_only,
                },
            )
            .await?;
            if watch {
                follow(&client, &id).await?;
            }
        }
        Commands::Status { deployment } => commands::deploy::status(&client, &deployment).await?,
        Commands::Watch { deployment } => follow(&client, &deployment).await?,
        Commands::Logs {
            deployment,
            node,
            step,
        } => {
            commands::deploy::logs(&client, &deployment, node.as_deref(), step.as_deref()).await?;
        }
        Commands::Readiness { cluster, nodes } => {
            if !commands::scale::readiness(&client, &cluster, nodes).await? {
                bail!("not every node is ready");
            }
        }
        Commands::Scale { cluster, direction } => {
            let (args, watch) = match direction {
                ScaleCommands::Up {
                    nodes,
                    role,
                    hosts,
                    port,
                    watch,
                } => (
                    ScaleArgs {
                        cluster,
                        direction: ScaleDirection::Up,
                        nodes,
                        role,
                        hosts,
                        port,
                    },
                    watch,
                ),
                ScaleCommands::Down {
                    nodes,
                    watch,
                } => (
                    ScaleArgs {
                        cluster,
                        direction: ScaleDirection::Down,
                        nodes,
                        role: None,
                        hosts: Vec::new(),
                        port: None,
                    },
                    watch,
                ),
            };
            let id = commands::scale::run(&client, args).await?;
            if watch {
                follow(&client, &id).await?;
            }
        }
        Commands::Cancel { deployment } => commands::deploy::cancel(&client, &deployment).await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
