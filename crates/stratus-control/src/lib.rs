//! Stratus control plane
//!
//! This crate deploys and scales SLURM clusters on machines it reaches over
//! SSH, with Salt agents doing package and configuration work on each node.
//!
//! # Architecture
//!
//! The control plane is responsible for:
//!
//! - **Cluster registry**: clusters, their nodes and every deployment, task
//!   and step, persisted in a [`ClusterStore`]
//! - **Deployment orchestration**: fanning a per-node installer pipeline out
//!   over the target nodes with bounded concurrency, an overall deadline and
//!   cancellation
//! - **Progress**: an in-process [`DeploymentTracker`] holding live snapshots,
//!   served to clients as server-sent events
//! - **Scale gate**: refusing to scale unless every target node's agent is
//!   registered and online
//! - **API surface**: HTTP endpoints for all of the above
//!
//! # State Machine
//!
//! Deployments follow a strict state machine enforced at compile time using
//! the typestate pattern:
//!
//! ```text
//! Pending ──▶ Running ──▶ Completed
//!    │           │
//!    ▼           ├──▶ Failed
//! Cancelled ◀────┤
//!                └──▶ TimedOut
//! ```
//!
//! # Example
//!
//! ```ignore
//! use stratus_control::{
//!     Deployment, Pending,
//!     types::{ClusterId, DeploymentAction, DeploymentData, DeploymentOptions},
//! };
//!
//! let data = DeploymentData::new(
//!     ClusterId::new("01J..."),
//!     DeploymentAction::Deploy,
//!     DeploymentOptions::default(),
//! );
//!
//! let pending = Deployment::<Pending>::create(data);
//! let running = pending.start();
//!
//! // This would not compile:
//! // let invalid = running.start(); // Error!
//! ```

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod api;
pub mod config;
pub mod deployment;
pub mod error;
pub mod pipeline;
pub mod salt;
pub mod scale;
pub mod service;
pub mod ssh;
pub mod state;
pub mod store;
pub mod stream;
pub mod tracker;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export commonly used types at the crate root
pub use config::ControlConfig;
pub use deployment::DeploymentManager;
pub use error::{ControlError, ControlResult};
pub use scale::ScaleGate;
pub use service::ControlService;
pub use state::{
    AnyDeployment, Cancelled, Completed, Deployment, DeploymentState, Failed, Pending, Running,
    TimedOut,
};
pub use store::{ClusterStore, DeploymentFilter, MemoryStore, PostgresStore};
pub use stream::ProgressStreamer;
pub use tracker::DeploymentTracker;
