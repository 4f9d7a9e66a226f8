//! Deployment orchestration.
//!
//! [`DeploymentManager`] validates requests, persists the deployment and its
//! tasks atomically and hands the fan-out to a background coordinator. The
//! coordinator is the only writer of deployment-level fields; it recomputes
//! them from committed task state every time a pipeline reports progress.

mod coordinator;
mod manager;

pub use manager::{
    ClusterDetail, CreateClusterRequest, DeploymentDetail, DeploymentLogs, DeploymentManager,
    DeploymentRequest, LogQuery,
};
pub(crate) use manager::select_targets;
