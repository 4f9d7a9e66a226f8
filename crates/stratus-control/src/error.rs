//! Error types for stratus-control.

use crate::salt::SaltError;
use crate::ssh::SshError;

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// A node that failed a readiness check, with the reason it failed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeFailure {
    /// Node (minion) name.
    pub node: String,
    /// Human-readable reason.
    pub reason: String,
}

/// Errors that can occur in the control plane.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The request is malformed or violates a precondition.
    #[error("validation error: {0}")]
    Validation(String),

    /// Cluster not found.
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    /// Node not found.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// Deployment not found.
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    /// Another deployment is still running against the cluster.
    #[error("cluster {cluster} already has deployment {deployment} in progress")]
    DeploymentInProgress {
        /// Cluster identifier.
        cluster: String,
        /// The non-terminal deployment.
        deployment: String,
    },

    /// Invalid state transition attempted.
    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: &'static str,
        /// Attempted target state.
        to: &'static str,
    },

    /// One or more nodes failed the scale readiness gate.
    #[error("{} node(s) not ready: {}", failed.len(), format_failures(failed))]
    NodesNotReady {
        /// Every failing node with its reason.
        failed: Vec<NodeFailure>,
    },

    /// Remote command execution failed.
    #[error(transparent)]
    Ssh(#[from] SshError),

    /// Configuration-management operation failed.
    #[error(transparent)]
    Salt(#[from] SaltError),

    /// A deployment exceeded its overall time budget.
    #[error("deployment timed out after {0}s")]
    Timeout(u64),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a validation error.
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error represents a timeout rather than an explicit failure.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Ssh(SshError::Timeout { .. }) | Self::Salt(SaltError::Timeout(_))
        )
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialisation(e.to_string())
    }
}

fn format_failures(failed: &[NodeFailure]) -> String {
    failed
        .iter()
        .map(|f| format!("{} ({})", f.node, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn not_ready_lists_every_node() {
        let err = ControlError::NodesNotReady {
            failed: vec![
                NodeFailure {
                    node: "c3".to_owned(),
                    reason: "not registered".to_owned(),
                },
                NodeFailure {
                    node: "c4".to_owned(),
                    reason: "offline".to_owned(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 node(s) not ready"));
        assert!(msg.contains("c3 (not registered)"));
        assert!(msg.contains("c4 (offline)"));
    }

    #[test]
    fn timeouts_are_distinguished() {
        assert!(ControlError::Timeout(60).is_timeout());
        assert!(ControlError::Ssh(SshError::Timeout {
            limit: Duration::from_secs(5)
        })
        .is_timeout());
        assert!(!ControlError::validation("bad").is_timeout());
    }
}
