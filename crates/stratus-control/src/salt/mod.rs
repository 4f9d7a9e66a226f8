//! Configuration-management client.
//!
//! Nodes are configured through a Salt master. [`ConfigManagement`] is the
//! seam the installer pipeline and the scale gate talk to; [`SaltApiClient`]
//! drives a real `salt-api`, [`MockConfigManagement`] backs tests and the
//! `mock` salt mode.

mod client;

pub use client::SaltApiClient;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{ClusterConfig, NodeRole};

/// Result type alias using [`SaltError`].
pub type SaltResult<T> = Result<T, SaltError>;

/// Errors from configuration-management operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SaltError {
    /// The Salt master (or `salt-api`) could not be reached.
    #[error("config-management master unreachable: {0}")]
    MasterUnreachable(String),

    /// The minion key has not been accepted.
    #[error("minion {0} is not registered")]
    Unregistered(String),

    /// The minion did not answer.
    #[error("minion {0} is offline")]
    Offline(String),

    /// A remote function or state failed.
    #[error("{operation} failed on {minion}: {message}")]
    CommandFailed {
        /// Target minion.
        minion: String,
        /// Function or state that failed.
        operation: String,
        /// Failure detail.
        message: String,
    },

    /// Authentication against `salt-api` failed.
    #[error("salt-api authentication failed: {0}")]
    Auth(String),

    /// `salt-api` returned something unexpected.
    #[error("unexpected salt-api response: {0}")]
    Protocol(String),

    /// The request exceeded its time limit.
    #[error("salt request timed out after {0:?}")]
    Timeout(Duration),

    /// A readiness check failed for a reason without its own variant.
    #[error("minion {minion} is not ready: {reason}")]
    NotReady {
        /// Target minion.
        minion: String,
        /// Reason reported by the readiness check.
        reason: String,
    },
}

impl SaltError {
    /// Stable category name, used in logs and readiness reasons.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::MasterUnreachable(_) => "master_unreachable",
            Self::Unregistered(_) => "unregistered",
            Self::Offline(_) => "offline",
            Self::CommandFailed { .. } => "command_failed",
            Self::Auth(_) => "auth",
            Self::Protocol(_) => "protocol",
            Self::Timeout(_) => "timeout",
            Self::NotReady { .. } => "not_ready",
        }
    }

    /// Create a command failure.
    #[must_use]
    pub fn command_failed(
        minion: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            minion: minion.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Agent readiness of one minion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    /// The minion key is accepted.
    pub registered: bool,
    /// The minion answered a ping.
    pub online: bool,
    /// Agent version, when online.
    pub version: Option<String>,
    /// Why the minion is not ready.
    pub reason: Option<String>,
}

impl Readiness {
    /// Registered and online.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.registered && self.online
    }

    fn not_ready(registered: bool, reason: impl Into<String>) -> Self {
        Self {
            registered,
            online: false,
            version: None,
            reason: Some(reason.into()),
        }
    }
}

/// Pillar data passed to install and configure states.
#[must_use]
pub fn slurm_pillar(role: NodeRole, config: &ClusterConfig) -> serde_json::Value {
    serde_json::json!({
        "slurm": {
            "role": role.as_str(),
            "version": config.slurm_version,
            "packages": config.required_packages(role),
            "partitions": config.partitions,
            "settings": config.settings,
        }
    })
}

/// Operations on configuration-management agents.
#[async_trait]
pub trait ConfigManagement: Send + Sync {
    /// Whether the minion key is accepted by the master.
    async fn is_client_accepted(&self, minion: &str) -> SaltResult<bool>;

    /// Whether the minion answers a ping.
    async fn ping(&self, minion: &str) -> SaltResult<bool>;

    /// Version of the agent running on the minion.
    async fn agent_version(&self, minion: &str) -> SaltResult<String>;

    /// Whether a package is installed on the minion.
    async fn check_package_installed(&self, minion: &str, package: &str) -> SaltResult<bool>;

    /// Apply the role's install state. Returns a summary of the run.
    async fn install_node(
        &self,
        minion: &str,
        role: NodeRole,
        config: &ClusterConfig,
    ) -> SaltResult<String>;

    /// Apply the role's configuration state. Returns a summary of the run.
    async fn configure_node(
        &self,
        minion: &str,
        role: NodeRole,
        config: &ClusterConfig,
    ) -> SaltResult<String>;

    /// Start and enable a service.
    async fn start_service(&self, minion: &str, service: &str) -> SaltResult<()>;

    /// Stop and disable a service.
    async fn stop_service(&self, minion: &str, service: &str) -> SaltResult<()>;

    /// Apply the decommission state.
    async fn decommission_node(&self, minion: &str, config: &ClusterConfig)
        -> SaltResult<String>;

    /// Registered-and-online check with a human-readable reason on failure.
    async fn readiness(&self, minion: &str) -> Readiness {
        match self.is_client_accepted(minion).await {
            Ok(true) => {}
            Ok(false) | Err(SaltError::Unregistered(_)) => {
                return Readiness::not_ready(false, "not registered");
            }
            Err(e) => return Readiness::not_ready(false, e.to_string()),
        }

        match self.ping(minion).await {
            Ok(true) => {}
            Ok(false) | Err(SaltError::Offline(_) | SaltError::Timeout(_)) => {
                return Readiness::not_ready(true, "offline");
            }
            Err(e) => return Readiness::not_ready(true, e.to_string()),
        }

        Readiness {
            registered: true,
            online: true,
            version: self.agent_version(minion).await.ok(),
            reason: None,
        }
    }
}

// =============================================================================
// Mock backend
// =============================================================================

/// Operations [`MockConfigManagement`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    /// `install_node`.
    Install,
    /// `configure_node`.
    Configure,
    /// `start_service`.
    StartService,
    /// `stop_service`.
    StopService,
    /// `decommission_node`.
    Decommission,
    /// `agent_version`.
    Version,
}

#[derive(Debug, Default)]
struct MinionState {
    accepted: bool,
    online: bool,
    accept_after: Option<usize>,
    packages: HashSet<String>,
    running: HashSet<String>,
}

#[derive(Debug, Default)]
struct MockState {
    minions: HashMap<String, MinionState>,
    failures: HashMap<(MockOp, String), usize>,
    calls: Vec<String>,
}

/// In-memory configuration-management backend.
///
/// Unknown minions are unregistered unless the backend is permissive.
#[derive(Debug, Default)]
pub struct MockConfigManagement {
    state: Mutex<MockState>,
    permissive: bool,
    master_down: AtomicBool,
}

/// Agent version reported by the mock backend.
pub const MOCK_AGENT_VERSION: &str = "3006.9";

impl MockConfigManagement {
    /// A backend where no minion is registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend where every minion is registered and online.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            permissive: true,
            ..Self::default()
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Register a minion and mark it online.
    pub fn register(&self, minion: &str) {
        self.with_state(|s| {
            let m = s.minions.entry(minion.to_owned()).or_default();
            m.accepted = true;
            m.online = true;
        });
    }

    /// Register a minion that does not answer pings.
    pub fn register_offline(&self, minion: &str) {
        self.with_state(|s| {
            let m = s.minions.entry(minion.to_owned()).or_default();
            m.accepted = true;
            m.online = false;
        });
    }

    /// Make a minion register (and come online) after `checks` acceptance
    /// checks have reported it missing.
    pub fn register_after(&self, minion: &str, checks: usize) {
        self.with_state(|s| {
            let m = s.minions.entry(minion.to_owned()).or_default();
            m.accepted = false;
            m.accept_after = Some(checks);
        });
    }

    /// Pre-install a package on a minion.
    pub fn install_package(&self, minion: &str, package: &str) {
        self.with_state(|s| {
            s.minions
                .entry(minion.to_owned())
                .or_default()
                .packages
                .insert(package.to_owned());
        });
    }

    /// Fail the next `times` calls of `op` against `minion`.
    pub fn fail_next(&self, op: MockOp, minion: &str, times: usize) {
        self.with_state(|s| {
            s.failures.insert((op, minion.to_owned()), times);
        });
    }

    /// Simulate the master going away.
    pub fn set_master_reachable(&self, reachable: bool) {
        self.master_down.store(!reachable, Ordering::SeqCst);
    }

    /// Whether a service is running on a minion.
    #[must_use]
    pub fn is_running(&self, minion: &str, service: &str) -> bool {
        self.with_state(|s| {
            s.minions
                .get(minion)
                .is_some_and(|m| m.running.contains(service))
        })
    }

    /// Every mutating call made so far, as `"<op> <minion>"`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.with_state(|s| s.calls.clone())
    }

    fn check_master(&self) -> SaltResult<()> {
        if self.master_down.load(Ordering::SeqCst) {
            Err(SaltError::MasterUnreachable("connection refused".to_owned()))
        } else {
            Ok(())
        }
    }

    /// Record a call, fail if scripted, and require the minion to be up.
    fn mutate<T>(
        &self,
        op: MockOp,
        minion: &str,
        f: impl FnOnce(&mut MinionState) -> T,
    ) -> SaltResult<T> {
        self.check_master()?;
        let permissive = self.permissive;
        self.with_state(|s| {
            s.calls.push(format!("{op:?} {minion}").to_lowercase());

            if let Some(remaining) = s.failures.get_mut(&(op, minion.to_owned())) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SaltError::command_failed(
                        minion,
                        format!("{op:?}").to_lowercase(),
                        "scripted failure",
                    ));
                }
            }

            let m = s.minions.entry(minion.to_owned()).or_default();
            if permissive {
                m.accepted = true;
                m.online = true;
            }
            if !m.accepted {
                return Err(SaltError::Unregistered(minion.to_owned()));
            }
            if !m.online {
                return Err(SaltError::Offline(minion.to_owned()));
            }
            Ok(f(m))
        })
    }
}

#[async_trait]
impl ConfigManagement for MockConfigManagement {
    async fn is_client_accepted(&self, minion: &str) -> SaltResult<bool> {
        self.check_master()?;
        if self.permissive {
            return Ok(true);
        }
        Ok(self.with_state(|s| {
            let Some(m) = s.minions.get_mut(minion) else {
                return false;
            };
            if let Some(remaining) = m.accept_after.as_mut() {
                if *remaining == 0 {
                    m.accepted = true;
                    m.online = true;
                    m.accept_after = None;
                } else {
                    *remaining -= 1;
                }
            }
            m.accepted
        }))
    }

    async fn ping(&self, minion: &str) -> SaltResult<bool> {
        self.check_master()?;
        if self.permissive {
            return Ok(true);
        }
        Ok(self.with_state(|s| s.minions.get(minion).is_some_and(|m| m.accepted && m.online)))
    }

    async fn agent_version(&self, minion: &str) -> SaltResult<String> {
        self.mutate(MockOp::Version, minion, |_| MOCK_AGENT_VERSION.to_owned())
    }

    async fn check_package_installed(&self, minion: &str, package: &str) -> SaltResult<bool> {
        self.check_master()?;
        Ok(self.with_state(|s| {
            s.minions
                .get(minion)
                .is_some_and(|m| m.packages.contains(package))
        }))
    }

    async fn install_node(
        &self,
        minion: &str,
        role: NodeRole,
        config: &ClusterConfig,
    ) -> SaltResult<String> {
        let packages = config.required_packages(role);
        self.mutate(MockOp::Install, minion, |m| {
            m.packages.extend(packages.iter().cloned());
            format!("installed {} package(s)", packages.len())
        })
    }

    async fn configure_node(
        &self,
        minion: &str,
        role: NodeRole,
        config: &ClusterConfig,
    ) -> SaltResult<String> {
        let partitions = config.partitions.len();
        self.mutate(MockOp::Configure, minion, |_| {
            format!("configured {role} with {partitions} partition(s)")
        })
    }

    async fn start_service(&self, minion: &str, service: &str) -> SaltResult<()> {
        self.mutate(MockOp::StartService, minion, |m| {
            m.running.insert(service.to_owned());
        })
    }

    async fn stop_service(&self, minion: &str, service: &str) -> SaltResult<()> {
        self.mutate(MockOp::StopService, minion, |m| {
            m.running.remove(service);
        })
    }

    async fn decommission_node(
        &self,
        minion: &str,
        _config: &ClusterConfig,
    ) -> SaltResult<String> {
        self.mutate(MockOp::Decommission, minion, |m| {
            m.running.clear();
            "decommissioned".to_owned()
        })
    }
}
