//! Step bodies. Each returns a short summary recorded as the step output.

use tokio::time::Instant;
use tracing::{debug, info};

use super::{InstallJob, NodeInstaller, Plan, Run};
use crate::error::ControlResult;
use crate::salt::{Readiness, SaltError};
use crate::ssh::ExecContext;
use crate::types::{ClusterConfig, TaskType};

/// Turn a failed readiness check into the matching error.
fn not_ready(minion: &str, readiness: &Readiness) -> SaltError {
    match readiness.reason.as_deref() {
        Some("not registered") | None if !readiness.registered => {
            SaltError::Unregistered(minion.to_owned())
        }
        Some("offline") | None => SaltError::Offline(minion.to_owned()),
        Some(reason) => match reason.strip_prefix("config-management master unreachable: ") {
            Some(detail) => SaltError::MasterUnreachable(detail.to_owned()),
            None => SaltError::NotReady {
                minion: minion.to_owned(),
                reason: reason.to_owned(),
            },
        },
    }
}

/// Cluster configuration as rendered for a node: the controller host is
/// always set.
fn rendered_config(job: &InstallJob) -> ClusterConfig {
    let mut config = job.cluster.config.clone();
    config
        .settings
        .entry("SlurmctldHost".to_owned())
        .or_insert_with(|| job.cluster.master_host.clone());
    for package in &job.extra_packages {
        if !config.packages.contains(package) {
            config.packages.push(package.clone());
        }
    }
    config
}

impl NodeInstaller {
    /// SSH reachability check, then the agent readiness gate.
    pub(super) async fn connect(&self, run: &Run, context: &ExecContext) -> ControlResult<String> {
        let job = &run.job;
        let target = job.node.target();
        let reply = self
            .ssh
            .execute(&target, "hostname", None, context)
            .await?
            .into_success()?;
        let hostname = reply.stdout.trim().to_owned();

        if job.plan == Plan::Decommission {
            return Ok(format!("reachable as {hostname}"));
        }

        let minion = job.node.name.as_str();
        let readiness = self.salt.readiness(minion).await;
        if readiness.is_ready() {
            return Ok(format!("reachable as {hostname}; agent ready"));
        }

        let may_bootstrap = job.bootstrap_agent || job.task.task_type == TaskType::AgentInstall;
        if readiness.registered || !may_bootstrap {
            return Err(not_ready(minion, &readiness).into());
        }

        info!(node = %minion, "bootstrapping agent");
        let command = self
            .settings
            .salt
            .bootstrap_command_for(&job.cluster.salt_master, minion);
        self.ssh
            .execute(&target, &command, None, context)
            .await?
            .into_success()?;

        let deadline = Instant::now() + self.settings.agent_registration;
        let mut readiness = readiness;
        while Instant::now() < deadline {
            tokio::select! {
                () = tokio::time::sleep(self.settings.agent_poll) => {}
                () = run.signals.cancel.cancelled() => break,
            }
            readiness = self.salt.readiness(minion).await;
            if readiness.is_ready() {
                return Ok(format!("reachable as {hostname}; agent bootstrapped"));
            }
            debug!(node = %minion, reason = ?readiness.reason, "agent not ready yet");
        }

        Err(not_ready(minion, &readiness).into())
    }

    /// Stage workload-manager packages.
    pub(super) async fn download(
        &self,
        job: &InstallJob,
        context: &ExecContext,
    ) -> ControlResult<String> {
        let packages = rendered_config(job).required_packages(job.node.role);
        let command = self
            .settings
            .download_command
            .replace("{packages}", &packages.join(" "));
        self.ssh
            .execute(&job.node.target(), &command, None, context)
            .await?
            .into_success()?;
        Ok(format!("staged {} package(s)", packages.len()))
    }

    /// Apply the role's install state unless every package is present.
    pub(super) async fn install(&self, job: &InstallJob) -> ControlResult<String> {
        let minion = job.node.name.as_str();
        let config = rendered_config(job);

        let mut missing = Vec::new();
        for package in config.required_packages(job.node.role) {
            if !self.salt.check_package_installed(minion, &package).await? {
                missing.push(package);
            }
        }
        if missing.is_empty() {
            return Ok("packages already installed".to_owned());
        }

        debug!(node = %minion, missing = ?missing, "installing packages");
        Ok(self.salt.install_node(minion, job.node.role, &config).await?)
    }

    /// Render `slurm.conf` and partitions.
    pub(super) async fn configure(&self, job: &InstallJob) -> ControlResult<String> {
        let config = rendered_config(job);
        Ok(self
            .salt
            .configure_node(&job.node.name, job.node.role, &config)
            .await?)
    }

    /// Stop the role's daemon and apply the decommission state.
    pub(super) async fn decommission(&self, job: &InstallJob) -> ControlResult<String> {
        let minion = job.node.name.as_str();
        if let Some(daemon) = job.node.role.daemon() {
            self.salt.stop_service(minion, daemon).await?;
        }
        Ok(self
            .salt
            .decommission_node(minion, &rendered_config(job))
            .await?)
    }

    /// Start the role's daemon.
    pub(super) async fn start(&self, job: &InstallJob) -> ControlResult<String> {
        match job.node.role.daemon() {
            Some(daemon) => {
                self.salt.start_service(&job.node.name, daemon).await?;
                Ok(format!("{daemon} started"))
            }
            None => Ok(format!("no daemon for {} nodes", job.node.role)),
        }
    }

    /// Agent answers and the role's daemon is active.
    pub(super) async fn validate(
        &self,
        job: &InstallJob,
        context: &ExecContext,
    ) -> ControlResult<String> {
        let version = self.salt.agent_version(&job.node.name).await?;
        match job.node.role.daemon() {
            Some(daemon) => {
                self.ssh
                    .execute(
                        &job.node.target(),
                        &format!("systemctl is-active --quiet {daemon}"),
                        None,
                        context,
                    )
                    .await?
                    .into_success()?;
                Ok(format!("agent {version}; {daemon} active"))
            }
            None => Ok(format!("agent {version}")),
        }
    }

    /// Agent answers.
    pub(super) async fn validate_agent(&self, job: &InstallJob) -> ControlResult<String> {
        let version = self.salt.agent_version(&job.node.name).await?;
        Ok(format!("agent {version}"))
    }

    /// The role's daemon is no longer running.
    pub(super) async fn validate_removed(
        &self,
        job: &InstallJob,
        context: &ExecContext,
    ) -> ControlResult<String> {
        let Some(daemon) = job.node.role.daemon() else {
            return Ok("nothing to stop".to_owned());
        };
        self.ssh
            .execute(
                &job.node.target(),
                &format!("! systemctl is-active --quiet {daemon}"),
                None,
                context,
            )
            .await?
            .into_success()?;
        Ok(format!("{daemon} inactive"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_reasons_map_to_errors() {
        let unregistered = Readiness {
            registered: false,
            online: false,
            version: None,
            reason: Some("not registered".to_owned()),
        };
        assert_eq!(not_ready("c1", &unregistered).category(), "unregistered");

        let offline = Readiness {
            registered: true,
            reason: Some("offline".to_owned()),
            ..unregistered.clone()
        };
        assert_eq!(not_ready("c1", &offline).category(), "offline");

        let master = Readiness {
            reason: Some("config-management master unreachable: refused".to_owned()),
            ..unregistered.clone()
        };
        let err = not_ready("c1", &master);
        assert_eq!(err.category(), "master_unreachable");
        assert_eq!(
            err.to_string(),
            "config-management master unreachable: refused"
        );

        let rejected = Readiness {
            reason: Some("salt-api authentication failed: bad token".to_owned()),
            ..unregistered
        };
        let err = not_ready("c1", &rejected);
        assert_eq!(err.category(), "not_ready");
        assert_eq!(
            err.to_string(),
            "minion c1 is not ready: salt-api authentication failed: bad token"
        );
    }
}
