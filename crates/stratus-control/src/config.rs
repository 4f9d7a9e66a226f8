//! Configuration for stratus-control.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ControlError, ControlResult};

const ENV_PREFIX: &str = "STRATUS_CONTROL_";

/// Top-level configuration for the control service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Salt client configuration.
    #[serde(default)]
    pub salt: SaltConfig,

    /// SSH execution configuration.
    #[serde(default)]
    pub ssh: SshConfig,

    /// Deployment behaviour configuration.
    #[serde(default)]
    pub deployment: DeploymentConfig,

    /// Progress stream configuration.
    #[serde(default)]
    pub stream: StreamConfig,
}

impl ControlConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `control.toml` in the current directory (if present)
    /// 3. Environment variables with `STRATUS_CONTROL_` prefix
    pub fn load() -> ControlResult<Self> {
        Self::from_file("control.toml")
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Request timeout in seconds. Does not apply to progress streams.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

const fn default_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8090)
}

const fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_database_url() -> String {
    "postgres://localhost/stratus".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_min_connections() -> u32 {
    1
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Which configuration-management backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaltMode {
    /// Talk to a real `salt-api`.
    #[default]
    Api,

    /// In-memory backend where every minion is registered and online.
    Mock,
}

/// Salt client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SaltConfig {
    /// Backend selection.
    #[serde(default)]
    pub mode: SaltMode,

    /// Base URL of `salt-api`.
    #[serde(default = "default_salt_url")]
    pub url: String,

    /// Username for `/login`.
    #[serde(default = "default_salt_username")]
    pub username: String,

    /// Password for `/login`.
    #[serde(
        default = "default_salt_password",
        deserialize_with = "deserialize_secret"
    )]
    pub password: SecretString,

    /// External authentication backend.
    #[serde(default = "default_eauth")]
    pub eauth: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_salt_timeout_secs")]
    pub timeout_secs: u64,

    /// Address agents are pointed at when bootstrapped.
    #[serde(default = "default_master_address")]
    pub master_address: String,

    /// Salt states applied per step.
    #[serde(default)]
    pub states: SaltStates,

    /// Shell command used to bootstrap an agent. `{master}` and `{minion}`
    /// are substituted.
    #[serde(default = "default_bootstrap_command")]
    pub bootstrap_command: String,
}

fn default_salt_url() -> String {
    "http://localhost:8000".to_owned()
}

fn default_salt_username() -> String {
    "salt".to_owned()
}

fn default_salt_password() -> SecretString {
    SecretString::from(String::new())
}

fn deserialize_secret<'de, D: Deserializer<'de>>(d: D) -> Result<SecretString, D::Error> {
    String::deserialize(d).map(SecretString::from)
}

fn default_eauth() -> String {
    "pam".to_owned()
}

const fn default_salt_timeout_secs() -> u64 {
    120
}

fn default_master_address() -> String {
    "salt".to_owned()
}

fn default_bootstrap_command() -> String {
    "curl -fsSL https://bootstrap.saltproject.io -o /tmp/bootstrap-salt.sh \
     && sh /tmp/bootstrap-salt.sh -A {master} -i {minion} stable"
        .to_owned()
}

impl SaltConfig {
    /// Per-request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Render the bootstrap command for a minion. An empty `master` falls
    /// back to `master_address`.
    #[must_use]
    pub fn bootstrap_command_for(&self, master: &str, minion: &str) -> String {
        let master = if master.is_empty() {
            self.master_address.as_str()
        } else {
            master
        };
        self.bootstrap_command
            .replace("{master}", master)
            .replace("{minion}", minion)
    }
}

impl Default for SaltConfig {
    fn default() -> Self {
        Self {
            mode: SaltMode::default(),
            url: default_salt_url(),
            username: default_salt_username(),
            password: default_salt_password(),
            eauth: default_eauth(),
            timeout_secs: default_salt_timeout_secs(),
            master_address: default_master_address(),
            states: SaltStates::default(),
            bootstrap_command: default_bootstrap_command(),
        }
    }
}

/// Salt state names applied by the pipeline.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SaltStates {
    /// Package installation state; the role is appended (`slurm.install.compute`).
    #[serde(default = "default_install_state")]
    pub install: String,

    /// Configuration state; the role is appended.
    #[serde(default = "default_configure_state")]
    pub configure: String,

    /// Decommission state.
    #[serde(default = "default_decommission_state")]
    pub decommission: String,
}

fn default_install_state() -> String {
    "slurm.install".to_owned()
}

fn default_configure_state() -> String {
    "slurm.config".to_owned()
}

fn default_decommission_state() -> String {
    "slurm.decommission".to_owned()
}

impl Default for SaltStates {
    fn default() -> Self {
        Self {
            install: default_install_state(),
            configure: default_configure_state(),
            decommission: default_decommission_state(),
        }
    }
}

/// How the SSH client treats unknown host keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Reject hosts not in `known_hosts`.
    Strict,

    /// Record new host keys, reject changed ones.
    #[default]
    AcceptNew,

    /// Accept any key.
    Off,
}

/// SSH execution configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// Connect and handshake timeout in seconds.
    #[serde(default = "default_ssh_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Default per-command timeout in seconds.
    #[serde(default = "default_ssh_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Host key policy.
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,

    /// `known_hosts` file to check and record host keys in. Defaults to
    /// `~/.ssh/known_hosts` of the service user.
    #[serde(default)]
    pub known_hosts: Option<PathBuf>,

    /// Command used to stage packages during the download step. `{packages}`
    /// is substituted with a space-separated list.
    #[serde(default = "default_download_command")]
    pub download_command: String,
}

const fn default_ssh_connect_timeout_secs() -> u64 {
    10
}

const fn default_ssh_command_timeout_secs() -> u64 {
    300
}

fn default_download_command() -> String {
    "if command -v dnf >/dev/null; then dnf -y install --downloadonly {packages}; \
     else apt-get -y -d install {packages}; fi"
        .to_owned()
}

impl SshConfig {
    /// Connect and handshake timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Default per-command timeout.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_ssh_connect_timeout_secs(),
            command_timeout_secs: default_ssh_command_timeout_secs(),
            host_key_policy: HostKeyPolicy::default(),
            known_hosts: None,
            download_command: default_download_command(),
        }
    }
}

/// Retry policy for pipeline steps.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff interval in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on a single backoff interval in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Interval growth factor.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

const fn default_max_retries() -> u32 {
    2
}

const fn default_initial_backoff_ms() -> u64 {
    1_000
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_multiplier() -> f64 {
    2.0
}

impl RetryConfig {
    /// Backoff policy for one step. Attempts are bounded by `max_retries`,
    /// not elapsed time.
    #[must_use]
    pub fn backoff(&self) -> backoff::ExponentialBackoff {
        let initial = Duration::from_millis(self.initial_backoff_ms);
        backoff::ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            multiplier: self.multiplier,
            max_interval: Duration::from_millis(self.max_backoff_ms),
            max_elapsed_time: None,
            ..backoff::ExponentialBackoff::default()
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// Deployment behaviour configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentConfig {
    /// Maximum node pipelines running at once per deployment.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Overall ceiling for one deployment in seconds.
    #[serde(default = "default_deployment_timeout_secs")]
    pub timeout_secs: u64,

    /// How long finished deployments stay in the tracker, in seconds.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// How long to wait for a bootstrapped agent to register, in seconds.
    #[serde(default = "default_agent_registration_secs")]
    pub agent_registration_secs: u64,

    /// Interval between registration polls, in milliseconds.
    #[serde(default = "default_agent_poll_ms")]
    pub agent_poll_ms: u64,

    /// Step retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
}

const fn default_parallelism() -> usize {
    4
}

const fn default_deployment_timeout_secs() -> u64 {
    3_600
}

const fn default_retention_secs() -> u64 {
    600
}

const fn default_agent_registration_secs() -> u64 {
    120
}

const fn default_agent_poll_ms() -> u64 {
    2_000
}

impl DeploymentConfig {
    /// How long finished deployments stay in the tracker.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Overall ceiling for one deployment.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// How long to wait for a bootstrapped agent to register.
    #[must_use]
    pub const fn agent_registration(&self) -> Duration {
        Duration::from_secs(self.agent_registration_secs)
    }

    /// Interval between registration polls.
    #[must_use]
    pub const fn agent_poll(&self) -> Duration {
        Duration::from_millis(self.agent_poll_ms)
    }
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            timeout_secs: default_deployment_timeout_secs(),
            retention_secs: default_retention_secs(),
            agent_registration_secs: default_agent_registration_secs(),
            agent_poll_ms: default_agent_poll_ms(),
            retry: RetryConfig::default(),
        }
    }
}

/// Progress stream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Snapshot interval in milliseconds.
    #[serde(default = "default_stream_interval_ms")]
    pub interval_ms: u64,
}

const fn default_stream_interval_ms() -> u64 {
    2_000
}

impl StreamConfig {
    /// Snapshot interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_stream_interval_ms(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn default_config_is_valid() {
        let config = ControlConfig::default();
        assert_eq!(config.server.listen.port(), 8090);
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.salt.mode, SaltMode::Api);
        assert_eq!(config.deployment.parallelism, 4);
        assert_eq!(config.deployment.retry.max_retries, 2);
        assert_eq!(config.stream.interval(), Duration::from_secs(2));
    }

    #[test]
    fn config_from_toml() {
        let toml = r#"
            [server]
            listen = "127.0.0.1:9000"

            [database]
            url = "postgres://user:pass@db:5432/hpc"
            max_connections = 20

            [salt]
            mode = "mock"
            password = "hunter2"

            [salt.states]
            install = "hpc.install"

            [ssh]
            host_key_policy = "strict"
            known_hosts = "/etc/stratus/known_hosts"

            [deployment]
            parallelism = 8

            [deployment.retry]
            max_retries = 5
        "#;

        let config: ControlConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen.port(), 9000);
        assert_eq!(config.database.url, "postgres://user:pass@db:5432/hpc");
        assert_eq!(config.salt.mode, SaltMode::Mock);
        assert_eq!(config.salt.password.expose_secret(), "hunter2");
        assert_eq!(config.salt.states.install, "hpc.install");
        assert_eq!(config.salt.states.configure, "slurm.config");
        assert_eq!(config.ssh.host_key_policy, HostKeyPolicy::Strict);
        assert_eq!(
            config.ssh.known_hosts.as_deref(),
            Some(std::path::Path::new("/etc/stratus/known_hosts"))
        );
        assert_eq!(config.ssh.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.deployment.parallelism, 8);
        assert_eq!(config.deployment.retry.max_retries, 5);
        assert_eq!(config.deployment.retry.initial_backoff_ms, 1_000);
    }

    #[test]
    fn bootstrap_command_substitutes_names() {
        let config = SaltConfig {
            master_address: "10.0.0.1".to_owned(),
            bootstrap_command: "install -A {master} -i {minion}".to_owned(),
            ..SaltConfig::default()
        };
        assert_eq!(
            config.bootstrap_command_for("", "c1"),
            "install -A 10.0.0.1 -i c1"
        );
        assert_eq!(
            config.bootstrap_command_for("salt.internal", "c1"),
            "install -A salt.internal -i c1"
        );
    }
}
