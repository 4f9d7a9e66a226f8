//! Transport backed by an in-process SSH client.
//!
//! Each command opens its own session: connect, verify the host key,
//! authenticate, exec on one channel, then disconnect.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::agent::client::AgentClient;
use russh_keys::key::PublicKey;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{RawOutput, RemoteShell, SshAuth, SshError, SshResult, SshTarget};
use crate::config::{HostKeyPolicy, SshConfig};

/// Reported when the channel closes without an exit status, e.g. the remote
/// process was killed by a signal.
const NO_EXIT_STATUS: i32 = -1;

/// Extended data stream carrying stderr.
const STDERR_STREAM: u32 = 1;

/// Identity files tried, in order, when no agent is reachable.
const DEFAULT_IDENTITIES: [&str; 3] = ["id_ed25519", "id_ecdsa", "id_rsa"];

/// What to do with a server key after the `known_hosts` lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Accept,
    Learn,
    Reject,
}

fn verdict(policy: HostKeyPolicy, lookup: &Result<bool, russh_keys::Error>) -> Verdict {
    match (policy, lookup) {
        (HostKeyPolicy::Off, _) | (_, Ok(true)) => Verdict::Accept,
        (HostKeyPolicy::AcceptNew, Ok(false)) => Verdict::Learn,
        (HostKeyPolicy::Strict, Ok(false)) | (_, Err(_)) => Verdict::Reject,
    }
}

/// Verifies server keys against `known_hosts`.
struct HostKeys {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Option<PathBuf>,
}

impl HostKeys {
    fn lookup(&self, key: &PublicKey) -> Result<bool, russh_keys::Error> {
        match &self.known_hosts {
            Some(path) => russh_keys::check_known_hosts_path(&self.host, self.port, key, path),
            None => russh_keys::check_known_hosts(&self.host, self.port, key),
        }
    }

    fn learn(&self, key: &PublicKey) -> Result<(), russh_keys::Error> {
        match &self.known_hosts {
            Some(path) => russh_keys::learn_known_hosts_path(&self.host, self.port, key, path),
            None => russh_keys::learn_known_hosts(&self.host, self.port, key),
        }
    }
}

#[async_trait]
impl client::Handler for HostKeys {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        let lookup = self.lookup(key);
        match verdict(self.policy, &lookup) {
            Verdict::Accept => Ok(true),
            Verdict::Learn => {
                if let Err(e) = self.learn(key) {
                    warn!(host = %self.host, error = %e, "failed to record host key");
                }
                debug!(host = %self.host, fingerprint = %key.fingerprint(), "learned host key");
                Ok(true)
            }
            Verdict::Reject => {
                match lookup {
                    Err(e) => warn!(host = %self.host, error = %e, "host key rejected"),
                    Ok(_) => warn!(host = %self.host, "unknown host key rejected"),
                }
                Ok(false)
            }
        }
    }
}

fn connection(target: &SshTarget, message: impl fmt::Display) -> SshError {
    SshError::Connection {
        host: target.address(),
        message: message.to_string(),
    }
}

/// Runs commands over SSH sessions opened by the control plane itself.
pub struct RusshShell {
    client: Arc<client::Config>,
    connect_timeout: Duration,
    policy: HostKeyPolicy,
    known_hosts: Option<PathBuf>,
}

impl RusshShell {
    /// Create a shell from configuration.
    #[must_use]
    pub fn new(config: &SshConfig) -> Self {
        Self {
            client: Arc::new(client::Config::default()),
            connect_timeout: config.connect_timeout(),
            policy: config.host_key_policy,
            known_hosts: config.known_hosts.clone(),
        }
    }

    async fn connect(&self, target: &SshTarget) -> SshResult<Handle<HostKeys>> {
        let handler = HostKeys {
            host: target.host.clone(),
            port: target.port,
            policy: self.policy,
            known_hosts: self.known_hosts.clone(),
        };
        let connecting = client::connect(
            self.client.clone(),
            (target.host.as_str(), target.port),
            handler,
        );
        let mut handle = match timeout(self.connect_timeout, connecting).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(connection(target, e)),
            Err(_) => {
                return Err(connection(
                    target,
                    format!("connect timed out after {:?}", self.connect_timeout),
                ))
            }
        };

        let user = target.credentials.user.as_str();
        let accepted = match &target.credentials.auth {
            SshAuth::Password { password } => handle
                .authenticate_password(user, password.expose())
                .await
                .map_err(|e| connection(target, e))?,
            SshAuth::Key { key_path } => {
                let key = russh_keys::load_secret_key(key_path, None).map_err(|e| {
                    connection(target, format!("cannot load {}: {e}", key_path.display()))
                })?;
                handle
                    .authenticate_publickey(user, Arc::new(key))
                    .await
                    .map_err(|e| connection(target, e))?
            }
            SshAuth::Agent => authenticate_default(&mut handle, target).await?,
        };
        if !accepted {
            return Err(connection(
                target,
                format!("authentication rejected for {user}"),
            ));
        }
        Ok(handle)
    }
}

impl fmt::Debug for RusshShell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RusshShell")
            .field("connect_timeout", &self.connect_timeout)
            .field("policy", &self.policy)
            .field("known_hosts", &self.known_hosts)
            .finish_non_exhaustive()
    }
}

/// Offer the agent's identities, or the default identity files when no
/// agent is reachable.
async fn authenticate_default(
    handle: &mut Handle<HostKeys>,
    target: &SshTarget,
) -> SshResult<bool> {
    let user = target.credentials.user.as_str();
    let mut agent = match AgentClient::connect_env().await {
        Ok(agent) => agent,
        Err(e) => {
            debug!(error = %e, "no ssh agent, trying default identities");
            return authenticate_identities(handle, target).await;
        }
    };

    let identities = agent
        .request_identities()
        .await
        .map_err(|e| connection(target, e))?;
    for key in identities {
        let (returned, accepted) = handle.authenticate_future(user, key, agent).await;
        agent = returned;
        if accepted.map_err(|e| connection(target, e))? {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn authenticate_identities(
    handle: &mut Handle<HostKeys>,
    target: &SshTarget,
) -> SshResult<bool> {
    let Some(home) = std::env::var_os("HOME") else {
        return Ok(false);
    };
    let dir = Path::new(&home).join(".ssh");
    for name in DEFAULT_IDENTITIES {
        let path = dir.join(name);
        if !path.exists() {
            continue;
        }
        let key = match russh_keys::load_secret_key(&path, None) {
            Ok(key) => key,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping identity");
                continue;
            }
        };
        if handle
            .authenticate_publickey(target.credentials.user.as_str(), Arc::new(key))
            .await
            .map_err(|e| connection(target, e))?
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Run one command on a fresh channel and collect its output.
async fn exec(handle: &Handle<HostKeys>, command: &str) -> SshResult<RawOutput> {
    let mut channel = handle.channel_open_session().await?;
    channel.exec(true, command).await?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, ext } if ext == STDERR_STREAM => {
                stderr.extend_from_slice(&data);
            }
            ChannelMsg::ExitStatus { exit_status } => {
                exit_code = Some(i32::try_from(exit_status).unwrap_or(NO_EXIT_STATUS));
            }
            _ => {}
        }
    }

    Ok(RawOutput {
        exit_code: exit_code.unwrap_or(NO_EXIT_STATUS),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

#[async_trait]
impl RemoteShell for RusshShell {
    async fn run(
        &self,
        target: &SshTarget,
        command: &str,
        limit: Duration,
    ) -> SshResult<RawOutput> {
        let handle = self.connect(target).await?;
        debug!(host = %target.address(), "ssh session established");

        let outcome = match timeout(limit, exec(&handle, command)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(host = %target.address(), ?limit, "ssh command timed out, closing session");
                Err(SshError::Timeout { limit })
            }
        };

        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(host = %target.address(), error = %e, "ssh disconnect failed");
        }
        outcome
    }
}
