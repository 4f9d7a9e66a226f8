//! Remote command execution over SSH.
//!
//! [`SshExecutor`] is the only way the control plane runs commands on a
//! node. Every invocation, whatever its outcome, produces exactly one
//! [`SshExecutionLog`] row through an [`ExecutionLogSink`]. The transport
//! itself sits behind [`RemoteShell`] so tests can script it with
//! [`MockShell`].

mod session;

pub use session::RusshShell;

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::ControlResult;
use crate::types::{InstallStepId, LogId, NodeId, SessionId, TaskId};

/// Exit status recorded for connection and authentication failures, the
/// code the OpenSSH client uses for its own errors.
pub const SSH_CONNECTION_EXIT: i32 = 255;

/// Result type alias using [`SshError`].
pub type SshResult<T> = Result<T, SshError>;

/// Errors from remote command execution.
#[derive(Debug, thiserror::Error)]
pub enum SshError {
    /// The host could not be reached or refused authentication.
    #[error("connection to {host} failed: {message}")]
    Connection {
        /// `host:port`.
        host: String,
        /// Client diagnostic output.
        message: String,
    },

    /// The remote command exited non-zero.
    #[error("command failed with exit code {exit_code}: {stderr}")]
    CommandFailed {
        /// Remote exit code.
        exit_code: i32,
        /// Remote standard error.
        stderr: String,
    },

    /// The command exceeded its time limit and the session was killed.
    #[error("command timed out after {limit:?}")]
    Timeout {
        /// The limit that was exceeded.
        limit: Duration,
    },

    /// The command was abandoned before it finished.
    #[error("command interrupted before completion")]
    Interrupted,

    /// The session broke after authentication.
    #[error("ssh session error: {0}")]
    Session(#[from] russh::Error),
}

// =============================================================================
// Targets and credentials
// =============================================================================

/// An SSH password. Redacted in `Debug`; serialised in clear so the store
/// can persist it.
#[derive(Clone)]
pub struct Password {
    inner: SecretString,
}

impl Password {
    /// Wrap a password.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            inner: SecretString::from(value.into()),
        }
    }

    /// Expose the password for passing to the client.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.inner.expose_secret()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl PartialEq for Password {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Serialize for Password {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expose())
    }
}

impl<'de> Deserialize<'de> for Password {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// How the client authenticates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SshAuth {
    /// Password authentication.
    Password {
        /// The password.
        password: Password,
    },
    /// Private key file.
    Key {
        /// Path to the key on the control host.
        key_path: PathBuf,
    },
    /// Identities offered by the local agent, or the default identity
    /// files of the service user when no agent is running.
    #[default]
    Agent,
}

/// Credentials used to reach a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCredentials {
    /// Remote user.
    #[serde(default = "default_user")]
    pub user: String,
    /// Authentication method.
    #[serde(default)]
    pub auth: SshAuth,
}

fn default_user() -> String {
    "root".to_owned()
}

impl Default for NodeCredentials {
    fn default() -> Self {
        Self {
            user: default_user(),
            auth: SshAuth::default(),
        }
    }
}

/// Where a command runs.
#[derive(Debug, Clone, PartialEq)]
pub struct SshTarget {
    /// Host name or address.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Credentials.
    pub credentials: NodeCredentials,
}

impl SshTarget {
    /// `host:port`, the key commands are serialised on.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Correlation identifiers attached to every log row.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    /// Pipeline run the command belongs to.
    pub session_id: Option<SessionId>,
    /// Node the command targets.
    pub node_id: Option<NodeId>,
    /// Install task issuing the command.
    pub task_id: Option<TaskId>,
    /// Install step issuing the command.
    pub step_id: Option<InstallStepId>,
    /// Abandons the command when cancelled. The audit row is still written.
    pub interrupt: CancellationToken,
}

// =============================================================================
// Outputs and logs
// =============================================================================

/// What a transport returns for a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutput {
    /// Process exit code.
    pub exit_code: i32,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

/// Output of a command that reached the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Remote exit code.
    pub exit_code: i32,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Wall-clock duration.
    pub duration: Duration,
}

impl ExecOutput {
    /// Whether the command exited zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`SshError::CommandFailed`].
    pub fn into_success(self) -> SshResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(SshError::CommandFailed {
                exit_code: self.exit_code,
                stderr: self.stderr,
            })
        }
    }
}

/// Audit record of one remote command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshExecutionLog {
    /// Unique log identifier.
    pub id: LogId,
    /// Pipeline run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Target node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// Issuing task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// Issuing step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<InstallStepId>,
    /// Remote host.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Remote user.
    pub user: String,
    /// Command line.
    pub command: String,
    /// Exit code, absent on timeout or spawn failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Standard output.
    pub stdout: String,
    /// Standard error, or the error message when no process output exists.
    pub stderr: String,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// `exit_code == Some(0)`.
    pub success: bool,
    /// When the command started.
    pub started_at: DateTime<Utc>,
    /// When the command finished.
    pub finished_at: DateTime<Utc>,
}

/// Destination for SSH audit rows.
#[async_trait]
pub trait ExecutionLogSink: Send + Sync {
    /// Persist one log row.
    async fn record(&self, log: SshExecutionLog) -> ControlResult<()>;
}

/// Transport that runs a command on a remote host.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` on `target`, killing it after `timeout`.
    ///
    /// Returns the raw process output for any command that ran to
    /// completion, including non-zero exits.
    async fn run(&self, target: &SshTarget, command: &str, timeout: Duration)
        -> SshResult<RawOutput>;
}

// =============================================================================
// Executor
// =============================================================================

/// Runs commands through a [`RemoteShell`] and audits every invocation.
pub struct SshExecutor {
    shell: Arc<dyn RemoteShell>,
    sink: Arc<dyn ExecutionLogSink>,
    host_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    default_timeout: Duration,
}

impl SshExecutor {
    /// Create an executor.
    #[must_use]
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        sink: Arc<dyn ExecutionLogSink>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            shell,
            sink,
            host_locks: DashMap::new(),
            default_timeout,
        }
    }

    /// Default per-command timeout.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn host_lock(&self, address: String) -> Arc<tokio::sync::Mutex<()>> {
        self.host_locks
            .entry(address)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Execute a command on a target.
    ///
    /// Commands to the same `host:port` run one at a time. A non-zero exit is
    /// returned as `Ok`; use [`ExecOutput::into_success`] to treat it as an
    /// error. Connection failures are logged with exit code 255.
    #[instrument(skip(self, command, context), fields(host = %target.address()))]
    pub async fn execute(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Option<Duration>,
        context: &ExecContext,
    ) -> SshResult<ExecOutput> {
        let limit = timeout.unwrap_or(self.default_timeout);
        let lock = self.host_lock(target.address());
        // Nothing has run yet, so an interrupt here leaves no audit row.
        let _guard = tokio::select! {
            biased;
            () = context.interrupt.cancelled() => return Err(SshError::Interrupted),
            guard = lock.lock() => guard,
        };

        debug!(command, "executing remote command");
        let started_at = Utc::now();
        let start = Instant::now();
        let outcome = tokio::select! {
            outcome = self.shell.run(target, command, limit) => outcome,
            () = context.interrupt.cancelled() => {
                warn!(command, "remote command interrupted");
                Err(SshError::Interrupted)
            }
        };
        let duration = start.elapsed();
        let finished_at = Utc::now();

        let result = outcome.map(|raw| ExecOutput {
            exit_code: raw.exit_code,
            stdout: raw.stdout,
            stderr: raw.stderr,
            duration,
        });

        let (exit_code, stdout, stderr) = match &result {
            Ok(out) => (Some(out.exit_code), out.stdout.clone(), out.stderr.clone()),
            Err(SshError::Connection { message, .. }) => {
                (Some(SSH_CONNECTION_EXIT), String::new(), message.clone())
            }
            Err(e) => (None, String::new(), e.to_string()),
        };

        let log = SshExecutionLog {
            id: LogId::generate(),
            session_id: context.session_id.clone(),
            node_id: context.node_id.clone(),
            task_id: context.task_id.clone(),
            step_id: context.step_id.clone(),
            host: target.host.clone(),
            port: target.port,
            user: target.credentials.user.clone(),
            command: command.to_owned(),
            exit_code,
            stdout,
            stderr,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            success: exit_code == Some(0),
            started_at,
            finished_at,
        };

        if let Err(e) = self.sink.record(log).await {
            warn!(error = %e, "failed to record ssh execution log");
        }

        result
    }
}

impl fmt::Debug for SshExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshExecutor")
            .field("hosts", &self.host_locks.len())
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Mock shell
// =============================================================================

/// Scripted behaviour for [`MockShell`].
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Exit with a code and output.
    Exit {
        /// Exit code.
        code: i32,
        /// Standard output.
        stdout: String,
        /// Standard error.
        stderr: String,
    },
    /// Exceed the time limit.
    Timeout,
    /// Connection refused.
    Unreachable,
}

impl MockResponse {
    /// Successful exit with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::Exit {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failing exit with the given stderr.
    #[must_use]
    pub fn fail(code: i32, stderr: impl Into<String>) -> Self {
        Self::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

#[derive(Debug)]
struct MockRule {
    host: Option<String>,
    pattern: String,
    response: MockResponse,
    remaining: Option<usize>,
}

/// A command seen by [`MockShell`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    /// Target host.
    pub host: String,
    /// Command line.
    pub command: String,
}

/// In-memory shell for tests. Commands succeed with empty output unless a
/// rule matches.
#[derive(Debug, Default)]
pub struct MockShell {
    rules: Mutex<VecDeque<MockRule>>,
    calls: Mutex<Vec<MockCall>>,
    delay: Option<Duration>,
}

impl MockShell {
    /// Create a shell where every command succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long on every command.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Respond to commands containing `pattern` on any host.
    pub fn respond(&self, pattern: impl Into<String>, response: MockResponse) {
        self.push(None, pattern.into(), response, None);
    }

    /// Respond to commands containing `pattern` on `host`.
    pub fn respond_on(
        &self,
        host: impl Into<String>,
        pattern: impl Into<String>,
        response: MockResponse,
    ) {
        self.push(Some(host.into()), pattern.into(), response, None);
    }

    /// Respond to the next `times` matching commands, then fall through.
    pub fn respond_times(
        &self,
        host: Option<&str>,
        pattern: impl Into<String>,
        response: MockResponse,
        times: usize,
    ) {
        self.push(host.map(str::to_owned), pattern.into(), response, Some(times));
    }

    fn push(
        &self,
        host: Option<String>,
        pattern: String,
        response: MockResponse,
        remaining: Option<usize>,
    ) {
        // Later rules take precedence.
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_front(MockRule {
                host,
                pattern,
                response,
                remaining,
            });
    }

    /// Every command run so far.
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_response(&self, host: &str, command: &str) -> Option<MockResponse> {
        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = rules.iter().position(|rule| {
            rule.remaining != Some(0)
                && rule.host.as_deref().map_or(true, |h| h == host)
                && command.contains(&rule.pattern)
        })?;
        let rule = rules.get_mut(idx)?;
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(rule.response.clone())
    }
}

#[async_trait]
impl RemoteShell for MockShell {
    async fn run(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> SshResult<RawOutput> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(MockCall {
                host: target.host.clone(),
                command: command.to_owned(),
            });

        if let Some(delay) = self.delay {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(SshError::Timeout { limit: timeout });
            }
            tokio::time::sleep(delay).await;
        }

        match self.next_response(&target.host, command) {
            None => Ok(RawOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            }),
            Some(MockResponse::Exit {
                code,
                stdout,
                stderr,
            }) => Ok(RawOutput {
                exit_code: code,
                stdout,
                stderr,
            }),
            Some(MockResponse::Timeout) => Err(SshError::Timeout { limit: timeout }),
            Some(MockResponse::Unreachable) => Err(SshError::Connection {
                host: target.address(),
                message: "Connection refused".to_owned(),
            }),
        }
    }
}
