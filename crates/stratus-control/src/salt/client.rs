//! HTTP client for `salt-api` (rest_cherrypy).

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use super::{slurm_pillar, ConfigManagement, SaltError, SaltResult};
use crate::config::{SaltConfig, SaltStates};
use crate::types::{ClusterConfig, NodeRole};

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(rename = "return")]
    ret: Vec<LoginToken>,
}

#[derive(Deserialize)]
struct LoginToken {
    token: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(rename = "return")]
    ret: Vec<Value>,
}

/// Client for the Salt master's REST API.
#[derive(Debug)]
pub struct SaltApiClient {
    client: Client,
    base_url: String,
    username: String,
    password: SecretString,
    eauth: String,
    states: SaltStates,
    timeout: std::time::Duration,
    token: RwLock<Option<String>>,
}

impl SaltApiClient {
    /// Create a new client from configuration.
    pub fn new(config: &SaltConfig) -> SaltResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| SaltError::Protocol(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_owned(),
            username: config.username.clone(),
            password: config.password.clone(),
            eauth: config.eauth.clone(),
            states: config.states.clone(),
            timeout: config.timeout(),
            token: RwLock::new(None),
        })
    }

    fn map_transport(&self, e: &reqwest::Error) -> SaltError {
        if e.is_timeout() {
            SaltError::Timeout(self.timeout)
        } else if e.is_connect() || e.is_request() {
            SaltError::MasterUnreachable(e.to_string())
        } else {
            SaltError::Protocol(e.to_string())
        }
    }

    async fn login(&self) -> SaltResult<String> {
        let url = format!("{}/login", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "username": self.username,
                "password": self.password.expose_secret(),
                "eauth": self.eauth,
            }))
            .send()
            .await
            .map_err(|e| self.map_transport(&e))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => {
                return Err(SaltError::Auth(format!(
                    "login rejected for user {}",
                    self.username
                )));
            }
            status => {
                return Err(SaltError::Protocol(format!("login failed: {status}")));
            }
        }

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| SaltError::Protocol(e.to_string()))?;
        let token = body
            .ret
            .into_iter()
            .next()
            .map(|t| t.token)
            .ok_or_else(|| SaltError::Protocol("login returned no token".to_owned()))?;

        debug!("obtained salt-api token");
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn token(&self) -> SaltResult<String> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        self.login().await
    }

    /// Post a lowstate chunk, logging in again once if the token expired.
    async fn run(&self, lowstate: Value) -> SaltResult<Value> {
        let mut token = self.token().await?;
        for attempt in 0..2 {
            let response = self
                .client
                .post(&self.base_url)
                .header("X-Auth-Token", &token)
                .json(&json!([lowstate]))
                .send()
                .await
                .map_err(|e| self.map_transport(&e))?;

            match response.status() {
                StatusCode::UNAUTHORIZED if attempt == 0 => {
                    warn!("salt-api token rejected, logging in again");
                    *self.token.write().await = None;
                    token = self.login().await?;
                }
                StatusCode::UNAUTHORIZED => {
                    return Err(SaltError::Auth("token rejected after re-login".to_owned()));
                }
                status if status.is_server_error() => {
                    return Err(SaltError::MasterUnreachable(format!(
                        "salt-api returned {status}"
                    )));
                }
                status if !status.is_success() => {
                    return Err(SaltError::Protocol(format!("salt-api returned {status}")));
                }
                _ => {
                    let body: ApiResponse = response
                        .json()
                        .await
                        .map_err(|e| SaltError::Protocol(e.to_string()))?;
                    return body
                        .ret
                        .into_iter()
                        .next()
                        .ok_or_else(|| SaltError::Protocol("empty return".to_owned()));
                }
            }
        }
        Err(SaltError::Auth("token rejected after re-login".to_owned()))
    }

    /// Run an execution-module function on one minion and return its value.
    async fn local(&self, minion: &str, fun: &str, arg: Value, kwarg: Value) -> SaltResult<Value> {
        let ret = self
            .run(json!({
                "client": "local",
                "tgt": minion,
                "fun": fun,
                "arg": arg,
                "kwarg": kwarg,
            }))
            .await?;
        ret.get(minion)
            .cloned()
            .ok_or_else(|| SaltError::Offline(minion.to_owned()))
    }

    async fn apply_state(&self, minion: &str, state: &str, pillar: Value) -> SaltResult<String> {
        let ret = self
            .local(
                minion,
                "state.apply",
                json!([state]),
                json!({ "pillar": pillar }),
            )
            .await?;
        summarise_state(minion, state, &ret)
    }

    async fn service(&self, minion: &str, fun: &str, service: &str) -> SaltResult<()> {
        let ret = self.local(minion, fun, json!([service]), json!({})).await?;
        if ret.as_bool() == Some(true) {
            Ok(())
        } else {
            Err(SaltError::command_failed(minion, fun, ret.to_string()))
        }
    }
}

/// Turn a `state.apply` return into a summary, failing if any state failed.
fn summarise_state(minion: &str, state: &str, ret: &Value) -> SaltResult<String> {
    let operation = format!("state.apply {state}");
    match ret {
        Value::Object(states) => {
            let failed: Vec<String> = states
                .iter()
                .filter(|(_, v)| v.get("result").and_then(Value::as_bool) == Some(false))
                .map(|(id, v)| {
                    let comment = v.get("comment").and_then(Value::as_str).unwrap_or("");
                    format!("{id}: {comment}")
                })
                .collect();
            if failed.is_empty() {
                Ok(format!("{} state(s) succeeded", states.len()))
            } else {
                Err(SaltError::command_failed(minion, operation, failed.join("; ")))
            }
        }
        // Render errors come back as a list of strings.
        Value::Array(errors) => Err(SaltError::command_failed(
            minion,
            operation,
            errors
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("; "),
        )),
        other => Err(SaltError::command_failed(minion, operation, other.to_string())),
    }
}

#[async_trait]
impl ConfigManagement for SaltApiClient {
    #[instrument(skip(self))]
    async fn is_client_accepted(&self, minion: &str) -> SaltResult<bool> {
        let ret = self
            .run(json!({ "client": "wheel", "fun": "key.list_all" }))
            .await?;
        let minions = ret
            .pointer("/data/return/minions")
            .and_then(Value::as_array)
            .ok_or_else(|| SaltError::Protocol("key.list_all missing minions".to_owned()))?;
        Ok(minions.iter().any(|m| m.as_str() == Some(minion)))
    }

    #[instrument(skip(self))]
    async fn ping(&self, minion: &str) -> SaltResult<bool> {
        match self.local(minion, "test.ping", json!([]), json!({})).await {
            Ok(v) => Ok(v.as_bool() == Some(true)),
            Err(SaltError::Offline(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn agent_version(&self, minion: &str) -> SaltResult<String> {
        let ret = self.local(minion, "test.version", json!([]), json!({})).await?;
        ret.as_str()
            .map(str::to_owned)
            .ok_or_else(|| SaltError::Protocol(format!("unexpected version: {ret}")))
    }

    async fn check_package_installed(&self, minion: &str, package: &str) -> SaltResult<bool> {
        let ret = self
            .local(minion, "pkg.version", json!([package]), json!({}))
            .await?;
        Ok(ret.as_str().is_some_and(|v| !v.is_empty()))
    }

    #[instrument(skip(self, config))]
    async fn install_node(
        &self,
        minion: &str,
        role: NodeRole,
        config: &ClusterConfig,
    ) -> SaltResult<String> {
        let state = format!("{}.{}", self.states.install, role);
        self.apply_state(minion, &state, slurm_pillar(role, config))
            .await
    }

    #[instrument(skip(self, config))]
    async fn configure_node(
        &self,
        minion: &str,
        role: NodeRole,
        config: &ClusterConfig,
    ) -> SaltResult<String> {
        let state = format!("{}.{}", self.states.configure, role);
        self.apply_state(minion, &state, slurm_pillar(role, config))
            .await
    }

    async fn start_service(&self, minion: &str, service: &str) -> SaltResult<()> {
        self.service(minion, "service.enable", service).await?;
        self.service(minion, "service.start", service).await
    }

    async fn stop_service(&self, minion: &str, service: &str) -> SaltResult<()> {
        self.service(minion, "service.stop", service).await?;
        self.service(minion, "service.disable", service).await
    }

    #[instrument(skip(self, config))]
    async fn decommission_node(
        &self,
        minion: &str,
        config: &ClusterConfig,
    ) -> SaltResult<String> {
        let state = self.states.decommission.clone();
        let pillar = json!({
            "slurm": {
                "version": config.slurm_version,
                "settings": config.settings,
            }
        });
        self.apply_state(minion, &state, pillar).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn state_summary_counts_successes() {
        let ret = json!({
            "pkg_|-slurm_|-slurm_|-installed": { "result": true, "comment": "ok" },
            "service_|-munge_|-munge_|-running": { "result": true, "comment": "ok" },
        });
        assert_eq!(
            summarise_state("c1", "slurm.install", &ret).unwrap(),
            "2 state(s) succeeded"
        );
    }

    #[test]
    fn state_summary_reports_failures() {
        let ret = json!({
            "pkg_|-slurm_|-slurm_|-installed": { "result": false, "comment": "no repo" },
        });
        let err = summarise_state("c1", "slurm.install", &ret).unwrap_err();
        assert_eq!(err.category(), "command_failed");
        assert!(err.to_string().contains("no repo"));
    }

    #[test]
    fn render_errors_fail() {
        let ret = json!(["Rendering SLS 'base:slurm.install' failed"]);
        let err = summarise_state("c1", "slurm.install", &ret).unwrap_err();
        assert!(err.to_string().contains("Rendering SLS"));
    }

    #[tokio::test]
    async fn unreachable_master_maps_to_category() {
        let config = SaltConfig {
            url: "http://127.0.0.1:1".to_owned(),
            timeout_secs: 2,
            ..SaltConfig::default()
        };
        let client = SaltApiClient::new(&config).unwrap();
        let err = client.is_client_accepted("c1").await.unwrap_err();
        assert_eq!(err.category(), "master_unreachable");
    }
}
