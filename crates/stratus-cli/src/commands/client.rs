//! HTTP client for the control plane API.

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("cannot reach control plane at {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{status}: {message}")]
    Api {
        status: StatusCode,
        message: String,
        failed_nodes: Vec<FailedNode>,
    },

    #[error("invalid response: {0}")]
    Decode(#[from] reqwest::Error),
}

/// A node named in a 409 scale rejection.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct FailedNode {
    pub node: String,
    pub reason: String,
}

#[derive(serde::Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    failed_nodes: Vec<FailedNode>,
}

/// Thin wrapper over `reqwest` bound to one server.
#[derive(Debug, Clone)]
pub struct ControlClient {
    http: Client,
    base: String,
}

impl ControlClient {
    pub fn new(server: &str) -> Self {
        Self {
            http: Client::new(),
            base: server.trim_end_matches('/').to_owned(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.url(path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| ClientError::Unreachable { url, source })?;
        decode(response).await
    }

    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let url = self.url(path);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|source| ClientError::Unreachable { url, source })?;
        decode(response).await
    }

    /// Open a server-sent event stream.
    pub async fn stream(&self, path: &str) -> Result<Response, ClientError> {
        let url = self.url(path);
        let response = self
            .http
            .get(&url)
            .header("accept", "text/event-stream")
            .send()
            .await
            .map_err(|source| ClientError::Unreachable { url, source })?;
        check(response).await
    }
}

async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let (message, failed_nodes) = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => (body.error, body.failed_nodes),
        Err(_) => (text, Vec::new()),
    };
    Err(ClientError::Api {
        status,
        message,
        failed_nodes,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    Ok(check(response).await?.json().await?)
}
