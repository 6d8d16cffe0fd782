//! HTTP client for the proxy service running inside every function
//! container.

use std::{net::SocketAddr, time::Duration};

use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("connection to {endpoint} failed: {message}")]
    Connection {
        endpoint: SocketAddr,
        message: String,
    },

    #[error("request to {endpoint} timed out after {timeout:?}")]
    Timeout {
        endpoint: SocketAddr,
        timeout: Duration,
    },

    #[error("upstream returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
}

#[derive(Debug, Clone)]
pub struct RunResponse {
    pub status_code: u16,
    pub body: Value,
}

#[derive(Debug, Clone)]
pub struct ProxyClient {
    client: reqwest::Client,
}

impl Default for ProxyClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyClient {
    pub fn new() -> Self {
        // Host ports are reused by later containers, so never keep a
        // connection around after a request.
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    fn map_err(endpoint: SocketAddr, timeout: Duration, e: reqwest::Error) -> UpstreamError {
        if e.is_timeout() {
            UpstreamError::Timeout { endpoint, timeout }
        } else {
            UpstreamError::Connection {
                endpoint,
                message: e.to_string(),
            }
        }
    }

    /// `POST /init {"action": <function>}`.
    pub async fn init(
        &self,
        endpoint: SocketAddr,
        action: &str,
        timeout: Duration,
    ) -> Result<(), UpstreamError> {
        let response = self
            .client
            .post(format!("http://{}/init", endpoint))
            .json(&json!({ "action": action }))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::map_err(endpoint, timeout, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// `POST /run` with the payload. A 2xx body that is not JSON comes back
    /// as `{"raw": <text>}`.
    pub async fn run(
        &self,
        endpoint: SocketAddr,
        payload: &Value,
        timeout: Duration,
    ) -> Result<RunResponse, UpstreamError> {
        let response = self
            .client
            .post(format!("http://{}/run", endpoint))
            .json(payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::map_err(endpoint, timeout, e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Self::map_err(endpoint, timeout, e))?;
        if !status.is_success() {
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                body: text,
            });
        }
        let body = serde_json::from_str(&text).unwrap_or_else(|_| json!({ "raw": text }));
        Ok(RunResponse {
            status_code: status.as_u16(),
            body,
        })
    }
}
