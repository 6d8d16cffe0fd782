//! Readiness probing for freshly started containers.

use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Result};
use serde::Deserialize;
use tracing::debug;

use crate::retry::retry_until_deadline;

/// Proxy statuses that mean the container can take requests.
const READY_STATUSES: [&str; 2] = ["new", "ok"];

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
}

/// Polls the in-container proxy's `GET /status` endpoint.
#[derive(Debug, Clone)]
pub struct HealthProber {
    client: reqwest::Client,
}

impl Default for HealthProber {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthProber {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// One probe. Any transport error, non-200 response or unexpected body is
    /// an error.
    async fn probe(&self, endpoint: SocketAddr, request_timeout: Duration) -> Result<()> {
        let response = self
            .client
            .get(format!("http://{}/status", endpoint))
            .timeout(request_timeout)
            .send()
            .await?;
        if response.status() != reqwest::StatusCode::OK {
            bail!("status endpoint returned {}", response.status());
        }
        let body: StatusBody = response.json().await?;
        if !READY_STATUSES.contains(&body.status.as_str()) {
            bail!("proxy reports status {:?}", body.status);
        }
        Ok(())
    }

    /// Poll until the proxy reports ready or `timeout` elapses.
    pub async fn wait_ready(
        &self,
        endpoint: SocketAddr,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool {
        let result = retry_until_deadline(timeout, poll_interval, "waiting for readiness", || {
            self.probe(endpoint, poll_interval)
        })
        .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "Container never became ready");
                false
            }
        }
    }
}
