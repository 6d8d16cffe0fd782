//! Single-request routing: lease a container, initialize it, run the payload
//! and give the container back.

use std::{sync::Arc, time::Duration};

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::IntoStaticStr;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::{
    metrics::{Metrics, Timer},
    pool::{Pool, PoolError},
    proxy_client::{ProxyClient, UpstreamError},
    registry::PoolRegistry,
    retry::{retry_with_backoff, Backoff},
};

/// What a failed `/init` call does to a dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitPolicy {
    /// Log the failure and run anyway.
    #[default]
    BestEffort,
    /// Abort the dispatch with [`DispatchError::InitFailure`].
    Required,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub init_timeout: Duration,
    pub run_timeout: Duration,
    pub init_policy: InitPolicy,
    /// Extra attempts after a retryable failure.
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(10),
            run_timeout: Duration::from_secs(60),
            init_policy: InitPolicy::BestEffort,
            max_retries: 0,
            retry_backoff: Duration::from_millis(200),
            retry_backoff_max: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum DispatchError {
    #[error("unknown function {0}")]
    UnknownFunction(String),

    #[error("failed to get container for {function}: {source}")]
    ProvisionFailure {
        function: String,
        #[source]
        source: PoolError,
    },

    #[error("init failed on container {container_id}: {source}")]
    InitFailure {
        container_id: String,
        #[source]
        source: UpstreamError,
    },

    #[error("upstream connection failed: {0}")]
    UpstreamConnection(String),

    #[error("upstream timed out after {0:?}")]
    UpstreamTimeout(Duration),

    #[error("upstream returned HTTP {status}: {body}")]
    UpstreamHttp { status: u16, body: String },
}

impl DispatchError {
    /// Failures that happen before the function could have run.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::ProvisionFailure { .. } | DispatchError::UpstreamConnection(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        self.into()
    }
}

impl From<UpstreamError> for DispatchError {
    fn from(e: UpstreamError) -> Self {
        match e {
            UpstreamError::Connection { .. } => DispatchError::UpstreamConnection(e.to_string()),
            UpstreamError::Timeout { timeout, .. } => DispatchError::UpstreamTimeout(timeout),
            UpstreamError::Http { status, body } => DispatchError::UpstreamHttp { status, body },
        }
    }
}

/// Result of a successful dispatch.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Short id of the container that served the request.
    pub container_id: String,
    pub host_port: u16,
    pub status_code: u16,
    pub body: Value,
}

pub struct Dispatcher {
    registry: Arc<PoolRegistry>,
    proxy: ProxyClient,
    settings: DispatchSettings,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<PoolRegistry>,
        proxy: ProxyClient,
        settings: DispatchSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            proxy,
            settings,
            metrics,
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// Run `payload` on a container of `function_name`'s pool.
    #[instrument(skip_all, fields(function = %function_name))]
    pub async fn dispatch(
        &self,
        function_name: &str,
        payload: &Value,
    ) -> Result<DispatchOutcome, DispatchError> {
        let pool = self
            .registry
            .get(function_name)
            .ok_or_else(|| DispatchError::UnknownFunction(function_name.to_string()))?;

        let timer = Timer::start(
            &self.metrics.dispatch_latency,
            vec![KeyValue::new("function", function_name.to_string())],
        );
        let backoff = Backoff {
            initial: self.settings.retry_backoff,
            max: self.settings.retry_backoff_max,
        };
        let result = retry_with_backoff(
            self.settings.max_retries,
            backoff,
            function_name,
            || self.dispatch_once(&pool, payload),
            DispatchError::is_retryable,
        )
        .await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        self.metrics.dispatches.add(
            1,
            &[
                KeyValue::new("function", function_name.to_string()),
                KeyValue::new("outcome", outcome),
            ],
        );
        match &result {
            Ok(outcome) => info!(
                container_id = %outcome.container_id,
                host_port = outcome.host_port,
                status_code = outcome.status_code,
                duration_ms = timer.elapsed().as_millis() as u64,
                "Dispatch succeeded"
            ),
            Err(e) => warn!(error = %e, kind = e.kind(), "Dispatch failed"),
        }
        result
    }

    async fn dispatch_once(
        &self,
        pool: &Arc<Pool>,
        payload: &Value,
    ) -> Result<DispatchOutcome, DispatchError> {
        let lease = pool
            .acquire()
            .await
            .map_err(|source| DispatchError::ProvisionFailure {
                function: pool.name().to_string(),
                source,
            })?;
        let endpoint = lease.endpoint();

        if let Err(e) = self
            .proxy
            .init(endpoint, pool.name(), self.settings.init_timeout)
            .await
        {
            match self.settings.init_policy {
                InitPolicy::BestEffort => warn!(
                    container_id = %lease.short_id(),
                    error = %e,
                    "Init failed, running anyway"
                ),
                InitPolicy::Required => {
                    return Err(DispatchError::InitFailure {
                        container_id: lease.short_id().to_string(),
                        source: e,
                    });
                }
            }
        }

        let response = self
            .proxy
            .run(endpoint, payload, self.settings.run_timeout)
            .await?;
        let outcome = DispatchOutcome {
            container_id: lease.short_id().to_string(),
            host_port: lease.host_port(),
            status_code: response.status_code,
            body: response.body,
        };
        lease.release();
        Ok(outcome)
    }
}
