use std::{collections::HashSet, fmt::Debug, net::SocketAddr, time::Duration};

use anyhow::Result;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

use crate::{
    dispatcher::{DispatchSettings, InitPolicy},
    pool::{MinIdlePolicy, PoolConfig, ReadinessConfig},
};

const LOCAL_ENV: &str = "local";
const DEFAULT_METRICS_INTERVAL_SECS: u64 = 10;

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Export spans over OTLP.
    #[serde(default)]
    pub enable_tracing: bool,
    /// Export metrics over OTLP.
    #[serde(default)]
    pub enable_metrics: bool,
    /// OpenTelemetry collector grpc endpoint for traces and metrics.
    /// Defaults to OTEL_EXPORTER_OTLP_ENDPOINT or localhost:4317.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Metrics export interval in seconds.
    #[serde_inline_default(DEFAULT_METRICS_INTERVAL_SECS)]
    pub metrics_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_tracing: false,
            enable_metrics: false,
            endpoint: None,
            metrics_interval_secs: DEFAULT_METRICS_INTERVAL_SECS,
        }
    }
}

impl TelemetryConfig {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RuntimeConfig {
    Docker {
        /// Docker daemon address. Supports:
        /// - Unix socket: `unix:///var/run/docker.sock` or
        ///   `/var/run/docker.sock`
        /// - HTTP: `http://localhost:2375` or `tcp://localhost:2375`
        ///
        /// If not specified, uses Docker's default socket location.
        #[serde(default)]
        address: Option<String>,
        /// Pull images that are not present locally before starting a
        /// container.
        #[serde(default = "default_true")]
        pull_missing_images: bool,
    },
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::Docker {
            address: None,
            pull_missing_images: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Defaults applied to every pool, whether declared in the config file or
/// created through the API.
#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolDefaults {
    #[serde_inline_default("myimage:latest".to_string())]
    pub image_name: String,
    #[serde_inline_default(5000)]
    pub container_port: u16,
    #[serde_inline_default(8000)]
    pub host_port_start: u16,
    #[serde_inline_default(300)]
    pub idle_timeout_secs: u64,
    #[serde(default)]
    pub min_idle_containers: usize,
    #[serde(default)]
    pub min_idle_policy: MinIdlePolicy,
    #[serde_inline_default(30)]
    pub reaper_interval_secs: u64,
    #[serde_inline_default(30)]
    pub readiness_timeout_secs: u64,
    #[serde_inline_default(1000)]
    pub readiness_poll_interval_ms: u64,
    /// Ask the runtime whether an idle container is still running before
    /// leasing it.
    #[serde_inline_default(true)]
    pub verify_running: bool,
}

impl Default for PoolDefaults {
    fn default() -> Self {
        Self {
            image_name: "myimage:latest".to_string(),
            container_port: 5000,
            host_port_start: 8000,
            idle_timeout_secs: 300,
            min_idle_containers: 0,
            min_idle_policy: MinIdlePolicy::default(),
            reaper_interval_secs: 30,
            readiness_timeout_secs: 30,
            readiness_poll_interval_ms: 1000,
            verify_running: true,
        }
    }
}

/// A pool request with optional overrides, as accepted by the
/// `create_manager` endpoint and the `pools` config section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolSpec {
    pub function_name: String,
    #[serde(default)]
    pub image_name: Option<String>,
    #[serde(default)]
    pub container_port: Option<u16>,
    #[serde(default)]
    pub host_port_start: Option<u16>,
    #[serde(default)]
    pub idle_timeout: Option<u64>,
    #[serde(default)]
    pub min_idle_containers: Option<usize>,
    #[serde(default)]
    pub min_idle_policy: Option<MinIdlePolicy>,
}

impl PoolDefaults {
    pub fn pool_config(&self, spec: &PoolSpec) -> PoolConfig {
        PoolConfig {
            function_name: spec.function_name.clone(),
            image: spec
                .image_name
                .clone()
                .unwrap_or_else(|| self.image_name.clone()),
            container_port: spec.container_port.unwrap_or(self.container_port),
            host_port_start: spec.host_port_start.unwrap_or(self.host_port_start),
            idle_timeout: Duration::from_secs(spec.idle_timeout.unwrap_or(self.idle_timeout_secs)),
            min_idle: spec.min_idle_containers.unwrap_or(self.min_idle_containers),
            min_idle_policy: spec.min_idle_policy.unwrap_or(self.min_idle_policy),
            reaper_interval: Duration::from_secs(self.reaper_interval_secs),
            readiness: ReadinessConfig {
                timeout: Duration::from_secs(self.readiness_timeout_secs),
                poll_interval: Duration::from_millis(self.readiness_poll_interval_ms),
            },
            verify_running: self.verify_running,
        }
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde_inline_default(10)]
    pub init_timeout_secs: u64,
    #[serde_inline_default(60)]
    pub run_timeout_secs: u64,
    #[serde(default)]
    pub init_policy: InitPolicy,
    /// Extra attempts for retryable failures. 0 keeps single-attempt
    /// semantics.
    #[serde(default)]
    pub max_retries: u32,
    #[serde_inline_default(200)]
    pub retry_backoff_ms: u64,
    #[serde_inline_default(5000)]
    pub retry_backoff_max_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            init_timeout_secs: 10,
            run_timeout_secs: 60,
            init_policy: InitPolicy::default(),
            max_retries: 0,
            retry_backoff_ms: 200,
            retry_backoff_max_ms: 5000,
        }
    }
}

impl DispatchConfig {
    pub fn settings(&self) -> DispatchSettings {
        DispatchSettings {
            init_timeout: Duration::from_secs(self.init_timeout_secs),
            run_timeout: Duration::from_secs(self.run_timeout_secs),
            init_policy: self.init_policy,
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            retry_backoff_max: Duration::from_millis(self.retry_backoff_max_ms),
        }
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Upper bound on concurrent dispatches inside one fan-out stage. When
    /// unset, a stage runs all of its items at once.
    #[serde(default)]
    pub max_fan_out_concurrency: Option<usize>,
    /// Number of finished runs kept for status queries.
    #[serde_inline_default(1024)]
    pub history_limit: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_fan_out_concurrency: None,
            history_limit: 1024,
        }
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde_inline_default(LOCAL_ENV.to_string())]
    pub env: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde_inline_default("0.0.0.0:5000".to_string())]
    pub listen_addr: String,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub pool_defaults: PoolDefaults,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub workflows: WorkflowConfig,
    /// Pools created when the service starts.
    #[serde(default)]
    pub pools: Vec<PoolSpec>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: LOCAL_ENV.to_string(),
            instance_id: None,
            listen_addr: "0.0.0.0:5000".to_string(),
            telemetry: TelemetryConfig::default(),
            runtime: RuntimeConfig::default(),
            pool_defaults: PoolDefaults::default(),
            dispatch: DispatchConfig::default(),
            workflows: WorkflowConfig::default(),
            pools: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::new().merge(Yaml::string(config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        let defaults = &self.pool_defaults;
        if defaults.reaper_interval_secs == 0 {
            return Err(anyhow::anyhow!("reaper_interval_secs must be positive"));
        }
        if defaults.readiness_timeout_secs == 0 || defaults.readiness_poll_interval_ms == 0 {
            return Err(anyhow::anyhow!(
                "readiness timeout and poll interval must be positive"
            ));
        }
        if self.dispatch.init_timeout_secs == 0 || self.dispatch.run_timeout_secs == 0 {
            return Err(anyhow::anyhow!("dispatch timeouts must be positive"));
        }
        if self.workflows.history_limit == 0 {
            return Err(anyhow::anyhow!("workflows.history_limit must be positive"));
        }
        if self.workflows.max_fan_out_concurrency == Some(0) {
            return Err(anyhow::anyhow!(
                "workflows.max_fan_out_concurrency must be positive when set"
            ));
        }
        let mut seen = HashSet::new();
        for pool in &self.pools {
            if pool.function_name.is_empty() {
                return Err(anyhow::anyhow!("pool declared without a function_name"));
            }
            if !seen.insert(pool.function_name.as_str()) {
                return Err(anyhow::anyhow!(
                    "pool {} declared more than once",
                    pool.function_name
                ));
            }
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    /// Stable name of this controller on its container host: the configured
    /// instance id, else the listen address. Containers are labeled with it so
    /// a restart only reclaims its own leftovers.
    pub fn runtime_owner(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| self.listen_addr.clone())
    }

    pub fn instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| format!("warmpool-{}", nanoid::nanoid!(8)))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addr, "0.0.0.0:5000");
        assert_eq!(config.pool_defaults.idle_timeout_secs, 300);
        assert_eq!(config.dispatch.max_retries, 0);
        assert!(!config.structured_logging());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
env: production
listen_addr: 127.0.0.1:7000
runtime:
  type: docker
  address: unix:///var/run/docker.sock
pool_defaults:
  image_name: video-proxy:latest
  idle_timeout_secs: 15
  min_idle_policy: prewarm
dispatch:
  init_policy: required
  max_retries: 2
workflows:
  max_fan_out_concurrency: 4
pools:
  - function_name: svd_start
    min_idle_containers: 1
  - function_name: svd_compute
    min_idle_containers: 2
    host_port_start: 8100
"#;
        let config = ServerConfig::from_yaml(yaml).unwrap();
        assert!(config.structured_logging());
        assert_eq!(config.dispatch.init_policy, InitPolicy::Required);
        assert_eq!(config.workflows.max_fan_out_concurrency, Some(4));
        assert_eq!(config.pools.len(), 2);

        let compute = config.pool_defaults.pool_config(&config.pools[1]);
        assert_eq!(compute.function_name, "svd_compute");
        assert_eq!(compute.image, "video-proxy:latest");
        assert_eq!(compute.host_port_start, 8100);
        assert_eq!(compute.min_idle, 2);
        assert_eq!(compute.min_idle_policy, MinIdlePolicy::Prewarm);
        assert_eq!(compute.idle_timeout, Duration::from_secs(15));
        // untouched defaults survive a partial section
        assert_eq!(compute.container_port, 5000);
        assert_eq!(compute.reaper_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_runtime_owner_is_stable() {
        let config = ServerConfig::from_yaml("listen_addr: 127.0.0.1:7000").unwrap();
        assert_eq!(config.runtime_owner(), "127.0.0.1:7000");
        assert_eq!(config.runtime_owner(), config.runtime_owner());

        let config = ServerConfig::from_yaml("instance_id: edge-1").unwrap();
        assert_eq!(config.runtime_owner(), "edge-1");
        assert_eq!(config.instance_id(), "edge-1");
    }

    #[test]
    fn test_rejects_invalid_listen_addr() {
        let err = ServerConfig::from_yaml("listen_addr: not-an-addr").unwrap_err();
        assert!(err.to_string().contains("invalid listen address"));
    }

    #[test]
    fn test_rejects_duplicate_pools() {
        let yaml = r#"
pools:
  - function_name: matmul
  - function_name: matmul
"#;
        let err = ServerConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen_addr: 127.0.0.1:5055").unwrap();
        let config = ServerConfig::from_path(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:5055");
    }
}
