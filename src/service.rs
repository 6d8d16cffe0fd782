use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum_server::Handle;
use tokio::signal;
use tracing::{info, warn};

use crate::{
    config::{RuntimeConfig, ServerConfig},
    dispatcher::Dispatcher,
    health::HealthProber,
    metrics::Metrics,
    proxy_client::ProxyClient,
    registry::PoolRegistry,
    routes::{create_routes, RouteState},
    runtime::{ContainerRuntime, DockerRuntime},
    workflow::WorkflowEngine,
};

pub struct Service {
    pub config: ServerConfig,
    pub registry: Arc<PoolRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub engine: Arc<WorkflowEngine>,
}

impl Service {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let runtime: Arc<dyn ContainerRuntime> = match &config.runtime {
            RuntimeConfig::Docker {
                address,
                pull_missing_images,
            } => {
                let owner = config.runtime_owner();
                match address {
                    Some(address) => Arc::new(
                        DockerRuntime::with_address(address, *pull_missing_images, &owner)
                            .context("error initializing docker runtime")?,
                    ),
                    None => Arc::new(
                        DockerRuntime::new(*pull_missing_images, &owner)
                            .context("error initializing docker runtime")?,
                    ),
                }
            }
        };
        Ok(Self::with_runtime(config, runtime))
    }

    pub fn with_runtime(config: ServerConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(PoolRegistry::new(
            runtime,
            HealthProber::new(),
            metrics.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            ProxyClient::new(),
            config.dispatch.settings(),
            metrics.clone(),
        ));
        let engine = Arc::new(WorkflowEngine::new(
            dispatcher.clone(),
            &config.workflows,
            metrics,
        ));
        Self {
            config,
            registry,
            dispatcher,
            engine,
        }
    }

    /// Create the pools declared in the config file.
    pub fn create_configured_pools(&self) {
        for spec in &self.config.pools {
            let config = self.config.pool_defaults.pool_config(spec);
            self.registry.create(config);
        }
    }

    pub fn route_state(&self) -> RouteState {
        RouteState {
            registry: self.registry.clone(),
            dispatcher: self.dispatcher.clone(),
            engine: self.engine.clone(),
            pool_defaults: Arc::new(self.config.pool_defaults.clone()),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let orphans = self.registry.cleanup_orphans().await;
        if orphans > 0 {
            warn!(orphans, "removed containers left behind by a previous run");
        }
        self.create_configured_pools();

        let handle = Handle::new();
        let handle_sh = handle.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address {}", self.config.listen_addr))?;
        info!("server api listening on {}", self.config.listen_addr);
        let routes = create_routes(self.route_state());
        let served = axum_server::bind(addr)
            .handle(handle)
            .serve(routes.into_make_service())
            .await;

        self.registry.shutdown().await;
        served?;
        Ok(())
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    info!("signal received, shutting down server gracefully");
}
