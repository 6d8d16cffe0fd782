//! Per-function container pools.
//!
//! A [`Pool`] owns every container started for one function. Requests lease
//! an idle container with [`Pool::acquire`], which provisions a new one when
//! none is idle, and give it back when the returned [`ContainerLease`] is
//! released or dropped. A background reaper removes containers that stayed
//! idle longer than the configured timeout.
//!
//! All bookkeeping sits behind one synchronous mutex per pool that is only
//! held for short scans and updates. Runtime and HTTP calls happen outside
//! of it.

mod lease;
mod ports;
mod reaper;
pub mod types;

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::future::join_all;
pub use lease::ContainerLease;
use opentelemetry::KeyValue;
pub use ports::PortAllocator;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn, Instrument};
pub use types::{ContainerStatus, ContainerSummary, PoolStatus};
use types::{ContainerRecord, ContainerStore};
use utoipa::ToSchema;

use crate::{
    health::HealthProber,
    metrics::Metrics,
    runtime::{ContainerHandle, ContainerRuntime, ContainerSpec, RuntimeError, RuntimeStatus},
};

/// How `min_idle` is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MinIdlePolicy {
    /// Recorded and reported only.
    #[default]
    Hint,
    /// Provision up to `min_idle` idle containers ahead of demand and never
    /// reap below it.
    Prewarm,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadinessConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub function_name: String,
    pub image: String,
    pub container_port: u16,
    pub host_port_start: u16,
    pub idle_timeout: Duration,
    pub min_idle: usize,
    pub min_idle_policy: MinIdlePolicy,
    pub reaper_interval: Duration,
    pub readiness: ReadinessConfig,
    /// Ask the runtime whether an idle container still runs before leasing
    /// it.
    pub verify_running: bool,
}

#[cfg(test)]
impl PoolConfig {
    pub fn new(function_name: &str) -> Self {
        Self {
            function_name: function_name.to_string(),
            image: "myimage:latest".to_string(),
            container_port: 5000,
            host_port_start: 8000,
            idle_timeout: Duration::from_secs(300),
            min_idle: 0,
            min_idle_policy: MinIdlePolicy::Hint,
            reaper_interval: Duration::from_secs(30),
            readiness: ReadinessConfig::default(),
            verify_running: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("image {0} not found")]
    ImageNotFound(String),

    #[error("container runtime error: {0:#}")]
    Runtime(anyhow::Error),

    #[error("container {container_id} not ready after {timeout:?}")]
    NotReady {
        container_id: String,
        timeout: Duration,
    },

    #[error("no host ports left in pool {0}")]
    PortsExhausted(String),

    #[error("pool {0} is shut down")]
    Closed(String),
}

impl From<RuntimeError> for PoolError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::ImageNotFound(image) => PoolError::ImageNotFound(image),
            RuntimeError::Other(e) => PoolError::Runtime(e),
        }
    }
}

struct PoolState {
    containers: ContainerStore,
    ports: PortAllocator,
    /// Containers being provisioned to satisfy the min-idle floor.
    prewarming: usize,
    closed: bool,
}

pub struct Pool {
    config: PoolConfig,
    runtime: Arc<dyn ContainerRuntime>,
    prober: HealthProber,
    state: Mutex<PoolState>,
    metrics: Arc<Metrics>,
}

impl Pool {
    pub fn new(
        config: PoolConfig,
        runtime: Arc<dyn ContainerRuntime>,
        prober: HealthProber,
        metrics: Arc<Metrics>,
    ) -> Self {
        let ports = PortAllocator::new(config.host_port_start);
        Self {
            config,
            runtime,
            prober,
            state: Mutex::new(PoolState {
                containers: ContainerStore::new(),
                ports,
                prewarming: 0,
                closed: false,
            }),
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.function_name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn labels(&self) -> [KeyValue; 1] {
        [KeyValue::new("function", self.config.function_name.clone())]
    }

    /// Lease a container: the most recently used idle one, or a freshly
    /// provisioned one when none is idle.
    ///
    /// Cancel safe: a dropped call returns a taken idle container to the idle
    /// set. Provisioning runs on its own task and a container nobody waits
    /// for anymore lands idle.
    pub async fn acquire(self: &Arc<Self>) -> Result<ContainerLease, PoolError> {
        while let Some((handle, host_port)) = self.take_idle()? {
            let lease = ContainerLease::new(self.clone(), handle, host_port);
            if self.config.verify_running {
                match self.runtime.status(lease.handle()).await {
                    Ok(RuntimeStatus::Running) => {}
                    Ok(status) => {
                        let handle = lease.forfeit();
                        warn!(
                            function = %self.name(),
                            container_id = %handle.id,
                            status = ?status,
                            "Idle container is no longer running, removing it"
                        );
                        self.remove(&handle.id).await;
                        continue;
                    }
                    Err(e) => {
                        // The proxy call will surface a real failure.
                        warn!(
                            function = %self.name(),
                            container_id = %lease.handle().id,
                            error = %e,
                            "Could not verify container state, leasing it anyway"
                        );
                    }
                }
            }
            debug!(
                function = %self.name(),
                container_id = %lease.handle().id,
                "Leased warm container"
            );
            return Ok(lease);
        }

        let (tx, rx) = oneshot::channel();
        let pool = self.clone();
        tokio::spawn(
            async move {
                let result = pool.provision(ContainerStatus::Busy).await;
                if let Err(Ok((handle, _))) = tx.send(result) {
                    info!(
                        function = %pool.name(),
                        container_id = %handle.id,
                        "Requester went away, keeping the new container idle"
                    );
                    pool.release(&handle.id);
                }
            }
            .in_current_span(),
        );
        let (handle, host_port) = rx.await.map_err(|_| {
            PoolError::Runtime(anyhow::anyhow!("provisioning task ended without a result"))
        })??;
        Ok(ContainerLease::new(self.clone(), handle, host_port))
    }

    /// Flip the most recently used idle container to busy.
    fn take_idle(&self) -> Result<Option<(ContainerHandle, u16)>, PoolError> {
        let mut state = self.lock();
        if state.closed {
            return Err(PoolError::Closed(self.config.function_name.clone()));
        }
        let Some(record) = state
            .containers
            .values_mut()
            .filter(|c| c.status == ContainerStatus::Idle)
            .max_by_key(|c| c.last_active)
        else {
            return Ok(None);
        };
        if let Err(e) = record.transition(ContainerStatus::Busy) {
            warn!(error = %e, "Skipping idle container");
            return Ok(None);
        }
        Ok(Some((record.handle.clone(), record.host_port)))
    }

    /// Start a container, wait for it to be ready and move it to `target`.
    async fn provision(
        &self,
        target: ContainerStatus,
    ) -> Result<(ContainerHandle, u16), PoolError> {
        let host_port = {
            let mut state = self.lock();
            if state.closed {
                return Err(PoolError::Closed(self.config.function_name.clone()));
            }
            state
                .ports
                .next()
                .ok_or_else(|| PoolError::PortsExhausted(self.config.function_name.clone()))?
        };

        let spec = ContainerSpec {
            function_name: self.config.function_name.clone(),
            image: self.config.image.clone(),
            container_port: self.config.container_port,
            host_port,
        };
        let handle = match self.runtime.start(spec).await {
            Ok(handle) => handle,
            Err(e) => {
                self.lock().ports.free(host_port);
                self.metrics.provision_failures.add(1, &self.labels());
                warn!(
                    function = %self.name(),
                    host_port,
                    error = %e,
                    "Failed to start container"
                );
                return Err(e.into());
            }
        };

        self.lock()
            .containers
            .insert(ContainerRecord::new(handle.clone(), host_port));
        info!(
            function = %self.name(),
            container_id = %handle.id,
            host_port,
            event = "container_provisioning",
            "Waiting for container to become ready"
        );

        let readiness = self.config.readiness;
        if !self
            .prober
            .wait_ready(handle.endpoint, readiness.timeout, readiness.poll_interval)
            .await
        {
            warn!(
                function = %self.name(),
                container_id = %handle.id,
                timeout = ?readiness.timeout,
                "Container not ready in time, removing it"
            );
            self.metrics.provision_failures.add(1, &self.labels());
            self.remove(&handle.id).await;
            return Err(PoolError::NotReady {
                container_id: handle.id,
                timeout: readiness.timeout,
            });
        }

        let transitioned = {
            let mut state = self.lock();
            match state.containers.get_mut(&handle.id) {
                Some(record) => record.transition(target).is_ok(),
                None => false,
            }
        };
        if !transitioned {
            // Shutdown took the container while it was starting.
            return Err(PoolError::Closed(self.config.function_name.clone()));
        }

        self.metrics.containers_provisioned.add(1, &self.labels());
        info!(
            function = %self.name(),
            container_id = %handle.id,
            host_port,
            status = %target,
            event = "container_ready",
            "Container ready"
        );
        Ok((handle, host_port))
    }

    /// Return a leased container to the idle set. Unknown ids and invalid
    /// transitions are logged and ignored.
    pub fn release(&self, container_id: &str) {
        let mut state = self.lock();
        match state.containers.get_mut(container_id) {
            Some(record) => match record.transition(ContainerStatus::Idle) {
                Ok(()) => debug!(
                    function = %self.name(),
                    container_id,
                    "Released container"
                ),
                Err(e) => warn!(function = %self.name(), error = %e, "Ignoring release"),
            },
            None => debug!(
                function = %self.name(),
                container_id,
                "Release of a container that is already gone"
            ),
        }
    }

    /// Mark a container as removing, then stop and delete it. Returns whether
    /// the runtime removed it.
    pub async fn remove(&self, container_id: &str) -> bool {
        let handle = {
            let mut state = self.lock();
            let Some(record) = state.containers.get_mut(container_id) else {
                return false;
            };
            if record.status != ContainerStatus::Removing {
                if let Err(e) = record.transition(ContainerStatus::Removing) {
                    warn!(function = %self.name(), error = %e, "Cannot remove container");
                    return false;
                }
            }
            record.handle.clone()
        };
        self.teardown(handle).await
    }

    /// Stop and delete a container already marked as removing. On success the
    /// record is deleted and its port freed; on failure the record stays in
    /// `removing` and the port is never handed out again.
    async fn teardown(&self, handle: ContainerHandle) -> bool {
        let result = match self.runtime.stop(&handle).await {
            Ok(()) => self.runtime.remove(&handle).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                let mut state = self.lock();
                if let Some(record) = state.containers.remove(&handle.id) {
                    state.ports.free(record.host_port);
                }
                info!(
                    function = %self.name(),
                    container_id = %handle.id,
                    event = "container_removed",
                    "Container removed"
                );
                true
            }
            Err(e) => {
                self.metrics.container_leaks.add(1, &self.labels());
                warn!(
                    function = %self.name(),
                    container_id = %handle.id,
                    container = %handle.name,
                    error = %e,
                    event = "container_leaked",
                    "container leaked: runtime failed to stop it"
                );
                false
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus::from_store(self.name(), &self.lock().containers)
    }

    /// Remove every container regardless of status. Later acquires fail with
    /// [`PoolError::Closed`].
    pub async fn shutdown(&self) {
        let handles: Vec<ContainerHandle> = {
            let mut state = self.lock();
            state.closed = true;
            state
                .containers
                .values_mut()
                .map(|record| {
                    if record.status != ContainerStatus::Removing {
                        let _ = record.transition(ContainerStatus::Removing);
                    }
                    record.handle.clone()
                })
                .collect()
        };
        info!(
            function = %self.name(),
            containers = handles.len(),
            "Stopping pool containers"
        );
        join_all(handles.into_iter().map(|h| self.teardown(h))).await;
    }
}
