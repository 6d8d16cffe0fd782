mod docker;

use std::net::SocketAddr;

use async_trait::async_trait;
pub use docker::DockerRuntime;
use thiserror::Error;

/// Label marking containers started by this process.
pub const MANAGED_LABEL: &str = "warmpool.managed";

/// Label carrying the name of the function a container serves.
pub const FUNCTION_LABEL: &str = "warmpool.function";

/// Label naming the controller instance that owns a container.
pub const OWNER_LABEL: &str = "warmpool.owner";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("image {0} not found")]
    ImageNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What to start: one container of a function image with a single published
/// port.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub function_name: String,
    pub image: String,
    /// Port the in-container proxy listens on.
    pub container_port: u16,
    /// Loopback port the container port is published on.
    pub host_port: u16,
}

impl ContainerSpec {
    pub fn labels(&self, owner: &str) -> Vec<(String, String)> {
        vec![
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (OWNER_LABEL.to_string(), owner.to_string()),
            (FUNCTION_LABEL.to_string(), self.function_name.clone()),
        ]
    }
}

/// Handle to a started container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    /// Runtime-assigned container id.
    pub id: String,
    /// Container name, `{function}-{8 hex chars}`.
    pub name: String,
    /// Address the in-container proxy is reachable on from this host.
    pub endpoint: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    Running,
    /// Exited, dead, or no longer known to the runtime.
    Exited,
    Other(String),
}

/// Starts and stops function containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a container and publish its service port. Returns once the
    /// runtime reports the container started; readiness of the service
    /// inside is not checked here.
    async fn start(&self, spec: ContainerSpec) -> Result<ContainerHandle, RuntimeError>;

    /// Gracefully stop a container.
    async fn stop(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Delete a stopped container. Removing an unknown container succeeds.
    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    async fn status(&self, handle: &ContainerHandle) -> Result<RuntimeStatus, RuntimeError>;

    /// Names of all containers this runtime's owner started, including ones
    /// left behind by a previous process of the same owner. Containers of
    /// other owners are never listed.
    async fn list_managed(&self) -> Result<Vec<String>, RuntimeError>;

    /// Force-remove a container by name.
    async fn remove_by_name(&self, name: &str) -> Result<(), RuntimeError>;
}

/// Generate a container name for a function: `{function}-{8 hex chars}`.
pub fn container_name(function_name: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", function_name, &suffix[..8])
}
