use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    time::Instant,
};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bollard::{
    models::{ContainerCreateBody, ContainerStateStatusEnum, HostConfig, PortBinding},
    query_parameters::{
        CreateContainerOptions,
        CreateImageOptions,
        InspectContainerOptions,
        ListContainersOptions,
        RemoveContainerOptions,
        StartContainerOptions,
        StopContainerOptions,
    },
    Docker,
};
use futures::StreamExt;
use tracing::{debug, info};

use super::{
    container_name,
    ContainerHandle,
    ContainerRuntime,
    ContainerSpec,
    RuntimeError,
    RuntimeStatus,
    MANAGED_LABEL,
    OWNER_LABEL,
};

/// Seconds Docker waits after SIGTERM before killing a container.
const STOP_TIMEOUT_SECS: i32 = 10;

pub struct DockerRuntime {
    docker: Docker,
    pull_missing_images: bool,
    /// Value of [`OWNER_LABEL`] on every container this runtime starts.
    owner: String,
}

impl DockerRuntime {
    /// Connect to the default Docker socket.
    pub fn new(pull_missing_images: bool, owner: &str) -> anyhow::Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self {
            docker,
            pull_missing_images,
            owner: owner.to_string(),
        })
    }

    /// Connect to a specific Docker address.
    ///
    /// Supported address formats:
    /// - Unix socket: `unix:///var/run/docker.sock` or `/var/run/docker.sock`
    /// - HTTP: `http://localhost:2375` or `tcp://localhost:2375`
    pub fn with_address(
        address: &str,
        pull_missing_images: bool,
        owner: &str,
    ) -> anyhow::Result<Self> {
        let docker = if address.starts_with("http://") || address.starts_with("tcp://") {
            let addr = address
                .trim_start_matches("http://")
                .trim_start_matches("tcp://");
            Docker::connect_with_http(
                &format!("http://{}", addr),
                120,
                bollard::API_DEFAULT_VERSION,
            )
            .context("Failed to connect to Docker daemon via HTTP")?
        } else {
            let socket_path = address.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .context("Failed to connect to Docker daemon via Unix socket")?
        };
        Ok(Self {
            docker,
            pull_missing_images,
            owner: owner.to_string(),
        })
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(anyhow!(e).context("Failed to inspect image").into()),
        }
    }

    /// Make sure the image is present locally, pulling it when allowed.
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.image_exists(image).await? {
            return Ok(());
        }
        if !self.pull_missing_images {
            return Err(RuntimeError::ImageNotFound(image.to_string()));
        }

        info!(image = %image, event = "image_pull_started", "Pulling Docker image");
        let start = Instant::now();
        let options = CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image = %image, status = %status, "Pull progress");
                    }
                }
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => {
                    return Err(RuntimeError::ImageNotFound(image.to_string()));
                }
                Err(e) => {
                    tracing::error!(
                        image = %image,
                        duration_ms = %start.elapsed().as_millis(),
                        error = %e,
                        event = "image_pull_failed",
                        "Failed to pull Docker image"
                    );
                    return Err(anyhow!(e)
                        .context(format!("Failed to pull image {}", image))
                        .into());
                }
            }
        }

        info!(
            image = %image,
            duration_ms = %start.elapsed().as_millis(),
            event = "image_pull_completed",
            "Docker image pull completed"
        );
        Ok(())
    }
}

/// Docker port key for a tcp port, e.g. `5000/tcp`.
fn port_key(port: u16) -> String {
    format!("{}/tcp", port)
}

fn build_host_config(spec: &ContainerSpec) -> HostConfig {
    let mut port_bindings = HashMap::new();
    port_bindings.insert(
        port_key(spec.container_port),
        Some(vec![PortBinding {
            host_ip: Some(Ipv4Addr::LOCALHOST.to_string()),
            host_port: Some(spec.host_port.to_string()),
        }]),
    );
    HostConfig {
        port_bindings: Some(port_bindings),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, spec: ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        self.ensure_image(&spec.image).await?;

        let name = container_name(&spec.function_name);
        info!(
            container = %name,
            image = %spec.image,
            host_port = spec.host_port,
            "Starting function container"
        );

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key(spec.container_port), HashMap::new());
        let labels: HashMap<String, String> = spec.labels(&self.owner).into_iter().collect();

        let container_config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            exposed_ports: Some(exposed_ports),
            labels: Some(labels),
            host_config: Some(build_host_config(&spec)),
            ..Default::default()
        };
        let create_options = CreateContainerOptions {
            name: Some(name.clone()),
            platform: String::new(),
        };

        let created = match self
            .docker
            .create_container(Some(create_options), container_config)
            .await
        {
            Ok(created) => created,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Err(RuntimeError::ImageNotFound(spec.image.clone())),
            Err(e) => {
                return Err(anyhow!(e)
                    .context("Failed to create function container")
                    .into())
            }
        };

        if let Err(e) = self
            .docker
            .start_container(&name, None::<StartContainerOptions>)
            .await
        {
            // Don't leave a created-but-never-started container behind.
            let _ = self.remove_by_name(&name).await;
            return Err(anyhow!(e)
                .context("Failed to start function container")
                .into());
        }

        let handle = ContainerHandle {
            id: created.id,
            name,
            endpoint: SocketAddr::from((Ipv4Addr::LOCALHOST, spec.host_port)),
        };
        info!(
            container = %handle.name,
            container_id = %handle.id,
            endpoint = %handle.endpoint,
            "Function container started"
        );
        Ok(handle)
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: Some(STOP_TIMEOUT_SECS),
            ..Default::default()
        };
        match self.docker.stop_container(&handle.id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: already gone
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(e) => Err(anyhow!(e).context("Failed to stop container").into()),
        }
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.remove_by_name(&handle.id).await
    }

    async fn status(&self, handle: &ContainerHandle) -> Result<RuntimeStatus, RuntimeError> {
        match self
            .docker
            .inspect_container(&handle.id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => {
                let status = inspect.state.and_then(|s| s.status);
                Ok(match status {
                    Some(ContainerStateStatusEnum::RUNNING) => RuntimeStatus::Running,
                    Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::DEAD) => {
                        RuntimeStatus::Exited
                    }
                    Some(other) => RuntimeStatus::Other(other.to_string()),
                    None => RuntimeStatus::Other("unknown".to_string()),
                })
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(RuntimeStatus::Exited),
            Err(e) => Err(anyhow!(e).context("Failed to inspect container").into()),
        }
    }

    async fn list_managed(&self) -> Result<Vec<String>, RuntimeError> {
        let options = ListContainersOptions {
            all: true,
            filters: Some(managed_filters(&self.owner)),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                c.names
                    .and_then(|names| names.first().cloned())
                    .map(|name| name.trim_start_matches('/').to_string())
            })
            .collect())
    }

    async fn remove_by_name(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(anyhow!(e).context("Failed to remove container").into()),
        }
    }
}

/// Label filters matching the containers of one owner. Docker ANDs them.
fn managed_filters(owner: &str) -> HashMap<String, Vec<String>> {
    let mut filters = HashMap::new();
    filters.insert(
        "label".to_string(),
        vec![
            format!("{}=true", MANAGED_LABEL),
            format!("{}={}", OWNER_LABEL, owner),
        ],
    );
    filters
}
