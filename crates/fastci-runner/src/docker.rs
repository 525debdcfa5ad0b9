//! Container runtime backed by the Docker Engine API.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use bollard::{API_DEFAULT_VERSION, Docker};
use fastci_core::container::{
    ContainerSpec, ContainerState, ContainerStatus, RuntimeError, RuntimeErrorKind,
};
use fastci_core::ids::ContainerHandle;
use fastci_core::ports::ContainerRuntime;
use fastci_core::timestamps::parse_runtime_timestamp;
use futures::StreamExt;
use tracing::{debug, info};

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Map a bollard error onto the runtime error classes.
pub fn runtime_error(err: bollard::errors::Error) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::new(RuntimeErrorKind::from_status_code(status_code), message),
        other => RuntimeError::new(RuntimeErrorKind::Other, other.to_string()),
    }
}

fn map_status(status: Option<ContainerStateStatusEnum>) -> ContainerStatus {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
        Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
        Some(ContainerStateStatusEnum::PAUSED) => ContainerStatus::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => ContainerStatus::Restarting,
        Some(ContainerStateStatusEnum::REMOVING) => ContainerStatus::Removing,
        Some(ContainerStateStatusEnum::EXITED) => ContainerStatus::Exited,
        Some(ContainerStateStatusEnum::DEAD) => ContainerStatus::Dead,
        _ => ContainerStatus::Unknown,
    }
}

/// Convert the engine's view of a container into ours.
pub fn map_state(
    state: Option<bollard::models::ContainerState>,
) -> Result<ContainerState, RuntimeError> {
    let Some(state) = state else {
        return Err(RuntimeError::new(
            RuntimeErrorKind::Other,
            "inspect response carried no state",
        ));
    };

    let timestamp = |raw: Option<String>| {
        parse_runtime_timestamp(raw.as_deref().unwrap_or_default())
            .map_err(|e| RuntimeError::new(RuntimeErrorKind::Other, e.to_string()))
    };

    Ok(ContainerState {
        status: map_status(state.status),
        exit_code: state.exit_code,
        error: state.error.unwrap_or_default(),
        started_at: timestamp(state.started_at)?,
        finished_at: timestamp(state.finished_at)?,
    })
}

/// Docker-backed [`ContainerRuntime`].
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to `host` (`unix://`, `tcp://` or `http://`), or to the local
    /// defaults when none is given.
    pub fn connect(host: Option<&str>) -> fastci_core::Result<Self> {
        let docker = match host {
            None => Docker::connect_with_local_defaults(),
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_socket(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(host) => Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION),
        }
        .map_err(|e| fastci_core::Error::Internal(format!("Failed to connect to Docker: {e}")))?;

        info!(host = host.unwrap_or("local defaults"), "Connected to Docker");
        Ok(Self { docker })
    }

    /// Create with an existing Docker client.
    pub fn with_docker(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                binds: Some(spec.mounts.iter().map(|m| m.to_bind()).collect()),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(runtime_error)?;

        debug!(container = %response.id, image = %spec.image, "Created container");
        Ok(ContainerHandle::new(response.id))
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.docker
            .start_container(handle.as_str(), None::<StartContainerOptions<String>>)
            .await
            .map_err(runtime_error)
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.docker
            .kill_container(handle.as_str(), None::<KillContainerOptions<String>>)
            .await
            .map_err(runtime_error)
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(handle.as_str(), Some(options))
            .await
            .map_err(runtime_error)
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerState, RuntimeError> {
        let response = self
            .docker
            .inspect_container(handle.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(runtime_error)?;
        map_state(response.state)
    }

    async fn logs(&self, handle: &ContainerHandle) -> Result<Vec<u8>, RuntimeError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };

        let mut stream = self.docker.logs(handle.as_str(), Some(options));
        let mut output = Vec::new();
        while let Some(chunk) = stream.next().await {
            output.extend_from_slice(&chunk.map_err(runtime_error)?.into_bytes());
        }
        Ok(output)
    }
}
