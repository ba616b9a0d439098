use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::{
    Docker,
    models::{
        ContainerCreateBody,
        ContainerStateStatusEnum,
        ContainerSummaryStateEnum,
        HostConfig,
        PortBinding,
        PortMap,
    },
    query_parameters::{
        CreateContainerOptions,
        CreateImageOptions,
        InspectContainerOptions,
        ListContainersOptions,
        RemoveContainerOptions,
        StartContainerOptions,
    },
};
use data_model::ContainerId;
use futures_util::StreamExt;
use tracing::info;

use super::{
    ContainerSpec,
    DriverError,
    DriverResult,
    RuntimeContainer,
    RuntimeDriver,
    RuntimeState,
    address_from_labels,
};

/// Docker Engine API backend.
pub struct DockerDriver {
    docker: Docker,
    /// Docker network containers are attached to.
    network: Option<String>,
    /// Address the gateway uses to reach published ports.
    advertise_ip: String,
}

impl DockerDriver {
    /// Connect to the default Docker socket.
    pub fn new(network: Option<String>, advertise_ip: String) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self {
            docker,
            network,
            advertise_ip,
        })
    }

    /// Connect to a specific Docker address.
    ///
    /// Supported formats:
    /// - Unix socket: `unix:///var/run/docker.sock` or `/var/run/docker.sock`
    /// - HTTP: `http://localhost:2375` or `tcp://localhost:2375`
    pub fn with_address(
        address: &str,
        network: Option<String>,
        advertise_ip: String,
    ) -> Result<Self> {
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
            network,
            advertise_ip,
        })
    }

    async fn image_exists(&self, image: &str) -> DriverResult<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(DriverError::Other(
                anyhow::Error::new(e).context("Failed to inspect image"),
            )),
        }
    }

    /// Get a container's IP address on the configured network.
    async fn container_ip(&self, name: &str) -> DriverResult<Option<String>> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_docker_error(e, name))?;

        let Some(networks) = inspect.network_settings.and_then(|ns| ns.networks) else {
            return Ok(None);
        };

        if let Some(network) = &self.network {
            if let Some(endpoint) = networks.get(network) {
                if let Some(ip) = &endpoint.ip_address {
                    if !ip.is_empty() {
                        return Ok(Some(ip.clone()));
                    }
                }
            }
        }
        for endpoint in networks.values() {
            if let Some(ip) = &endpoint.ip_address {
                if !ip.is_empty() {
                    return Ok(Some(ip.clone()));
                }
            }
        }
        Ok(None)
    }
}

fn map_docker_error(e: bollard::errors::Error, id: &str) -> DriverError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => DriverError::NotFound(id.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409, ..
        } => DriverError::Conflict(id.to_string()),
        e => DriverError::Other(anyhow::Error::new(e)),
    }
}

fn runtime_state(status: Option<ContainerStateStatusEnum>) -> RuntimeState {
    match status {
        Some(ContainerStateStatusEnum::RUNNING) => RuntimeState::Running,
        Some(ContainerStateStatusEnum::PAUSED) => RuntimeState::Paused,
        Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::DEAD) => {
            RuntimeState::Exited
        }
        _ => RuntimeState::Unknown,
    }
}

fn runtime_state_from_summary(state: Option<ContainerSummaryStateEnum>) -> RuntimeState {
    match state {
        Some(ContainerSummaryStateEnum::RUNNING) => RuntimeState::Running,
        Some(ContainerSummaryStateEnum::PAUSED) => RuntimeState::Paused,
        Some(ContainerSummaryStateEnum::EXITED)
        | Some(ContainerSummaryStateEnum::DEAD)
        | Some(ContainerSummaryStateEnum::CREATED) => RuntimeState::Exited,
        _ => RuntimeState::Unknown,
    }
}

#[async_trait]
impl RuntimeDriver for DockerDriver {
    async fn ensure_image(&self, image: &str) -> DriverResult<()> {
        if self.image_exists(image).await? {
            return Ok(());
        }

        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        tracing::debug!(image = %image, status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    return Err(DriverError::Other(anyhow::anyhow!(
                        "Failed to pull image {}: {}",
                        image,
                        e
                    )));
                }
            }
        }
        info!(image = %image, "Image pull completed");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> DriverResult<ContainerId> {
        let mut labels = spec.labels.clone();
        labels.insert(super::LABEL_PORT.to_string(), spec.port.to_string());

        let port_key = format!("{}/tcp", spec.port);
        let (exposed_ports, port_bindings) = match spec.host_port {
            Some(host_port) => {
                labels.insert(super::LABEL_HOST_PORT.to_string(), host_port.to_string());
                let mut bindings: PortMap = HashMap::new();
                bindings.insert(
                    port_key.clone(),
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(host_port.to_string()),
                    }]),
                );
                (
                    Some(HashMap::from([(port_key, HashMap::new())])),
                    Some(bindings),
                )
            }
            None => (None, None),
        };

        let host_config = HostConfig {
            network_mode: self.network.clone(),
            port_bindings,
            ..Default::default()
        };

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(labels),
            exposed_ports,
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            platform: String::new(),
        };

        self.docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| map_docker_error(e, &spec.name))?;

        Ok(ContainerId::new(spec.name.clone()))
    }

    async fn start(&self, id: &ContainerId) -> DriverResult<()> {
        self.docker
            .start_container(id.get(), None::<StartContainerOptions>)
            .await
            .map_err(|e| map_docker_error(e, id.get()))
    }

    async fn pause(&self, id: &ContainerId) -> DriverResult<()> {
        self.docker
            .pause_container(id.get())
            .await
            .map_err(|e| map_docker_error(e, id.get()))
    }

    async fn resume(&self, id: &ContainerId) -> DriverResult<()> {
        self.docker
            .unpause_container(id.get())
            .await
            .map_err(|e| map_docker_error(e, id.get()))
    }

    async fn remove(&self, id: &ContainerId, force: bool) -> DriverResult<()> {
        self.docker
            .remove_container(
                id.get(),
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_docker_error(e, id.get()))
    }

    async fn inspect(&self, id: &ContainerId) -> DriverResult<RuntimeContainer> {
        let inspect = self
            .docker
            .inspect_container(id.get(), None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_docker_error(e, id.get()))?;

        let labels = inspect
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();
        let state = runtime_state(inspect.state.and_then(|s| s.status));
        let ip = self.container_ip(id.get()).await.ok().flatten();
        let address = address_from_labels(&labels, ip.as_deref(), &self.advertise_ip);

        Ok(RuntimeContainer {
            id: id.clone(),
            state,
            labels,
            address,
        })
    }

    async fn list(&self, label_selector: &[(String, String)]) -> DriverResult<Vec<RuntimeContainer>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert(
            "label".to_string(),
            label_selector
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
        );

        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| DriverError::Other(anyhow::Error::new(e).context("Failed to list containers")))?;

        let mut result = Vec::with_capacity(containers.len());
        for summary in containers {
            let Some(name) = summary
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|name| name.trim_start_matches('/').to_string())
            else {
                continue;
            };
            let labels = summary.labels.clone().unwrap_or_default();
            let state = runtime_state_from_summary(summary.state);

            let ip = summary
                .network_settings
                .as_ref()
                .and_then(|ns| ns.networks.as_ref())
                .and_then(|networks| {
                    self.network
                        .as_ref()
                        .and_then(|n| networks.get(n))
                        .or_else(|| networks.values().next())
                })
                .and_then(|endpoint| endpoint.ip_address.clone());

            let address = address_from_labels(&labels, ip.as_deref(), &self.advertise_ip);

            result.push(RuntimeContainer {
                id: ContainerId::new(name),
                state,
                labels,
                address,
            });
        }
        Ok(result)
    }
}
