use super::{
    ContainerRuntime, ContainerSpec, ContainerStatus, RemoveOptions, RuntimeConnector,
    RuntimeError, RuntimeResult, RuntimeVersion,
};
use crate::host::{ConnectionKind, HostConfig};
use async_trait::async_trait;
use bollard::{
    errors::Error as BollardError,
    models::{
        ContainerCreateBody, ContainerStateStatusEnum, HostConfig as DockerHostConfig,
        NetworkingConfig, PortBinding as DockerPortBinding,
    },
    query_parameters::{
        CreateContainerOptionsBuilder, CreateImageOptionsBuilder, RemoveContainerOptionsBuilder,
        StopContainerOptionsBuilder,
    },
    Docker, API_DEFAULT_VERSION,
};
use futures_util::TryStreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const DEFAULT_DOCKER_TIMEOUT_SECS: u64 = 120;

/// Container runtime backed by a Docker engine.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Opens a client for the given host configuration.
    pub fn connect(config: &HostConfig) -> RuntimeResult<Self> {
        let endpoint = config.endpoint.clone().unwrap_or_default();
        let connect_err = |source: BollardError| RuntimeError::Connect {
            endpoint: config.endpoint_label(),
            message: source.to_string(),
        };

        let docker = match config.connection_kind {
            ConnectionKind::Local if endpoint.is_empty() => {
                Docker::connect_with_local_defaults().map_err(connect_err)?
            }
            ConnectionKind::Local if is_socket_endpoint(&endpoint) => {
                let path = endpoint.trim_start_matches("unix://");
                Docker::connect_with_socket(path, DEFAULT_DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)
                    .map_err(connect_err)?
            }
            ConnectionKind::Local => {
                Docker::connect_with_http(&endpoint, DEFAULT_DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)
                    .map_err(connect_err)?
            }
            ConnectionKind::Tls => {
                let (ca, cert, key) = tls_material(config)?;
                Docker::connect_with_ssl(
                    &endpoint,
                    key,
                    cert,
                    ca,
                    DEFAULT_DOCKER_TIMEOUT_SECS,
                    API_DEFAULT_VERSION,
                )
                .map_err(connect_err)?
            }
        };

        Ok(Self::new(docker))
    }
}

fn is_socket_endpoint(endpoint: &str) -> bool {
    endpoint.starts_with("unix://") || endpoint.starts_with('/')
}

fn tls_material(config: &HostConfig) -> RuntimeResult<(&Path, &Path, &Path)> {
    let missing = |what: &str| RuntimeError::Connect {
        endpoint: config.endpoint_label(),
        message: format!("tls connection requires {what}"),
    };

    let ca = config
        .ca_cert_path
        .as_deref()
        .ok_or_else(|| missing("ca_cert_path"))?;
    let cert = config
        .client_cert_path
        .as_deref()
        .ok_or_else(|| missing("client_cert_path"))?;
    let key = config
        .client_key_path
        .as_deref()
        .ok_or_else(|| missing("client_key_path"))?;

    for path in [ca, cert, key] {
        if !path.exists() {
            return Err(RuntimeError::Connect {
                endpoint: config.endpoint_label(),
                message: format!("tls material not found: {}", path.display()),
            });
        }
    }

    Ok((ca, cert, key))
}

fn is_not_found_error(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == 404
    )
}

fn map_not_found(id: &str, error: BollardError) -> RuntimeError {
    if is_not_found_error(&error) {
        RuntimeError::NotFound(id.to_string())
    } else {
        RuntimeError::Docker(error)
    }
}

fn container_body(spec: &ContainerSpec) -> ContainerCreateBody {
    let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
        .exposed_ports()
        .into_iter()
        .map(|port| (port, HashMap::new()))
        .collect();

    let mut port_bindings: HashMap<String, Option<Vec<DockerPortBinding>>> = HashMap::new();
    for binding in &spec.bindings {
        port_bindings
            .entry(binding.port_key())
            .or_insert_with(|| Some(Vec::new()))
            .get_or_insert_with(Vec::new)
            .push(DockerPortBinding {
                host_ip: Some(binding.host_ip.clone()),
                host_port: Some(binding.host_port.to_string()),
            });
    }

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        exposed_ports: Some(exposed_ports),
        labels: if spec.labels.is_empty() {
            None
        } else {
            Some(spec.labels.clone())
        },
        host_config: Some(DockerHostConfig {
            port_bindings: Some(port_bindings),
            ..DockerHostConfig::default()
        }),
        networking_config: Some(NetworkingConfig::default()),
        ..ContainerCreateBody::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let options = spec
            .name
            .as_deref()
            .map(|name| CreateContainerOptionsBuilder::new().name(name).build());

        let response = self
            .docker
            .create_container(options, container_body(spec))
            .await?;

        debug!(container_id = %response.id, image = %spec.image, "Container created");
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.docker
            .start_container(id, None::<bollard::query_parameters::StartContainerOptions>)
            .await
            .map_err(|e| map_not_found(id, e))
    }

    async fn stop_container(&self, id: &str, grace_secs: u32) -> RuntimeResult<()> {
        let grace = i32::try_from(grace_secs).unwrap_or(i32::MAX);
        self.docker
            .stop_container(id, Some(StopContainerOptionsBuilder::new().t(grace).build()))
            .await
            .map_err(|e| map_not_found(id, e))
    }

    async fn remove_container(&self, id: &str, options: RemoveOptions) -> RuntimeResult<()> {
        self.docker
            .remove_container(
                id,
                Some(
                    RemoveContainerOptionsBuilder::new()
                        .force(options.force)
                        .v(options.remove_volumes)
                        .build(),
                ),
            )
            .await
            .map_err(|e| map_not_found(id, e))
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerStatus> {
        let response = self
            .docker
            .inspect_container(id, None::<bollard::query_parameters::InspectContainerOptions>)
            .await
            .map_err(|e| map_not_found(id, e))?;

        let status = response
            .state
            .and_then(|state| state.status)
            .unwrap_or(ContainerStateStatusEnum::EMPTY);

        Ok(match status {
            ContainerStateStatusEnum::CREATED => ContainerStatus::Created,
            ContainerStateStatusEnum::RUNNING => ContainerStatus::Running,
            ContainerStateStatusEnum::PAUSED => ContainerStatus::Paused,
            ContainerStateStatusEnum::RESTARTING => ContainerStatus::Restarting,
            ContainerStateStatusEnum::REMOVING => ContainerStatus::Removing,
            ContainerStateStatusEnum::EXITED => ContainerStatus::Exited,
            ContainerStateStatusEnum::DEAD => ContainerStatus::Dead,
            other => ContainerStatus::Unknown(format!("{other:?}").to_lowercase()),
        })
    }

    async fn pull_image(&self, image: &str, tag: &str) -> RuntimeResult<()> {
        self.docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await?;

        info!(image, tag, "Image pulled");
        Ok(())
    }

    async fn version(&self) -> RuntimeResult<RuntimeVersion> {
        let version = self.docker.version().await?;
        Ok(RuntimeVersion {
            version: version.version.unwrap_or_default(),
            api_version: version.api_version.unwrap_or_default(),
        })
    }
}

/// Connects to hosts through [`DockerRuntime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DockerConnector;

#[async_trait]
impl RuntimeConnector for DockerConnector {
    async fn connect(&self, config: &HostConfig) -> RuntimeResult<Arc<dyn ContainerRuntime>> {
        info!(
            host = %config.name,
            kind = %config.connection_kind,
            "Connecting to container host"
        );
        let runtime = DockerRuntime::connect(config)?;
        Ok(Arc::new(runtime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{PortBinding, Protocol};

    #[test]
    fn test_container_body_binds_loopback() {
        let spec = ContainerSpec {
            image: "userspace/ubuntu:latest".to_string(),
            bindings: vec![
                PortBinding {
                    container_port: 1337,
                    protocol: Protocol::Tcp,
                    host_ip: "127.0.0.1".to_string(),
                    host_port: 21337,
                },
                PortBinding {
                    container_port: 1337,
                    protocol: Protocol::Udp,
                    host_ip: "127.0.0.1".to_string(),
                    host_port: 21337,
                },
            ],
            ..Default::default()
        };

        let body = container_body(&spec);
        let exposed = body.exposed_ports.unwrap();
        assert!(exposed.contains_key("1337/tcp"));
        assert!(exposed.contains_key("1337/udp"));

        let bindings = body.host_config.unwrap().port_bindings.unwrap();
        let tcp = bindings["1337/tcp"].as_ref().unwrap();
        assert_eq!(tcp[0].host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(tcp[0].host_port.as_deref(), Some("21337"));
        assert!(body.labels.is_none());
    }

    #[test]
    fn test_tls_requires_material() {
        let config = HostConfig {
            name: "remote".to_string(),
            connection_kind: ConnectionKind::Tls,
            endpoint: Some("tcp://10.0.0.5:2376".to_string()),
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            external_address: "10.0.0.5".to_string(),
            display_address: "remote.example".to_string(),
        };

        let err = DockerRuntime::connect(&config).err().unwrap();
        assert!(matches!(err, RuntimeError::Connect { .. }));
    }
}
