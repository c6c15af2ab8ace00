//! Client-side contract of a container runtime host.
//!
//! The engine only ever talks to a runtime through [`ContainerRuntime`];
//! [`RuntimeConnector`] turns a host configuration into a live client.

mod docker;

pub use docker::{DockerConnector, DockerRuntime};

use crate::host::HostConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Failed to connect to {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("{operation} failed: {message}")]
    Operation {
        operation: &'static str,
        message: String,
    },

    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Live container state as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown(String),
}

impl ContainerStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Running => f.write_str("running"),
            Self::Paused => f.write_str("paused"),
            Self::Restarting => f.write_str("restarting"),
            Self::Removing => f.write_str("removing"),
            Self::Exited => f.write_str("exited"),
            Self::Dead => f.write_str("dead"),
            Self::Unknown(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// A host-side binding for one exposed container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub protocol: Protocol,
    pub host_ip: String,
    pub host_port: u16,
}

impl PortBinding {
    /// Runtime key for the container side, e.g. `22/tcp`.
    pub fn port_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

/// Everything needed to create a space's container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: Option<String>,
    pub image: String,
    pub bindings: Vec<PortBinding>,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    pub fn exposed_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.bindings.iter().map(PortBinding::port_key).collect();
        ports.dedup();
        ports
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    pub force: bool,
    pub remove_volumes: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeVersion {
    pub version: String,
    pub api_version: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    async fn start_container(&self, id: &str) -> RuntimeResult<()>;

    async fn stop_container(&self, id: &str, grace_secs: u32) -> RuntimeResult<()>;

    async fn remove_container(&self, id: &str, options: RemoveOptions) -> RuntimeResult<()>;

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerStatus>;

    async fn pull_image(&self, image: &str, tag: &str) -> RuntimeResult<()>;

    async fn version(&self) -> RuntimeResult<RuntimeVersion>;
}

#[async_trait]
pub trait RuntimeConnector: Send + Sync {
    async fn connect(&self, config: &HostConfig) -> RuntimeResult<Arc<dyn ContainerRuntime>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_container_status() {
        assert_eq!(ContainerStatus::parse("running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::parse("exited"), ContainerStatus::Exited);
        assert_eq!(
            ContainerStatus::parse("zombie"),
            ContainerStatus::Unknown("zombie".to_string())
        );
    }

    #[test]
    fn test_exposed_ports_follow_bindings() {
        let spec = ContainerSpec {
            image: "userspace/ubuntu:latest".to_string(),
            bindings: vec![
                PortBinding {
                    container_port: 22,
                    protocol: Protocol::Tcp,
                    host_ip: "127.0.0.1".to_string(),
                    host_port: 20001,
                },
                PortBinding {
                    container_port: 1337,
                    protocol: Protocol::Tcp,
                    host_ip: "127.0.0.1".to_string(),
                    host_port: 20002,
                },
                PortBinding {
                    container_port: 1337,
                    protocol: Protocol::Udp,
                    host_ip: "127.0.0.1".to_string(),
                    host_port: 20002,
                },
            ],
            ..Default::default()
        };

        assert_eq!(spec.exposed_ports(), vec!["22/tcp", "1337/tcp", "1337/udp"]);
    }
}
