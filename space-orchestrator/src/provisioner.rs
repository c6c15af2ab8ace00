//! End-to-end creation of a space.
//!
//! The provisioner walks a space through `creation started -> host chosen ->
//! ports secured -> created -> running`, persisting after every step so that
//! a crash leaves the last reached state on disk.

use crate::error::{OrchestratorError, Result};
use crate::events::{self, EventSink, FailureReason, ProvisionEvent, ProvisionStream};
use crate::ports::PortAllocator;
use crate::quota::QuotaPolicy;
use crate::registry::{HostHandle, HostRegistry};
use crate::runtime::{ContainerSpec, PortBinding, Protocol};
use crate::selector::HostSelector;
use crate::space::{ProvisionRequest, Space, SpaceImage};
use crate::status::SpaceStatus;
use crate::store::{NewSpace, SpaceStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// Host side of every binding; only the local reverse proxy reaches spaces.
pub const BIND_ADDRESS: &str = "127.0.0.1";

/// A port every space exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpacePort {
    pub port: u16,
    pub protocols: Vec<Protocol>,
}

impl SpacePort {
    pub fn new(port: u16, protocols: &[Protocol]) -> Self {
        Self {
            port,
            protocols: protocols.to_vec(),
        }
    }
}

/// Administrative ssh port and the user service port.
pub fn default_space_ports() -> Vec<SpacePort> {
    vec![
        SpacePort::new(22, &[Protocol::Tcp]),
        SpacePort::new(1337, &[Protocol::Tcp, Protocol::Udp]),
    ]
}

/// A running provisioning request.
pub struct ProvisionHandle {
    pub events: ProvisionStream,
    pub outcome: JoinHandle<Result<Space>>,
}

#[derive(Clone)]
pub struct SpaceProvisioner {
    store: SpaceStore,
    registry: HostRegistry,
    selector: Arc<dyn HostSelector>,
    allocator: PortAllocator,
    quota: Arc<dyn QuotaPolicy>,
    space_ports: Vec<SpacePort>,
    idle_timeout: Duration,
}

impl SpaceProvisioner {
    pub fn new(
        store: SpaceStore,
        registry: HostRegistry,
        selector: Arc<dyn HostSelector>,
        allocator: PortAllocator,
        quota: Arc<dyn QuotaPolicy>,
    ) -> Self {
        Self {
            store,
            registry,
            selector,
            allocator,
            quota,
            space_ports: default_space_ports(),
            idle_timeout: events::DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_space_ports(mut self, space_ports: Vec<SpacePort>) -> Self {
        self.space_ports = space_ports;
        self
    }

    /// Start provisioning on its own task and return the progress stream.
    pub fn provision(&self, request: ProvisionRequest) -> ProvisionHandle {
        let (sink, events) = events::channel(self.idle_timeout);
        let provisioner = self.clone();
        let outcome = tokio::spawn(async move { provisioner.run(request, &sink).await });

        ProvisionHandle { events, outcome }
    }

    /// Provision inline, reporting progress to `sink`.
    #[instrument(skip(self, request, sink), fields(owner = %request.owner_id, name = %request.name))]
    pub async fn run(&self, request: ProvisionRequest, sink: &EventSink) -> Result<Space> {
        info!("Got space creation request");

        let image = match self.store.get_image(&request.image_id).await {
            Ok(Some(image)) if image.active => image,
            Ok(_) => {
                warn!(image_id = %request.image_id, "Invalid image requested");
                sink.emit(ProvisionEvent::Failed(FailureReason::InvalidImage))
                    .await;
                return Err(OrchestratorError::InvalidImage(request.image_id));
            }
            Err(e) => return Err(fail(sink, FailureReason::Internal, e).await),
        };

        if !self.quota.under_quota(&request.owner_id).await {
            warn!("Request rejected because of quota restrictions");
            sink.emit(ProvisionEvent::Failed(FailureReason::QuotaExceeded))
                .await;
            return Err(OrchestratorError::QuotaExceeded(request.owner_id));
        }

        let host = match self.selector.select(&self.registry).await {
            Ok(host) => host,
            Err(e) => {
                error!("No host available for space: {}", e);
                let reason = match e {
                    OrchestratorError::NoHostsAvailable => FailureReason::NoHostsAvailable,
                    _ => FailureReason::Internal,
                };
                return Err(fail(sink, reason, e).await);
            }
        };

        let mut space = match self
            .store
            .create_space(NewSpace {
                owner_id: request.owner_id.clone(),
                name: request.name.clone(),
                host_id: host.id().to_string(),
                image_id: image.id.clone(),
                ssh_key_id: request.ssh_key_id.clone(),
                keep_alive: true,
            })
            .await
        {
            Ok(space) => space,
            Err(e) => return Err(fail(sink, FailureReason::Internal, e).await),
        };

        if let Err(e) = self.advance(&mut space, SpaceStatus::HostChosen).await {
            return Err(fail(sink, FailureReason::Internal, e).await);
        }
        sink.emit(ProvisionEvent::HostChosen).await;
        info!(space = %space.id, host = %host.name(), "Selected host for space");

        self.build_container(space, &host, &image, sink).await
    }

    async fn build_container(
        &self,
        mut space: Space,
        host: &HostHandle,
        image: &SpaceImage,
        sink: &EventSink,
    ) -> Result<Space> {
        let mut bindings = Vec::new();
        for space_port in &self.space_ports {
            let link = match self
                .allocator
                .secure(&mut space, host.host(), space_port.port)
                .await
            {
                Ok(link) => link,
                Err(e) => {
                    let reason = match e {
                        OrchestratorError::NoPortsAvailable { .. } => FailureReason::NoPortsAvailable,
                        _ => FailureReason::Internal,
                    };
                    self.record_failure(&mut space, SpaceStatus::ErrorCreating)
                        .await;
                    return Err(fail(sink, reason, e).await);
                }
            };

            for protocol in &space_port.protocols {
                bindings.push(PortBinding {
                    container_port: space_port.port,
                    protocol: *protocol,
                    host_ip: BIND_ADDRESS.to_string(),
                    host_port: link.external_port,
                });
            }
        }

        if let Err(e) = self.advance(&mut space, SpaceStatus::PortsSecured).await {
            return Err(fail(sink, FailureReason::Internal, e).await);
        }
        sink.emit(ProvisionEvent::PortsSecured).await;

        let spec = ContainerSpec {
            name: None,
            image: image.reference(),
            bindings,
            labels: HashMap::from([
                ("space.id".to_string(), space.id.clone()),
                ("space.owner".to_string(), space.owner_id.clone()),
            ]),
        };

        let container_id = match host.client().create_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                error!(space = %space.id, "Failed to create container: {}", e);
                self.record_failure(&mut space, SpaceStatus::ErrorCreating)
                    .await;
                return Err(fail(sink, FailureReason::CreateFailed, e.into()).await);
            }
        };

        if let Err(e) = self
            .store
            .set_container(&mut space, &container_id, SpaceStatus::Created)
            .await
        {
            return Err(fail(sink, FailureReason::Internal, e).await);
        }
        sink.emit(ProvisionEvent::ContainerCreated).await;
        info!(space = %space.id, container = %container_id, "Created container for space");

        let next = match host.client().start_container(&container_id).await {
            Ok(()) => {
                info!(space = %space.id, container = %container_id, "Container for space started");
                SpaceStatus::Running
            }
            Err(e) => {
                error!(space = %space.id, "Error starting container: {}", e);
                SpaceStatus::ErrorStarting
            }
        };

        if let Err(e) = self.advance(&mut space, next).await {
            return Err(fail(sink, FailureReason::Internal, e).await);
        }
        sink.emit(ProvisionEvent::CreationComplete).await;

        Ok(space)
    }

    async fn advance(&self, space: &mut Space, next: SpaceStatus) -> Result<()> {
        let prior = space.status;
        self.store.update_status(space, next).await?;
        info!(space = %space.id, "Updated space to state {} from {}", next, prior);
        Ok(())
    }

    /// Persist a failure status; the record is kept for diagnostics.
    async fn record_failure(&self, space: &mut Space, status: SpaceStatus) {
        if let Err(e) = self.advance(space, status).await {
            error!(space = %space.id, "Failed to record status {}: {}", status, e);
        }
    }
}

async fn fail(sink: &EventSink, reason: FailureReason, err: OrchestratorError) -> OrchestratorError {
    sink.emit(ProvisionEvent::Failed(reason)).await;
    err
}
