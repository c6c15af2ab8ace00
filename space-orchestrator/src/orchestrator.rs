//! Entry point wiring the store, host registry and space lifecycle together.

use crate::error::Result;
use crate::events::DEFAULT_IDLE_TIMEOUT;
use crate::host::{Host, HostConfig};
use crate::ports::{PortAllocator, PortRange, DEFAULT_MAX_ATTEMPTS};
use crate::provisioner::{ProvisionHandle, SpacePort, SpaceProvisioner};
use crate::quota::{QuotaPolicy, UnlimitedQuota};
use crate::reconciler::{StateReconciler, DEFAULT_RECONCILE_INTERVAL};
use crate::registry::{HostHandle, HostRegistry};
use crate::remover::{RemovalReport, SpaceRemover};
use crate::runtime::RuntimeConnector;
use crate::selector::{HostSelector, LeastLoadedSelector};
use crate::space::{ProvisionRequest, Space, SpaceImage};
use crate::store::SpaceStore;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

pub const STARTER_IMAGE: &str = "userspace/ubuntu";
pub const STARTER_TAG: &str = "latest";

/// What happened when images were pulled onto hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageSyncReport {
    /// `(host name, image reference)` pairs pulled successfully.
    pub pulled: Vec<(String, String)>,
    /// `(host name, image reference, error)` for failed pulls.
    pub failed: Vec<(String, String, String)>,
    /// Hosts left out because they are disconnected.
    pub skipped_hosts: Vec<String>,
}

pub struct OrchestratorBuilder {
    pool: SqlitePool,
    connector: Arc<dyn RuntimeConnector>,
    port_range: PortRange,
    max_port_attempts: u32,
    idle_timeout: Duration,
    reconcile_interval: Duration,
    space_ports: Option<Vec<SpacePort>>,
    selector: Option<Arc<dyn HostSelector>>,
    quota: Arc<dyn QuotaPolicy>,
}

impl OrchestratorBuilder {
    pub fn port_range(mut self, range: PortRange) -> Self {
        self.port_range = range;
        self
    }

    pub fn max_port_attempts(mut self, attempts: u32) -> Self {
        self.max_port_attempts = attempts;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn space_ports(mut self, ports: Vec<SpacePort>) -> Self {
        self.space_ports = Some(ports);
        self
    }

    pub fn selector(mut self, selector: Arc<dyn HostSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn quota(mut self, quota: Arc<dyn QuotaPolicy>) -> Self {
        self.quota = quota;
        self
    }

    pub fn build(self) -> Orchestrator {
        let store = SpaceStore::new(self.pool);
        let registry = HostRegistry::new(store.clone(), self.connector);
        let selector = self
            .selector
            .unwrap_or_else(|| Arc::new(LeastLoadedSelector::new(store.clone())));
        let allocator = PortAllocator::new(store.clone(), self.port_range)
            .with_max_attempts(self.max_port_attempts);

        let mut provisioner =
            SpaceProvisioner::new(store.clone(), registry.clone(), selector, allocator, self.quota)
                .with_idle_timeout(self.idle_timeout);
        if let Some(ports) = self.space_ports {
            provisioner = provisioner.with_space_ports(ports);
        }

        let remover = SpaceRemover::new(store.clone(), registry.clone());

        Orchestrator {
            store,
            registry,
            provisioner,
            remover,
            reconcile_interval: self.reconcile_interval,
        }
    }
}

/// Space lifecycle operations over a shared store and host registry.
#[derive(Clone)]
pub struct Orchestrator {
    store: SpaceStore,
    registry: HostRegistry,
    provisioner: SpaceProvisioner,
    remover: SpaceRemover,
    reconcile_interval: Duration,
}

impl Orchestrator {
    pub fn builder(pool: SqlitePool, connector: Arc<dyn RuntimeConnector>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            pool,
            connector,
            port_range: PortRange::default(),
            max_port_attempts: DEFAULT_MAX_ATTEMPTS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            space_ports: None,
            selector: None,
            quota: Arc::new(UnlimitedQuota),
        }
    }

    pub fn store(&self) -> &SpaceStore {
        &self.store
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    /// Start provisioning; progress arrives on the returned stream.
    pub fn provision(&self, request: ProvisionRequest) -> ProvisionHandle {
        self.provisioner.provision(request)
    }

    pub async fn list_spaces(&self, owner_id: Option<&str>) -> Result<Vec<Space>> {
        self.store.list_spaces(owner_id).await
    }

    pub async fn get_space(&self, id: &str) -> Result<Space> {
        self.store.get_space(id).await
    }

    pub async fn remove_space(&self, id: &str) -> Result<RemovalReport> {
        let space = self.store.get_space(id).await?;
        self.remover.remove(&space).await
    }

    pub async fn add_host(&self, config: HostConfig) -> Result<HostHandle> {
        self.registry.register(config).await
    }

    /// Reconnect hosts persisted by an earlier run.
    pub async fn load_hosts(&self) -> Result<usize> {
        self.registry.load_persisted().await
    }

    pub async fn list_hosts(&self) -> Result<Vec<Host>> {
        self.store.list_hosts().await
    }

    pub async fn list_images(&self) -> Result<Vec<SpaceImage>> {
        self.store.list_images().await
    }

    /// Make sure the base image exists and is active.
    #[instrument(skip(self))]
    pub async fn ensure_starter_images(&self) -> Result<SpaceImage> {
        match self.store.find_image(STARTER_IMAGE, STARTER_TAG).await? {
            Some(image) if image.active => Ok(image),
            Some(mut image) => {
                self.store.set_image_active(&image.id, true).await?;
                image.active = true;
                info!(image = %image.reference(), "Reactivated starter image");
                Ok(image)
            }
            None => {
                let image = self
                    .store
                    .create_image("Ubuntu", "Basic Ubuntu Image", STARTER_IMAGE, STARTER_TAG, true)
                    .await?;
                info!(image = %image.reference(), "Added starter image");
                Ok(image)
            }
        }
    }

    /// Pull every known image onto every connected host.
    #[instrument(skip(self))]
    pub async fn sync_images(&self) -> Result<ImageSyncReport> {
        let images = self.store.list_images().await?;
        let mut report = ImageSyncReport::default();

        for host in self.registry.all().await {
            if !host.is_connected() {
                warn!(host = %host.name(), "Skipping image download on disconnected host");
                report.skipped_hosts.push(host.name().to_string());
                continue;
            }

            for image in &images {
                let reference = image.reference();
                info!(host = %host.name(), image = %reference, "Pulling image");
                match host.client().pull_image(&image.image, &image.tag).await {
                    Ok(()) => report.pulled.push((host.name().to_string(), reference)),
                    Err(e) => {
                        warn!(host = %host.name(), image = %reference, "Failed to pull image: {}", e);
                        report
                            .failed
                            .push((host.name().to_string(), reference, e.to_string()));
                    }
                }
            }
        }

        Ok(report)
    }

    pub fn reconciler(&self) -> StateReconciler {
        StateReconciler::new(self.store.clone(), self.registry.clone())
            .with_interval(self.reconcile_interval)
    }
}
