//! Process-wide set of connected container hosts.

use crate::error::{OrchestratorError, Result};
use crate::host::{Host, HostConfig};
use crate::runtime::{ContainerRuntime, RuntimeConnector};
use crate::store::SpaceStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// A registered host together with its live client.
#[derive(Clone)]
pub struct HostHandle {
    host: Arc<Host>,
    client: Arc<dyn ContainerRuntime>,
    connected: Arc<AtomicBool>,
}

impl HostHandle {
    pub fn new(host: Host, client: Arc<dyn ContainerRuntime>) -> Self {
        let connected = Arc::new(AtomicBool::new(host.connected));
        Self {
            host: Arc::new(host),
            client,
            connected,
        }
    }

    pub fn id(&self) -> &str {
        &self.host.id
    }

    pub fn name(&self) -> &str {
        self.host.name()
    }

    /// The host record as it was when registered; `connected` is tracked separately.
    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn client(&self) -> &Arc<dyn ContainerRuntime> {
        &self.client
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostHandle")
            .field("id", &self.host.id)
            .field("name", &self.host.config.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Registry of hosts, shared by provisioning, removal and reconciliation.
///
/// Connecting happens outside the lock. Duplicates are checked again under
/// the write lock before a host is persisted, so two concurrent
/// registrations of the same host cannot both succeed.
#[derive(Clone)]
pub struct HostRegistry {
    store: SpaceStore,
    connector: Arc<dyn RuntimeConnector>,
    hosts: Arc<RwLock<Vec<HostHandle>>>,
}

impl HostRegistry {
    pub fn new(store: SpaceStore, connector: Arc<dyn RuntimeConnector>) -> Self {
        Self {
            store,
            connector,
            hosts: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Connect to a new host, persist it and make it selectable.
    ///
    /// A persisted host left out of the registry because it could not be
    /// reached is reconnected when registered again with the same config.
    pub async fn register(&self, config: HostConfig) -> Result<HostHandle> {
        config.validate().map_err(OrchestratorError::InvalidInput)?;

        if self.is_registered(&config).await {
            return Err(OrchestratorError::DuplicateHost(config.name));
        }

        let persisted = match self.store.find_host_by_name(&config.name).await? {
            Some(host) if host.config == config => Some(host),
            Some(_) => return Err(OrchestratorError::DuplicateHost(config.name)),
            None => None,
        };

        let client = self.connect(&config).await?;

        let mut hosts = self.hosts.write().await;
        if hosts.iter().any(|h| same_host(h.host(), &config)) {
            return Err(OrchestratorError::DuplicateHost(config.name));
        }

        let host = match persisted {
            Some(mut host) => {
                self.store.set_host_connected(&host.id, true).await?;
                host.connected = true;
                info!(host = %host.name(), "Reconnected persisted host");
                host
            }
            None => self.store.insert_host(&config, true).await?,
        };
        let handle = HostHandle::new(host, client);
        hosts.push(handle.clone());

        info!(host = %handle.name(), id = %handle.id(), "Host registered");
        Ok(handle)
    }

    async fn is_registered(&self, config: &HostConfig) -> bool {
        self.hosts
            .read()
            .await
            .iter()
            .any(|h| same_host(h.host(), config))
    }

    /// Reconnect every persisted host. Hosts that fail to connect are
    /// flagged disconnected in the store and left out of the registry.
    pub async fn load_persisted(&self) -> Result<usize> {
        let persisted = self.store.list_hosts().await?;
        info!("Initiating connections to {} host(s)", persisted.len());

        let mut connected = 0;

        for mut host in persisted {
            if self.lookup(&host.id).await.is_some() {
                continue;
            }

            let client = match self.connect(&host.config).await {
                Ok(client) => client,
                Err(e) => {
                    error!(host = %host.name(), "Adding host failed: {}", e);
                    self.store.set_host_connected(&host.id, false).await?;
                    continue;
                }
            };

            let mut hosts = self.hosts.write().await;
            if hosts.iter().any(|h| h.id() == host.id) {
                continue;
            }
            if !host.connected {
                self.store.set_host_connected(&host.id, true).await?;
                host.connected = true;
            }
            info!(host = %host.name(), "Connected to host");
            hosts.push(HostHandle::new(host, client));
            connected += 1;
        }

        Ok(connected)
    }

    async fn connect(&self, config: &HostConfig) -> Result<Arc<dyn ContainerRuntime>> {
        let client = self.connector.connect(config).await.map_err(|e| {
            error!(host = %config.name, "Failed to start runtime client: {}", e);
            OrchestratorError::Runtime(e)
        })?;

        // Smoke test only; a host that answers connect but not version is still kept.
        match client.version().await {
            Ok(version) => info!(
                host = %config.name,
                api_version = %version.api_version,
                "Connection succeeded"
            ),
            Err(e) => warn!(host = %config.name, "Version check failed: {}", e),
        }

        Ok(client)
    }

    pub async fn lookup(&self, id: &str) -> Option<HostHandle> {
        self.hosts
            .read()
            .await
            .iter()
            .find(|h| h.id() == id)
            .cloned()
    }

    /// Every registered host in registration order.
    pub async fn all(&self) -> Vec<HostHandle> {
        self.hosts.read().await.clone()
    }

    pub async fn connected(&self) -> Vec<HostHandle> {
        self.hosts
            .read()
            .await
            .iter()
            .filter(|h| h.is_connected())
            .cloned()
            .collect()
    }

    /// Record that a host stopped answering. The host stays registered.
    pub async fn mark_disconnected(&self, id: &str) -> Result<()> {
        self.set_connected(id, false).await
    }

    pub async fn set_connected(&self, id: &str, connected: bool) -> Result<()> {
        let handle = self
            .lookup(id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound(format!("host {id}")))?;

        self.store.set_host_connected(id, connected).await?;
        handle.set_connected(connected);

        if connected {
            info!(host = %handle.name(), "Host marked connected");
        } else {
            error!(host = %handle.name(), "Host marked disconnected");
        }
        Ok(())
    }
}

fn same_host(host: &Host, config: &HostConfig) -> bool {
    host.config.name == config.name
        || (host.config.connection_kind == config.connection_kind
            && host.config.endpoint == config.endpoint
            && host.config.external_address == config.external_address)
}
