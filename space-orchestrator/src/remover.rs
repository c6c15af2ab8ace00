use crate::error::{OrchestratorError, Result};
use crate::registry::HostRegistry;
use crate::runtime::RemoveOptions;
use crate::space::Space;
use crate::status::SpaceStatus;
use crate::store::SpaceStore;
use tracing::{info, instrument, warn};

/// Seconds a container gets to stop before it is killed.
pub const STOP_GRACE_SECS: u32 = 30;

/// Best-effort steps that failed while a space was removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalReport {
    pub warnings: Vec<String>,
}

impl RemovalReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Tears down a space's container and deletes its record.
#[derive(Clone)]
pub struct SpaceRemover {
    store: SpaceStore,
    registry: HostRegistry,
}

impl SpaceRemover {
    pub fn new(store: SpaceStore, registry: HostRegistry) -> Self {
        Self { store, registry }
    }

    /// Remove `space`. Nothing is written when its host is unreachable; after
    /// that only failure to delete the record is reported as an error.
    #[instrument(skip(self, space), fields(space = %space.id))]
    pub async fn remove(&self, space: &Space) -> Result<RemovalReport> {
        let host = match self.registry.lookup(&space.host_id).await {
            Some(host) if host.is_connected() => host,
            _ => {
                warn!(host = %space.host_id, "Refusing to remove space on disconnected host");
                return Err(OrchestratorError::HostDisconnected(space.host_id.clone()));
            }
        };

        let prior = space.status;
        let mut space = space.clone();
        self.store.update_status(&mut space, SpaceStatus::Deleting).await?;
        info!("Updated space to state {} from {}", SpaceStatus::Deleting, prior);

        let mut report = RemovalReport::default();

        if prior != SpaceStatus::Error && space.has_container() {
            let client = host.client();

            if let Err(e) = client.stop_container(&space.container_id, STOP_GRACE_SECS).await {
                warn!(container = %space.container_id, "Failed to stop container: {}", e);
                report.warnings.push(format!("stop container: {e}"));
            }

            let options = RemoveOptions {
                force: true,
                remove_volumes: true,
            };
            if let Err(e) = client.remove_container(&space.container_id, options).await {
                warn!(container = %space.container_id, "Failed to remove container: {}", e);
                report.warnings.push(format!("remove container: {e}"));
            }
        }

        self.store.delete_space(&space.id).await?;
        info!(warnings = report.warnings.len(), "Space removed");

        Ok(report)
    }
}
