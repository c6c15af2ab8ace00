use crate::error::{OrchestratorError, Result};
use crate::registry::{HostHandle, HostRegistry};
use crate::store::SpaceStore;
use async_trait::async_trait;
use tracing::debug;

/// Placement policy for new spaces.
#[async_trait]
pub trait HostSelector: Send + Sync {
    /// Pick a connected host, or fail with [`OrchestratorError::NoHostsAvailable`].
    async fn select(&self, registry: &HostRegistry) -> Result<HostHandle>;
}

/// Picks the connected host with the fewest spaces; ties go to the host
/// registered first.
#[derive(Clone)]
pub struct LeastLoadedSelector {
    store: SpaceStore,
}

impl LeastLoadedSelector {
    pub fn new(store: SpaceStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HostSelector for LeastLoadedSelector {
    async fn select(&self, registry: &HostRegistry) -> Result<HostHandle> {
        let candidates = registry.connected().await;
        if candidates.is_empty() {
            return Err(OrchestratorError::NoHostsAvailable);
        }

        let load = self.store.count_spaces_by_host().await?;

        // min_by_key keeps the first of equal elements
        let chosen = candidates
            .into_iter()
            .min_by_key(|h| load.get(h.id()).copied().unwrap_or(0))
            .ok_or(OrchestratorError::NoHostsAvailable)?;

        debug!(host = %chosen.name(), "Selected host");
        Ok(chosen)
    }
}
