//! Periodic convergence of persisted space status with live container state.

use crate::error::{OrchestratorError, Result};
use crate::registry::{HostHandle, HostRegistry};
use crate::runtime::ContainerStatus;
use crate::space::Space;
use crate::status::SpaceStatus;
use crate::store::SpaceStore;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub examined: usize,
    pub updated: usize,
    pub restarted: usize,
    pub failures: usize,
}

enum Outcome {
    Unchanged,
    Updated,
    Restarted,
}

#[derive(Clone)]
pub struct StateReconciler {
    store: SpaceStore,
    registry: HostRegistry,
    interval: Duration,
}

impl StateReconciler {
    pub fn new(store: SpaceStore, registry: HostRegistry) -> Self {
        Self {
            store,
            registry,
            interval: DEFAULT_RECONCILE_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Tick until `shutdown` is cancelled. A failing pass is logged and the
    /// loop keeps going.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs_f64(), "Reconciler started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.reconcile_once().await {
                        Ok(report) if report.updated + report.restarted + report.failures > 0 => {
                            info!(
                                examined = report.examined,
                                updated = report.updated,
                                restarted = report.restarted,
                                failures = report.failures,
                                "Reconciliation pass finished"
                            );
                        }
                        Ok(report) => debug!(examined = report.examined, "Reconciliation pass finished"),
                        Err(e) => error!("Reconciliation pass failed: {}", e),
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }

    /// Examine every persisted space once.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let spaces = self.store.list_spaces(None).await?;
        let mut report = ReconcileReport {
            examined: spaces.len(),
            ..Default::default()
        };

        for mut space in spaces {
            match self.reconcile_space(&mut space).await {
                Ok(Outcome::Unchanged) => {}
                Ok(Outcome::Updated) => report.updated += 1,
                Ok(Outcome::Restarted) => report.restarted += 1,
                Err(e) => {
                    report.failures += 1;
                    error!(space = %space.id, "Failed to reconcile space: {}", e);
                }
            }
        }

        Ok(report)
    }

    async fn reconcile_space(&self, space: &mut Space) -> Result<Outcome> {
        let host = match self.registry.lookup(&space.host_id).await {
            Some(host) if host.is_connected() => host,
            _ => {
                if space.status == SpaceStatus::HostError || space.status == SpaceStatus::Deleting {
                    return Ok(Outcome::Unchanged);
                }
                warn!(space = %space.id, host = %space.host_id, "Host for space is not connected");
                return self.transition(space, SpaceStatus::HostError).await;
            }
        };

        if space.status.is_in_creation() || space.status == SpaceStatus::Deleting {
            return Ok(Outcome::Unchanged);
        }

        if !space.has_container() {
            return Ok(Outcome::Unchanged);
        }

        let live = match host.client().inspect_container(&space.container_id).await {
            Ok(live) => live,
            Err(e) => {
                error!(space = %space.id, container = %space.container_id, "Failed to inspect container: {}", e);
                if space.status == SpaceStatus::Error {
                    return Ok(Outcome::Unchanged);
                }
                return self.transition(space, SpaceStatus::Error).await;
            }
        };

        if live == ContainerStatus::Exited && space.keep_alive {
            return self.restart(space, &host).await;
        }

        match SpaceStatus::from_runtime(&live) {
            Some(next) if next != space.status => self.transition(space, next).await,
            Some(_) => Ok(Outcome::Unchanged),
            None => {
                warn!(space = %space.id, state = %live, "Unrecognised container state");
                Ok(Outcome::Unchanged)
            }
        }
    }

    async fn restart(&self, space: &mut Space, host: &HostHandle) -> Result<Outcome> {
        // The snapshot may predate a removal that stopped this container.
        match self.store.get_space(&space.id).await {
            Ok(current) if current.status == space.status => {}
            Ok(current) => {
                debug!(space = %space.id, status = %current.status, "Space changed since snapshot; not restarting");
                return Ok(Outcome::Unchanged);
            }
            Err(OrchestratorError::NotFound(_)) => return Ok(Outcome::Unchanged),
            Err(e) => return Err(e),
        }

        let prior = space.status;
        match host.client().start_container(&space.container_id).await {
            Ok(()) => match self.store.update_status(space, SpaceStatus::Running).await {
                Ok(()) => {
                    info!(space = %space.id, "Restarted space; now running from {}", prior);
                    Ok(Outcome::Restarted)
                }
                Err(e) => superseded(space, e),
            },
            Err(e) => {
                error!(space = %space.id, "Failed to restart exited container: {}", e);
                self.transition(space, SpaceStatus::Error).await
            }
        }
    }

    async fn transition(&self, space: &mut Space, next: SpaceStatus) -> Result<Outcome> {
        if space.status == next {
            return Ok(Outcome::Unchanged);
        }

        let prior = space.status;
        match self.store.update_status(space, next).await {
            Ok(()) => {
                info!(space = %space.id, "Updated space to state {} from {}", next, prior);
                Ok(Outcome::Updated)
            }
            Err(e) => superseded(space, e),
        }
    }
}

/// A write lost to a concurrent change leaves the space alone for this pass.
fn superseded(space: &Space, err: OrchestratorError) -> Result<Outcome> {
    match err {
        OrchestratorError::InvalidTransition { .. } | OrchestratorError::NotFound(_) => {
            debug!(space = %space.id, "Skipping space changed during reconciliation: {}", err);
            Ok(Outcome::Unchanged)
        }
        other => Err(other),
    }
}
