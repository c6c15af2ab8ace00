//! Startup and shutdown of the orchestrator and its background reconciler.

use crate::config::Config;
use anyhow::{Context, Result};
use space_orchestrator::db::{backup_database, create_pool, run_migrations};
use space_orchestrator::runtime::RuntimeConnector;
use space_orchestrator::{HostConfig, Orchestrator};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Name given to the host registered from `SPACED_LOCAL_HOST`.
pub const LOCAL_HOST_NAME: &str = "local";

pub struct Daemon {
    orchestrator: Orchestrator,
    shutdown: CancellationToken,
    reconciler: JoinHandle<()>,
}

impl Daemon {
    pub async fn start(config: &Config, connector: Arc<dyn RuntimeConnector>) -> Result<Self> {
        let db_path = &config.db_path;
        info!("Database path: {}", db_path.display());

        // Backup before migrations
        if db_path.exists() {
            let backup_path = backup_database(db_path)?;
            info!("Database backed up to: {}", backup_path.display());
        }

        let pool = create_pool(db_path).await?;
        info!("Running database migrations...");
        run_migrations(&pool).await?;
        info!("Migrations complete");

        let orchestrator = Orchestrator::builder(pool, connector)
            .port_range(config.port_range().context("invalid SPACED_PORT_RANGE")?)
            .max_port_attempts(config.max_port_attempts)
            .idle_timeout(config.event_idle_timeout())
            .reconcile_interval(config.reconcile_interval())
            .build();

        let connected = orchestrator.load_hosts().await?;
        info!("{} persisted host(s) connected", connected);

        if config.local_host && orchestrator.list_hosts().await?.is_empty() {
            register_local_host(&orchestrator, config).await;
        }

        if config.pull_starter_images {
            let image = orchestrator.ensure_starter_images().await?;
            info!(image = %image.reference(), "Starter image available");
        }

        info!("Synchronizing images with hosts");
        let report = orchestrator.sync_images().await?;
        info!(
            pulled = report.pulled.len(),
            failed = report.failed.len(),
            skipped_hosts = report.skipped_hosts.len(),
            "Image download finished"
        );

        let shutdown = CancellationToken::new();
        let reconciler = tokio::spawn(orchestrator.reconciler().run(shutdown.clone()));
        info!(
            "Reconciler task started (interval: {}s)",
            config.reconcile_interval().as_secs()
        );

        Ok(Self {
            orchestrator,
            shutdown,
            reconciler,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Stop the reconciler and wait for its current pass to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down");
        self.shutdown.cancel();
        self.reconciler
            .await
            .context("reconciler task failed to join")?;
        Ok(())
    }
}

async fn register_local_host(orchestrator: &Orchestrator, config: &Config) {
    let mut host = HostConfig::local(
        LOCAL_HOST_NAME,
        &config.local_host_address,
        &config.local_host_display,
    );
    host.endpoint = config.local_host_endpoint.clone();

    match orchestrator.add_host(host).await {
        Ok(handle) => info!(host = %handle.name(), "Registered local host"),
        Err(e) => warn!("Could not register local host: {}", e),
    }
}
