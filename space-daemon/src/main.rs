use anyhow::Result;
use space_daemon::{Config, Daemon};
use space_orchestrator::runtime::DockerConnector;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Held until exit so buffered file output is flushed.
    let _log_guard = space_logging::init_subscriber();

    info!("Starting space daemon...");

    let config = Config::from_env();
    info!(
        "Configuration loaded: db_path={}, port_range={}",
        config.db_path.display(),
        config.port_range
    );

    let daemon = Daemon::start(&config, Arc::new(DockerConnector)).await?;

    tokio::signal::ctrl_c().await?;
    daemon.shutdown().await
}
