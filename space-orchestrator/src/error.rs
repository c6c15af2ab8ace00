use crate::runtime::RuntimeError;
use crate::status::SpaceStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Quota exceeded for owner {0}")]
    QuotaExceeded(String),

    #[error("no hosts available")]
    NoHostsAvailable,

    #[error("no ports available on host {host} after {attempts} attempts")]
    NoPortsAvailable { host: String, attempts: u32 },

    #[error("port {port} already reserved on {address}")]
    PortConflict { address: String, port: u16 },

    #[error("Host already registered: {0}")]
    DuplicateHost(String),

    #[error("Host {0} is not connected")]
    HostDisconnected(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: SpaceStatus, to: SpaceStatus },

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// True for failures rejected before any side effect took place.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_)
                | Self::InvalidImage(_)
                | Self::QuotaExceeded(_)
                | Self::NoHostsAvailable
        )
    }
}
