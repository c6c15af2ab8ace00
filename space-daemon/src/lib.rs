pub mod config;
pub mod daemon;

pub use config::Config;
pub use daemon::Daemon;
