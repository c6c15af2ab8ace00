use serde::Deserialize;
use space_orchestrator::PortRange;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_event_idle_timeout")]
    pub event_idle_timeout_secs: u64,

    #[serde(default = "default_port_range")]
    pub port_range: String,

    #[serde(default = "default_max_port_attempts")]
    pub max_port_attempts: u32,

    /// Seed the starter image catalog. Images already in the catalog are
    /// pulled to hosts either way.
    #[serde(default = "default_pull_starter_images")]
    pub pull_starter_images: bool,

    /// Register the local engine when no host has been persisted yet.
    #[serde(default = "default_local_host")]
    pub local_host: bool,

    #[serde(default = "default_local_host_endpoint")]
    pub local_host_endpoint: Option<String>,

    #[serde(default = "default_local_host_address")]
    pub local_host_address: String,

    #[serde(default = "default_local_host_display")]
    pub local_host_display: String,
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("SPACED_DB_PATH") {
        return PathBuf::from(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".userspace").join("userspace.db")
}

fn default_reconcile_interval() -> u64 {
    env_parse("SPACED_RECONCILE_INTERVAL").unwrap_or(5)
}

fn default_event_idle_timeout() -> u64 {
    env_parse("SPACED_EVENT_IDLE_TIMEOUT").unwrap_or(60)
}

fn default_port_range() -> String {
    std::env::var("SPACED_PORT_RANGE").unwrap_or_else(|_| PortRange::default().to_string())
}

fn default_max_port_attempts() -> u32 {
    env_parse("SPACED_MAX_PORT_ATTEMPTS").unwrap_or(1024)
}

fn default_pull_starter_images() -> bool {
    env_flag("SPACED_PULL_STARTER_IMAGES").unwrap_or(true)
}

fn default_local_host() -> bool {
    env_flag("SPACED_LOCAL_HOST").unwrap_or(true)
}

fn default_local_host_endpoint() -> Option<String> {
    std::env::var("SPACED_LOCAL_HOST_ENDPOINT")
        .ok()
        .filter(|s| !s.is_empty())
}

fn default_local_host_address() -> String {
    std::env::var("SPACED_LOCAL_HOST_ADDRESS").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_local_host_display() -> String {
    std::env::var("SPACED_LOCAL_HOST_DISPLAY").unwrap_or_else(|_| "localhost".to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|s| parse_flag(&s))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            reconcile_interval_secs: default_reconcile_interval(),
            event_idle_timeout_secs: default_event_idle_timeout(),
            port_range: default_port_range(),
            max_port_attempts: default_max_port_attempts(),
            pull_starter_images: default_pull_starter_images(),
            local_host: default_local_host(),
            local_host_endpoint: default_local_host_endpoint(),
            local_host_address: default_local_host_address(),
            local_host_display: default_local_host_display(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn event_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.event_idle_timeout_secs.max(1))
    }

    pub fn port_range(&self) -> anyhow::Result<PortRange> {
        PortRange::parse(&self.port_range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("true"), Some(true));
        assert_eq!(parse_flag(" Yes "), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn test_deserialize_overrides() {
        let config: Config = serde_json::from_str(
            r#"{
                "db_path": "/var/lib/userspace/spaces.db",
                "reconcile_interval_secs": 2,
                "event_idle_timeout_secs": 30,
                "port_range": "30000-30999",
                "local_host": false
            }"#,
        )
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from("/var/lib/userspace/spaces.db"));
        assert_eq!(config.reconcile_interval(), Duration::from_secs(2));
        assert_eq!(config.event_idle_timeout(), Duration::from_secs(30));
        assert!(!config.local_host);

        let range = config.port_range().unwrap();
        assert_eq!((range.start, range.end), (30000, 30999));
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let config: Config =
            serde_json::from_str(r#"{"reconcile_interval_secs": 0, "event_idle_timeout_secs": 0}"#)
                .unwrap();
        assert_eq!(config.reconcile_interval(), Duration::from_secs(1));
        assert_eq!(config.event_idle_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_port_range() {
        let config: Config = serde_json::from_str(r#"{"port_range": "9000-8000"}"#).unwrap();
        assert!(config.port_range().is_err());
    }
}
