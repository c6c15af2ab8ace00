use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// Unauthenticated connection, usually the local engine socket.
    Local,
    /// Mutually authenticated remote engine.
    Tls,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Tls => f.write_str("tls"),
        }
    }
}

/// Input of the add-host operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: String,
    pub connection_kind: ConnectionKind,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,
    /// Address port links are reserved against.
    pub external_address: String,
    /// Address shown to users.
    pub display_address: String,
}

impl HostConfig {
    /// A local engine reached through the default socket.
    pub fn local(name: &str, external_address: &str, display_address: &str) -> Self {
        Self {
            name: name.to_string(),
            connection_kind: ConnectionKind::Local,
            endpoint: None,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            external_address: external_address.to_string(),
            display_address: display_address.to_string(),
        }
    }

    pub fn endpoint_label(&self) -> String {
        match self.endpoint.as_deref() {
            Some(endpoint) if !endpoint.is_empty() => endpoint.to_string(),
            _ => format!("{} (default)", self.connection_kind),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("host name must not be empty".to_string());
        }
        if self.external_address.trim().is_empty() {
            return Err("external_address must not be empty".to_string());
        }
        if self.connection_kind == ConnectionKind::Tls
            && self.endpoint.as_deref().map_or(true, str::is_empty)
        {
            return Err("tls hosts require an endpoint".to_string());
        }
        Ok(())
    }
}

/// Persisted container runtime host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    #[serde(flatten)]
    pub config: HostConfig,
    pub connected: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Host {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn external_address(&self) -> &str {
        &self.config.external_address
    }

    pub fn display_address(&self) -> &str {
        &self.config.display_address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_host_config() {
        let config = HostConfig::local("local", "127.0.0.1", "localhost");
        assert_eq!(config.connection_kind, ConnectionKind::Local);
        assert_eq!(config.endpoint_label(), "local (default)");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tls_host_requires_endpoint() {
        let mut config = HostConfig::local("remote", "10.0.0.5", "remote.example");
        config.connection_kind = ConnectionKind::Tls;
        assert!(config.validate().is_err());

        config.endpoint = Some("tcp://10.0.0.5:2376".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_host_config() {
        let config: HostConfig = serde_json::from_str(
            r#"{
                "name": "builder-1",
                "connection_kind": "tls",
                "endpoint": "tcp://10.0.0.7:2376",
                "ca_cert_path": "/etc/userspace/ca.pem",
                "client_cert_path": "/etc/userspace/cert.pem",
                "client_key_path": "/etc/userspace/key.pem",
                "external_address": "10.0.0.7",
                "display_address": "builder-1.example"
            }"#,
        )
        .unwrap();

        assert_eq!(config.connection_kind, ConnectionKind::Tls);
        assert_eq!(
            config.ca_cert_path,
            Some(PathBuf::from("/etc/userspace/ca.pem"))
        );
    }
}
