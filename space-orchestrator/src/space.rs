use crate::status::SpaceStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user-owned workspace backed by one container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Space {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub host_id: String,
    pub image_id: String,
    pub ssh_key_id: Option<String>,

    /// Empty until the runtime has created the container.
    pub container_id: String,
    pub status: SpaceStatus,

    /// Exited containers of keep-alive spaces are restarted by the reconciler.
    pub keep_alive: bool,
    pub port_links: Vec<PortLink>,

    #[serde(serialize_with = "serialize_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(serialize_with = "serialize_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl Space {
    pub fn has_container(&self) -> bool {
        !self.container_id.is_empty()
    }

    pub fn port_for(&self, space_port: u16) -> Option<&PortLink> {
        self.port_links.iter().find(|link| link.space_port == space_port)
    }
}

/// An external port reserved for one internal port of a space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortLink {
    pub id: String,
    pub space_id: String,
    pub space_port: u16,
    pub external_port: u16,
    pub external_address: String,
    pub display_address: String,
}

/// Image a space can be created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceImage {
    pub id: String,
    /// Inactive images are kept for existing spaces but cannot be provisioned.
    pub active: bool,
    pub name: String,
    pub description: String,
    pub image: String,
    pub tag: String,
}

impl SpaceImage {
    pub fn reference(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

/// Input of the provision operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub image_id: String,
    pub owner_id: String,
    pub name: String,
    #[serde(default)]
    pub ssh_key_id: Option<String>,
}

impl ProvisionRequest {
    pub fn new(image_id: &str, owner_id: &str, name: &str) -> Self {
        Self {
            image_id: image_id.to_string(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            ssh_key_id: None,
        }
    }
}

// Serialize DateTime as RFC 3339 / ISO 8601 string
fn serialize_datetime<S>(dt: &DateTime<Utc>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&dt.to_rfc3339())
}
