//! Space status vocabulary and the transition rules between states.

use crate::runtime::ContainerStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Every state a persisted space can be in.
///
/// The provisioning chain is `CreationStarted -> HostChosen -> PortsSecured
/// -> Created -> Running`. The runtime-mirror variants (`Paused`,
/// `Restarting`, `Removing`, `Exited`, `Dead`) are only ever written by the
/// reconciler when it copies the live container state into the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
pub enum SpaceStatus {
    #[serde(rename = "creation started")]
    #[sqlx(rename = "creation started")]
    CreationStarted,
    #[serde(rename = "host chosen")]
    #[sqlx(rename = "host chosen")]
    HostChosen,
    #[serde(rename = "ports secured")]
    #[sqlx(rename = "ports secured")]
    PortsSecured,
    #[serde(rename = "created")]
    #[sqlx(rename = "created")]
    Created,
    #[serde(rename = "running")]
    #[sqlx(rename = "running")]
    Running,
    #[serde(rename = "error")]
    #[sqlx(rename = "error")]
    Error,
    #[serde(rename = "error creating")]
    #[sqlx(rename = "error creating")]
    ErrorCreating,
    #[serde(rename = "error starting")]
    #[sqlx(rename = "error starting")]
    ErrorStarting,
    #[serde(rename = "host error")]
    #[sqlx(rename = "host error")]
    HostError,
    #[serde(rename = "deleting")]
    #[sqlx(rename = "deleting")]
    Deleting,
    #[serde(rename = "paused")]
    #[sqlx(rename = "paused")]
    Paused,
    #[serde(rename = "restarting")]
    #[sqlx(rename = "restarting")]
    Restarting,
    #[serde(rename = "removing")]
    #[sqlx(rename = "removing")]
    Removing,
    #[serde(rename = "exited")]
    #[sqlx(rename = "exited")]
    Exited,
    #[serde(rename = "dead")]
    #[sqlx(rename = "dead")]
    Dead,
}

impl SpaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreationStarted => "creation started",
            Self::HostChosen => "host chosen",
            Self::PortsSecured => "ports secured",
            Self::Created => "created",
            Self::Running => "running",
            Self::Error => "error",
            Self::ErrorCreating => "error creating",
            Self::ErrorStarting => "error starting",
            Self::HostError => "host error",
            Self::Deleting => "deleting",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
        }
    }

    /// States owned by the provisioner; the reconciler leaves these alone.
    pub fn is_in_creation(&self) -> bool {
        matches!(
            self,
            Self::CreationStarted | Self::HostChosen | Self::PortsSecured
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Error | Self::ErrorCreating | Self::ErrorStarting | Self::HostError
        )
    }

    /// Maps a live container state onto the persisted vocabulary.
    ///
    /// Returns `None` for states the runtime reports that have no
    /// counterpart here; the reconciler leaves the record untouched then.
    pub fn from_runtime(status: &ContainerStatus) -> Option<Self> {
        match status {
            ContainerStatus::Created => Some(Self::Created),
            ContainerStatus::Running => Some(Self::Running),
            ContainerStatus::Paused => Some(Self::Paused),
            ContainerStatus::Restarting => Some(Self::Restarting),
            ContainerStatus::Removing => Some(Self::Removing),
            ContainerStatus::Exited => Some(Self::Exited),
            ContainerStatus::Dead => Some(Self::Dead),
            ContainerStatus::Unknown(_) => None,
        }
    }

    pub fn can_transition_to(&self, next: SpaceStatus) -> bool {
        use SpaceStatus::*;

        if *self == next {
            return true;
        }

        match (*self, next) {
            (Deleting, _) => false,
            (_, Deleting) | (_, HostError) => true,
            (CreationStarted, HostChosen) => true,
            (HostChosen, PortsSecured) => true,
            (PortsSecured, Created) => true,
            (from, ErrorCreating) if from.is_in_creation() => true,
            (Created, Running) | (Created, ErrorStarting) => true,
            (from, _) if from.is_in_creation() => false,
            // Settled spaces follow whatever the runtime reports.
            (_, to) => !to.is_in_creation() && to != ErrorCreating,
        }
    }
}

impl fmt::Display for SpaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
