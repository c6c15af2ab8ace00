//! Space provisioning and reconciliation engine
//!
//! This crate owns the lifecycle of user spaces: long-lived containers placed
//! on one of several container hosts, reachable through reserved external
//! ports. It is consumed by the space daemon but has no transport of its own.

pub mod db;
pub mod error;
pub mod events;
pub mod host;
pub mod orchestrator;
pub mod ports;
pub mod provisioner;
pub mod quota;
pub mod reconciler;
pub mod registry;
pub mod remover;
pub mod runtime;
pub mod selector;
pub mod space;
pub mod status;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::{OrchestratorError, Result};
pub use events::{FailureReason, ProvisionEvent, ProvisionStream};
pub use host::{ConnectionKind, Host, HostConfig};
pub use orchestrator::{ImageSyncReport, Orchestrator, OrchestratorBuilder};
pub use ports::{PortAllocator, PortRange};
pub use provisioner::{ProvisionHandle, SpacePort, SpaceProvisioner};
pub use quota::{QuotaPolicy, UnlimitedQuota};
pub use reconciler::{ReconcileReport, StateReconciler};
pub use registry::{HostHandle, HostRegistry};
pub use remover::{RemovalReport, SpaceRemover};
pub use selector::{HostSelector, LeastLoadedSelector};
pub use space::{PortLink, ProvisionRequest, Space, SpaceImage};
pub use status::SpaceStatus;
pub use store::SpaceStore;
