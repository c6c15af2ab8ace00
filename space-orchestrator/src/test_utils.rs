//! In-memory database, scripted container runtime and fixtures for tests.

use crate::host::HostConfig;
use crate::orchestrator::Orchestrator;
use crate::runtime::{
    ContainerRuntime, ContainerSpec, ContainerStatus, RemoveOptions, RuntimeConnector,
    RuntimeError, RuntimeResult, RuntimeVersion,
};
use crate::space::SpaceImage;
use crate::store::SpaceStore;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Helper to create an in-memory test database with migrations applied.
///
/// Every connection to `sqlite::memory:` opens a fresh database, so the
/// pool is pinned to a single connection that never expires.
pub async fn create_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

pub async fn create_test_store() -> SpaceStore {
    SpaceStore::new(create_test_db().await)
}

/// An active image usable for provisioning.
pub async fn seed_image(store: &SpaceStore) -> SpaceImage {
    store
        .create_image("Ubuntu", "Basic Ubuntu Image", "userspace/ubuntu", "latest", true)
        .await
        .expect("Failed to seed image")
}

/// A local host with its own external address.
pub fn test_host(name: &str, external_address: &str) -> HostConfig {
    HostConfig::local(name, external_address, &format!("{name}.example.test"))
}

/// Orchestrator over an in-memory database and a [`MockConnector`].
pub async fn test_orchestrator() -> (Orchestrator, Arc<MockConnector>) {
    let connector = Arc::new(MockConnector::default());
    let orchestrator = Orchestrator::builder(create_test_db().await, connector.clone()).build();
    (orchestrator, connector)
}

/// A call received by [`MockRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Create(String),
    Start(String),
    Stop(String, u32),
    Remove(String, RemoveOptions),
    Inspect(String),
    Pull(String),
    Version,
}

/// Scripted runtime that keeps container state in memory.
#[derive(Default)]
pub struct MockRuntime {
    calls: Mutex<Vec<RuntimeCall>>,
    specs: Mutex<Vec<ContainerSpec>>,
    containers: Mutex<HashMap<String, ContainerStatus>>,
    next_id: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub fail_remove: AtomicBool,
    pub fail_inspect: AtomicBool,
    pub fail_pull: AtomicBool,
    pub fail_version: AtomicBool,
    version_delay: Mutex<Option<Duration>>,
}

impl MockRuntime {
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().expect("mock lock poisoned").clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().expect("mock lock poisoned").clear();
    }

    /// Specs of every created container, in order.
    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.specs.lock().expect("mock lock poisoned").clone()
    }

    pub fn container_status(&self, id: &str) -> Option<ContainerStatus> {
        self.containers
            .lock()
            .expect("mock lock poisoned")
            .get(id)
            .cloned()
    }

    /// Override the live state of a container, e.g. to simulate a crash.
    pub fn set_status(&self, id: &str, status: ContainerStatus) {
        self.containers
            .lock()
            .expect("mock lock poisoned")
            .insert(id.to_string(), status);
    }

    /// Make `version` answer only after `delay`, like a slow remote daemon.
    pub fn set_version_delay(&self, delay: Duration) {
        *self.version_delay.lock().expect("mock lock poisoned") = Some(delay);
    }

    pub fn fail(flag: &AtomicBool) {
        flag.store(true, Ordering::SeqCst);
    }

    fn record(&self, call: RuntimeCall) {
        self.calls.lock().expect("mock lock poisoned").push(call);
    }

    fn check(flag: &AtomicBool, operation: &'static str) -> RuntimeResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(RuntimeError::Operation {
                operation,
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn update(&self, id: &str, status: ContainerStatus) -> RuntimeResult<()> {
        let mut containers = self.containers.lock().expect("mock lock poisoned");
        match containers.get_mut(id) {
            Some(current) => {
                *current = status;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.record(RuntimeCall::Create(spec.image.clone()));
        Self::check(&self.fail_create, "create container")?;

        let id = format!("container-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.specs
            .lock()
            .expect("mock lock poisoned")
            .push(spec.clone());
        self.containers
            .lock()
            .expect("mock lock poisoned")
            .insert(id.clone(), ContainerStatus::Created);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.record(RuntimeCall::Start(id.to_string()));
        Self::check(&self.fail_start, "start container")?;
        self.update(id, ContainerStatus::Running)
    }

    async fn stop_container(&self, id: &str, grace_secs: u32) -> RuntimeResult<()> {
        self.record(RuntimeCall::Stop(id.to_string(), grace_secs));
        Self::check(&self.fail_stop, "stop container")?;
        self.update(id, ContainerStatus::Exited)
    }

    async fn remove_container(&self, id: &str, options: RemoveOptions) -> RuntimeResult<()> {
        self.record(RuntimeCall::Remove(id.to_string(), options));
        Self::check(&self.fail_remove, "remove container")?;
        self.containers
            .lock()
            .expect("mock lock poisoned")
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerStatus> {
        self.record(RuntimeCall::Inspect(id.to_string()));
        Self::check(&self.fail_inspect, "inspect container")?;
        self.container_status(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn pull_image(&self, image: &str, tag: &str) -> RuntimeResult<()> {
        self.record(RuntimeCall::Pull(format!("{image}:{tag}")));
        Self::check(&self.fail_pull, "pull image")
    }

    async fn version(&self) -> RuntimeResult<RuntimeVersion> {
        self.record(RuntimeCall::Version);
        let delay = *self.version_delay.lock().expect("mock lock poisoned");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Self::check(&self.fail_version, "version")?;
        Ok(RuntimeVersion {
            version: "mock".to_string(),
            api_version: "1.49".to_string(),
        })
    }
}

/// Hands out one [`MockRuntime`] per host name.
#[derive(Default)]
pub struct MockConnector {
    runtimes: Mutex<HashMap<String, Arc<MockRuntime>>>,
    unreachable: Mutex<HashSet<String>>,
}

impl MockConnector {
    /// Runtime backing the host called `name`, created on first use.
    pub fn runtime(&self, name: &str) -> Arc<MockRuntime> {
        self.runtimes
            .lock()
            .expect("mock lock poisoned")
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Make connections to `name` fail (or succeed again).
    pub fn set_unreachable(&self, name: &str, unreachable: bool) {
        let mut hosts = self.unreachable.lock().expect("mock lock poisoned");
        if unreachable {
            hosts.insert(name.to_string());
        } else {
            hosts.remove(name);
        }
    }
}

#[async_trait]
impl RuntimeConnector for MockConnector {
    async fn connect(&self, config: &HostConfig) -> RuntimeResult<Arc<dyn ContainerRuntime>> {
        if self
            .unreachable
            .lock()
            .expect("mock lock poisoned")
            .contains(&config.name)
        {
            return Err(RuntimeError::Connect {
                endpoint: config.endpoint_label(),
                message: "connection refused".to_string(),
            });
        }

        let runtime: Arc<dyn ContainerRuntime> = self.runtime(&config.name);
        Ok(runtime)
    }
}
