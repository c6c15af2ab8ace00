//! Integration tests for space provisioning
//!
//! Covers the event stream, persisted state after each outcome, placement
//! and the container spec handed to the runtime.

use async_trait::async_trait;
use space_orchestrator::db::{create_pool, run_migrations};
use space_orchestrator::runtime::Protocol;
use space_orchestrator::store::NewSpace;
use space_orchestrator::test_utils::{
    create_test_db, seed_image, test_host, test_orchestrator, MockConnector, MockRuntime,
};
use space_orchestrator::{
    Orchestrator, OrchestratorError, ProvisionRequest, QuotaPolicy, SpaceStatus, SpaceStore,
    StateReconciler,
};
use std::sync::Arc;
use std::time::Duration;

struct DenyAll;

#[async_trait]
impl QuotaPolicy for DenyAll {
    async fn under_quota(&self, _owner_id: &str) -> bool {
        false
    }
}

#[tokio::test]
async fn test_provision_happy_path() {
    let (orchestrator, _connector) = test_orchestrator().await;
    let image = seed_image(orchestrator.store()).await;
    orchestrator
        .add_host(test_host("alpha", "10.0.0.1"))
        .await
        .expect("Failed to add host");

    let handle = orchestrator.provision(ProvisionRequest::new(&image.id, "alice", "dev"));
    let lines = handle.events.collect_lines().await;
    let space = handle
        .outcome
        .await
        .expect("task panicked")
        .expect("provisioning failed");

    assert_eq!(
        lines,
        vec!["Host Chosen", "Ports Secured", "Container Created", "Creation Complete"]
    );
    assert_eq!(space.status, SpaceStatus::Running);
    assert!(space.keep_alive);
    assert!(space.has_container());

    let stored = orchestrator.get_space(&space.id).await.unwrap();
    assert_eq!(stored.status, SpaceStatus::Running);
    assert_eq!(stored.container_id, space.container_id);
    assert_eq!(stored.port_links.len(), 2);

    let ssh = stored.port_for(22).expect("ssh port link");
    let service = stored.port_for(1337).expect("service port link");
    assert_ne!(ssh.external_port, service.external_port);
    assert_eq!(ssh.external_address, "10.0.0.1");
    assert_eq!(ssh.display_address, "alpha.example.test");
}

#[tokio::test]
async fn test_container_spec_binds_loopback_ports() {
    let (orchestrator, connector) = test_orchestrator().await;
    let image = seed_image(orchestrator.store()).await;
    orchestrator.add_host(test_host("alpha", "10.0.0.1")).await.unwrap();

    let handle = orchestrator.provision(ProvisionRequest::new(&image.id, "alice", "dev"));
    let _ = handle.events.collect_lines().await;
    let space = handle.outcome.await.unwrap().unwrap();

    let specs = connector.runtime("alpha").created_specs();
    assert_eq!(specs.len(), 1);
    let spec = &specs[0];

    assert_eq!(spec.image, "userspace/ubuntu:latest");
    assert_eq!(spec.labels.get("space.id"), Some(&space.id));
    assert_eq!(spec.labels.get("space.owner").map(String::as_str), Some("alice"));
    assert_eq!(spec.exposed_ports(), vec!["22/tcp", "1337/tcp", "1337/udp"]);
    assert!(spec.bindings.iter().all(|b| b.host_ip == "127.0.0.1"));

    let service_port = space.port_for(1337).unwrap().external_port;
    let udp = spec
        .bindings
        .iter()
        .find(|b| b.protocol == Protocol::Udp)
        .unwrap();
    assert_eq!(udp.host_port, service_port);
}

#[tokio::test]
async fn test_inactive_image_is_rejected_without_record() {
    let (orchestrator, _connector) = test_orchestrator().await;
    orchestrator.add_host(test_host("alpha", "10.0.0.1")).await.unwrap();
    let image = orchestrator
        .store()
        .create_image("ubuntu-base", "Inactive base", "userspace/ubuntu-base", "latest", false)
        .await
        .unwrap();

    let handle = orchestrator.provision(ProvisionRequest::new(&image.id, "alice", "dev"));
    let lines = handle.events.collect_lines().await;
    let outcome = handle.outcome.await.unwrap();

    assert_eq!(lines, vec!["Error: Invalid Image"]);
    assert!(matches!(outcome, Err(OrchestratorError::InvalidImage(_))));
    assert!(orchestrator.list_spaces(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_image_is_rejected() {
    let (orchestrator, _connector) = test_orchestrator().await;
    orchestrator.add_host(test_host("alpha", "10.0.0.1")).await.unwrap();

    let handle = orchestrator.provision(ProvisionRequest::new("missing", "alice", "dev"));
    let lines = handle.events.collect_lines().await;

    assert_eq!(lines, vec!["Error: Invalid Image"]);
    assert!(handle.outcome.await.unwrap().is_err());
}

#[tokio::test]
async fn test_no_hosts_fails_before_persisting() {
    let (orchestrator, _connector) = test_orchestrator().await;
    let image = seed_image(orchestrator.store()).await;

    let handle = orchestrator.provision(ProvisionRequest::new(&image.id, "alice", "dev"));
    let lines = handle.events.collect_lines().await;
    let err = handle.outcome.await.unwrap().unwrap_err();

    assert_eq!(lines, vec!["Error: No Hosts Available"]);
    assert!(matches!(err, OrchestratorError::NoHostsAvailable));
    assert_eq!(err.to_string(), "no hosts available");
    assert!(err.is_rejection());
    assert!(orchestrator.list_spaces(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_quota_rejection() {
    let connector = Arc::new(MockConnector::default());
    let orchestrator = Orchestrator::builder(create_test_db().await, connector)
        .quota(Arc::new(DenyAll))
        .build();
    let image = seed_image(orchestrator.store()).await;
    orchestrator.add_host(test_host("alpha", "10.0.0.1")).await.unwrap();

    let handle = orchestrator.provision(ProvisionRequest::new(&image.id, "alice", "dev"));
    let lines = handle.events.collect_lines().await;

    assert_eq!(lines, vec!["Error: Quota Exceeded"]);
    assert!(matches!(
        handle.outcome.await.unwrap(),
        Err(OrchestratorError::QuotaExceeded(owner)) if owner == "alice"
    ));
    assert!(orchestrator.list_spaces(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_start_failure_still_completes() {
    let (orchestrator, connector) = test_orchestrator().await;
    let image = seed_image(orchestrator.store()).await;
    orchestrator.add_host(test_host("alpha", "10.0.0.1")).await.unwrap();
    MockRuntime::fail(&connector.runtime("alpha").fail_start);

    let handle = orchestrator.provision(ProvisionRequest::new(&image.id, "alice", "dev"));
    let lines = handle.events.collect_lines().await;
    let space = handle.outcome.await.unwrap().expect("start failure is not an error");

    assert_eq!(lines.last().map(String::as_str), Some("Creation Complete"));
    assert_eq!(space.status, SpaceStatus::ErrorStarting);
    assert_eq!(
        orchestrator.get_space(&space.id).await.unwrap().status,
        SpaceStatus::ErrorStarting
    );
}

#[tokio::test]
async fn test_create_failure_keeps_record() {
    let (orchestrator, connector) = test_orchestrator().await;
    let image = seed_image(orchestrator.store()).await;
    orchestrator.add_host(test_host("alpha", "10.0.0.1")).await.unwrap();
    MockRuntime::fail(&connector.runtime("alpha").fail_create);

    let handle = orchestrator.provision(ProvisionRequest::new(&image.id, "alice", "dev"));
    let lines = handle.events.collect_lines().await;
    let outcome = handle.outcome.await.unwrap();

    assert_eq!(
        lines,
        vec!["Host Chosen", "Ports Secured", "Error: Error Creating Container"]
    );
    assert!(matches!(outcome, Err(OrchestratorError::Runtime(_))));

    let spaces = orchestrator.list_spaces(Some("alice")).await.unwrap();
    assert_eq!(spaces.len(), 1);
    assert_eq!(spaces[0].status, SpaceStatus::ErrorCreating);
    assert!(!spaces[0].has_container());
}

#[tokio::test]
async fn test_port_exhaustion_marks_error_creating() {
    let connector = Arc::new(MockConnector::default());
    let orchestrator = Orchestrator::builder(create_test_db().await, connector)
        .port_range(space_orchestrator::PortRange::new(20000, 20000).unwrap())
        .max_port_attempts(8)
        .build();
    let image = seed_image(orchestrator.store()).await;
    orchestrator.add_host(test_host("alpha", "10.0.0.1")).await.unwrap();

    let handle = orchestrator.provision(ProvisionRequest::new(&image.id, "alice", "dev"));
    let lines = handle.events.collect_lines().await;
    let outcome = handle.outcome.await.unwrap();

    assert_eq!(lines, vec!["Host Chosen", "Error: No Ports Available"]);
    assert!(matches!(
        outcome,
        Err(OrchestratorError::NoPortsAvailable { attempts: 8, .. })
    ));

    let spaces = orchestrator.list_spaces(None).await.unwrap();
    assert_eq!(spaces[0].status, SpaceStatus::ErrorCreating);
    assert_eq!(spaces[0].port_links.len(), 1);
}

#[tokio::test]
async fn test_unread_stream_times_out_but_provisioning_finishes() {
    let connector = Arc::new(MockConnector::default());
    let orchestrator = Orchestrator::builder(create_test_db().await, connector)
        .idle_timeout(Duration::from_millis(50))
        .build();
    let image = seed_image(orchestrator.store()).await;
    orchestrator.add_host(test_host("alpha", "10.0.0.1")).await.unwrap();

    let handle = orchestrator.provision(ProvisionRequest::new(&image.id, "alice", "dev"));
    let space = handle
        .outcome
        .await
        .unwrap()
        .expect("provisioning continues without a reader");
    assert_eq!(space.status, SpaceStatus::Running);

    let lines = handle.events.collect_lines().await;
    assert_eq!(lines, vec!["Host Chosen", "Error: Timed Out"]);
}

#[tokio::test]
async fn test_events_follow_persisted_state() {
    let (orchestrator, _connector) = test_orchestrator().await;
    let image = seed_image(orchestrator.store()).await;
    orchestrator.add_host(test_host("alpha", "10.0.0.1")).await.unwrap();

    let chain = [
        SpaceStatus::HostChosen,
        SpaceStatus::PortsSecured,
        SpaceStatus::Created,
        SpaceStatus::Running,
    ];
    let rank = |status: SpaceStatus| chain.iter().position(|s| *s == status).unwrap();

    let mut handle = orchestrator.provision(ProvisionRequest::new(&image.id, "alice", "dev"));
    let mut seen = 0;
    while let Some(event) = handle.events.next().await {
        if event.is_terminal() {
            break;
        }
        // The status an event reports is persisted before the event is sent.
        let spaces = orchestrator.list_spaces(None).await.unwrap();
        assert!(rank(spaces[0].status) >= seen);
        seen += 1;
    }

    assert_eq!(seen, 3);
    handle.outcome.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_least_loaded_host_is_chosen() {
    let (orchestrator, _connector) = test_orchestrator().await;
    let image = seed_image(orchestrator.store()).await;
    let alpha = orchestrator.add_host(test_host("alpha", "10.0.0.1")).await.unwrap();
    let beta = orchestrator.add_host(test_host("beta", "10.0.0.2")).await.unwrap();

    orchestrator
        .store()
        .create_space(NewSpace {
            owner_id: "bob".to_string(),
            name: "existing".to_string(),
            host_id: alpha.id().to_string(),
            image_id: image.id.clone(),
            ssh_key_id: None,
            keep_alive: true,
        })
        .await
        .unwrap();

    let handle = orchestrator.provision(ProvisionRequest::new(&image.id, "alice", "dev"));
    let _ = handle.events.collect_lines().await;
    let space = handle.outcome.await.unwrap().unwrap();
    assert_eq!(space.host_id, beta.id());

    // Tie: first registered wins.
    let handle = orchestrator.provision(ProvisionRequest::new(&image.id, "alice", "second"));
    let _ = handle.events.collect_lines().await;
    let space = handle.outcome.await.unwrap().unwrap();
    assert_eq!(space.host_id, alpha.id());
}

#[tokio::test]
async fn test_disconnected_host_is_never_selected() {
    let (orchestrator, connector) = test_orchestrator().await;
    let image = seed_image(orchestrator.store()).await;
    let alpha = orchestrator.add_host(test_host("alpha", "10.0.0.1")).await.unwrap();
    let beta = orchestrator.add_host(test_host("beta", "10.0.0.2")).await.unwrap();
    orchestrator.registry().mark_disconnected(beta.id()).await.unwrap();

    for i in 0..3 {
        let handle =
            orchestrator.provision(ProvisionRequest::new(&image.id, "alice", &format!("s{i}")));
        let _ = handle.events.collect_lines().await;
        let space = handle.outcome.await.unwrap().unwrap();
        assert_eq!(space.host_id, alpha.id());
    }

    assert!(connector.runtime("beta").created_specs().is_empty());
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("spaces.db");

    let space_id = {
        let pool = create_pool(&db_path).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let store = SpaceStore::new(pool.clone());
        let image = seed_image(&store).await;
        let host = store.insert_host(&test_host("alpha", "10.0.0.1"), true).await.unwrap();

        let mut space = store
            .create_space(NewSpace {
                owner_id: "alice".to_string(),
                name: "dev".to_string(),
                host_id: host.id.clone(),
                image_id: image.id,
                ssh_key_id: None,
                keep_alive: true,
            })
            .await
            .unwrap();
        store.update_status(&mut space, SpaceStatus::HostChosen).await.unwrap();
        store
            .insert_port_link(&space.id, 22, 20005, "10.0.0.1", "alpha.example.test")
            .await
            .unwrap();
        store.update_status(&mut space, SpaceStatus::PortsSecured).await.unwrap();

        // Process dies before the container exists.
        pool.close().await;
        space.id
    };

    let pool = create_pool(&db_path).await.unwrap();
    run_migrations(&pool).await.unwrap();
    let connector = Arc::new(MockConnector::default());
    let orchestrator = Orchestrator::builder(pool, connector.clone()).build();
    assert_eq!(orchestrator.load_hosts().await.unwrap(), 1);

    let space = orchestrator.get_space(&space_id).await.unwrap();
    assert_eq!(space.status, SpaceStatus::PortsSecured);
    assert_eq!(space.port_for(22).unwrap().external_port, 20005);

    // In-creation spaces belong to the provisioner; the reconciler leaves them.
    let reconciler: StateReconciler = orchestrator.reconciler();
    let report = reconciler.reconcile_once().await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.updated, 0);
    assert_eq!(
        orchestrator.get_space(&space_id).await.unwrap().status,
        SpaceStatus::PortsSecured
    );
}
