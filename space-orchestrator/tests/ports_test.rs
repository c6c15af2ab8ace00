//! Port reservation against a file-backed database with real concurrency.

use space_orchestrator::db::{create_pool, run_migrations};
use space_orchestrator::store::NewSpace;
use space_orchestrator::test_utils::{seed_image, test_host};
use space_orchestrator::{Host, OrchestratorError, PortAllocator, PortRange, Space, SpaceStore};
use std::collections::HashSet;

async fn file_store(dir: &tempfile::TempDir) -> SpaceStore {
    let pool = create_pool(&dir.path().join("ports.db")).await.unwrap();
    run_migrations(&pool).await.unwrap();
    SpaceStore::new(pool)
}

async fn new_space(store: &SpaceStore, host: &Host, image_id: &str, name: &str) -> Space {
    store
        .create_space(NewSpace {
            owner_id: "alice".to_string(),
            name: name.to_string(),
            host_id: host.id.clone(),
            image_id: image_id.to_string(),
            ssh_key_id: None,
            keep_alive: true,
        })
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservations_never_collide() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir).await;
    let image = seed_image(&store).await;
    let host = store.insert_host(&test_host("alpha", "10.0.0.1"), true).await.unwrap();

    // 20 spaces x 2 ports fill the 40-port range exactly.
    let allocator = PortAllocator::new(store.clone(), PortRange::new(20000, 20039).unwrap());

    let mut tasks = Vec::new();
    for i in 0..20 {
        let mut space = new_space(&store, &host, &image.id, &format!("s{i}")).await;
        let allocator = allocator.clone();
        let host = host.clone();
        tasks.push(tokio::spawn(async move {
            let ssh = allocator.secure(&mut space, &host, 22).await?;
            let service = allocator.secure(&mut space, &host, 1337).await?;
            Ok::<_, OrchestratorError>((ssh.external_port, service.external_port))
        }));
    }

    let mut ports = HashSet::new();
    for task in tasks {
        let (ssh, service) = task.await.unwrap().expect("reservation failed");
        assert!(ports.insert(ssh), "port {ssh} handed out twice");
        assert!(ports.insert(service), "port {service} handed out twice");
    }

    assert_eq!(ports.len(), 40);
    assert!(ports.iter().all(|p| (20000..=20039).contains(p)));
    assert_eq!(store.list_all_port_links().await.unwrap().len(), 40);

    // The range is now full.
    let mut late = new_space(&store, &host, &image.id, "late").await;
    let err = allocator
        .clone()
        .with_max_attempts(50)
        .secure(&mut late, &host, 22)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::NoPortsAvailable { attempts: 50, .. }
    ));
    assert!(late.port_links.is_empty());
}

#[tokio::test]
async fn test_taken_port_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir).await;
    let image = seed_image(&store).await;
    let host = store.insert_host(&test_host("alpha", "10.0.0.1"), true).await.unwrap();

    let first = new_space(&store, &host, &image.id, "first").await;
    store
        .insert_port_link(&first.id, 22, 20000, "10.0.0.1", "alpha.example.test")
        .await
        .unwrap();

    let allocator = PortAllocator::new(store.clone(), PortRange::new(20000, 20001).unwrap());
    let mut second = new_space(&store, &host, &image.id, "second").await;
    let link = allocator.secure(&mut second, &host, 22).await.unwrap();

    assert_eq!(link.external_port, 20001);
    assert_eq!(second.port_links, vec![link]);
}

#[tokio::test]
async fn test_duplicate_pair_is_a_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir).await;
    let image = seed_image(&store).await;
    let host = store.insert_host(&test_host("alpha", "10.0.0.1"), true).await.unwrap();
    let space = new_space(&store, &host, &image.id, "dev").await;

    store
        .insert_port_link(&space.id, 22, 20000, "10.0.0.1", "alpha")
        .await
        .unwrap();
    let err = store
        .insert_port_link(&space.id, 1337, 20000, "10.0.0.1", "alpha")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::PortConflict { port: 20000, .. }
    ));
}

#[tokio::test]
async fn test_same_port_on_different_addresses() {
    let dir = tempfile::tempdir().unwrap();
    let store = file_store(&dir).await;
    let image = seed_image(&store).await;
    let alpha = store.insert_host(&test_host("alpha", "10.0.0.1"), true).await.unwrap();
    let beta = store.insert_host(&test_host("beta", "10.0.0.2"), true).await.unwrap();

    let allocator = PortAllocator::new(store.clone(), PortRange::new(20000, 20000).unwrap());
    let mut on_alpha = new_space(&store, &alpha, &image.id, "a").await;
    let mut on_beta = new_space(&store, &beta, &image.id, "b").await;

    let a = allocator.secure(&mut on_alpha, &alpha, 22).await.unwrap();
    let b = allocator.secure(&mut on_beta, &beta, 22).await.unwrap();

    assert_eq!(a.external_port, 20000);
    assert_eq!(b.external_port, 20000);
    assert_ne!(a.external_address, b.external_address);
}
