//! Server registration tests

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use zkzeo::common::{ServerConfig, ZooKeeperConfig};
use zkzeo::{check, Address, Config, MemoryRegistry, RegistrarState, ZkServer};

const ZK: &str = "zookeeper.example.com:2181";
const PATH: &str = "/databases/demo";
const TIMEOUT: Duration = Duration::from_secs(5);

fn config(address: &str, zookeeper: ZooKeeperConfig) -> Config {
    Config {
        server: ServerConfig {
            address: address.to_string(),
        },
        zookeeper,
        client: None,
        log_level: "info".to_string(),
    }
}

fn registered_at(path: &str) -> ZooKeeperConfig {
    ZooKeeperConfig {
        connection: Some(ZK.into()),
        path: Some(path.into()),
        ..ZooKeeperConfig::default()
    }
}

/// A port that was free a moment ago.
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn test_session_timeout_is_passed_to_the_registry() {
    let registry = MemoryRegistry::serving(ZK, &[PATH]);
    let mut zookeeper = registered_at(PATH);
    zookeeper.session_timeout_ms = Some(4242);

    let server = ZkServer::new(config("127.0.0.1:0", zookeeper), Arc::new(registry))
        .start()
        .await
        .unwrap();

    let session = server.registrar().unwrap().session().unwrap();
    assert_eq!(session.session_timeout(), Duration::from_millis(4242));
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_empty_zookeeper_section_runs_unregistered() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(b"[server]\naddress = \"127.0.0.1:0\"\n\n[zookeeper]\n")
        .unwrap();
    let loaded = Config::load(Some(file.path())).unwrap();

    let registry = MemoryRegistry::serving(ZK, &[PATH]);
    let server = ZkServer::new(loaded, Arc::new(registry.clone()))
        .start()
        .await
        .unwrap();

    assert!(server.registrar().is_none());
    assert_ne!(server.local_addr().port(), 0);
    assert_eq!(registry.session_count(), 0);
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_empty_host_registers_a_reachable_address() {
    let registry = MemoryRegistry::serving(ZK, &[PATH]);
    let server = ZkServer::new(config(":0", registered_at(PATH)), Arc::new(registry.clone()))
        .start()
        .await
        .unwrap();

    let nodes = registry.nodes(PATH).unwrap();
    assert_eq!(nodes.len(), 1);
    let registered = Address::parse(&nodes[0].0).unwrap();
    assert!(!registered.is_unspecified());
    assert_eq!(registered.port, server.local_addr().port());
    assert_eq!(server.registrar().unwrap().registered(), Some(registered));

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_fixed_port_waits_for_the_registry() {
    let registry = MemoryRegistry::new();
    registry.create_path(PATH);
    let port = free_port();

    let server = ZkServer::new(
        config(&format!("127.0.0.1:{}", port), registered_at(PATH)),
        Arc::new(registry.clone()),
    )
    .start()
    .await
    .unwrap();

    let registrar = server.registrar().unwrap().clone();
    assert!(registrar.registration().wait);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(registrar.state(), RegistrarState::Registering);
    assert!(registry.nodes(PATH).unwrap().is_empty());

    registry.serve(ZK);
    tokio::time::timeout(TIMEOUT, registrar.wait_for(RegistrarState::Registered))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        registry.nodes(PATH).unwrap()[0].0,
        format!("127.0.0.1:{}", port)
    );

    server.close().await.unwrap();
    assert_eq!(registrar.state(), RegistrarState::Closed);
}

#[tokio::test]
async fn test_missing_path_aborts_ephemeral_startup() {
    let registry = MemoryRegistry::serving(ZK, &["/databases"]);
    let result = ZkServer::new(config("127.0.0.1:0", registered_at(PATH)), Arc::new(registry.clone()))
        .start()
        .await;

    assert!(matches!(result, Err(zkzeo::Error::NoNode(_))));
    assert_eq!(registry.session_count(), 0);
}

#[tokio::test]
async fn test_monitor_guides_the_check() {
    let registry = MemoryRegistry::serving(ZK, &[PATH]);
    let mut zookeeper = registered_at(PATH);
    zookeeper.monitor_server = Some("127.0.0.1".into());

    let server = ZkServer::new(config("127.0.0.1:0", zookeeper), Arc::new(registry.clone()))
        .start()
        .await
        .unwrap();
    // A second, unrelated registration under the same path.
    registry.add_child(PATH, "10.0.0.9:8100").unwrap();

    let monitor = server.registrar().unwrap().monitor_address().unwrap();
    let nodes = registry.nodes(PATH).unwrap();
    let ours = nodes
        .iter()
        .find(|(name, _)| name.starts_with("127.0.0.1:"))
        .unwrap();
    assert_eq!(ours.1["monitor"], format!("127.0.0.1:{}", monitor.port()));

    let (code, report) = check::run(
        Arc::new(registry.clone()),
        ZK,
        PATH,
        None,
        TIMEOUT,
    )
    .await;
    assert_eq!(code, check::CRITICAL);
    assert_eq!(report, "Couldn't find server in ZooKeeper");

    let at = Address::from(monitor);
    let (code, report) = check::run(Arc::new(registry), ZK, PATH, Some(&at), TIMEOUT).await;
    assert_eq!(code, check::OK, "{}", report);
    assert!(report.starts_with(&format!("127.0.0.1:{}", server.local_addr().port())));

    server.close().await.unwrap();
}
