//! Master and agent wired together over loopback: HTTP registration, socket
//! probes, and bundle accounting for persisted transfers.

use std::sync::Arc;
use std::time::Duration;

use jade_mgmt::{
    storage_client, AgentConnection, BundleAccounting, CheckerHealth, ConnectionCheckConfig,
    DistributedStorageAllocator, HttpMasterClient, InMemoryNotificationService, InProcessMasterClient,
    MasterApi, RegistryConfig, SocketPingProbe, StorageAgentInfo, StorageAgentRegistry, TransferConfig,
};
use jade_storage::{
    BundleDao, BundleIoProvider, DataBundle, InMemoryBundleDao, InMemoryVolumeDao, StorageFormat,
    StorageVolume,
};
use jade_transport::{
    AcceptAnyToken, DataTransferEngine, DataTransferTarget, StorageAgentListener,
    TransferObserver,
};
use tokio_util::sync::CancellationToken;

const AGENT_URL: &str = "http://agent-a:8881";

fn transfer() -> TransferConfig {
    TransferConfig {
        pipe_capacity: 4,
        chunk_size: 1024,
        worker_threads: 2,
        select_timeout_ms: 500,
        max_consecutive_timeouts: 4,
        connect_timeout_ms: 1000,
    }
}

fn manual_checks() -> RegistryConfig {
    RegistryConfig {
        check_period: Duration::from_secs(3600),
        initial_delay: Duration::from_secs(3600),
        trip_threshold: 1,
    }
}

struct RunningAgent {
    addr: String,
    shutdown: CancellationToken,
}

impl Drop for RunningAgent {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_agent(observer: Option<Arc<dyn TransferObserver>>) -> RunningAgent {
    let config = transfer();
    let listener = StorageAgentListener::bind(
        config.listener("127.0.0.1:0"),
        DataTransferEngine::new(Arc::new(BundleIoProvider::default()), config.engine()),
        Arc::new(AcceptAnyToken),
    )
    .await
    .unwrap();
    let listener = match observer {
        Some(observer) => listener.with_observer(observer),
        None => listener,
    };
    let addr = listener.local_addr().unwrap().to_string();
    let shutdown = CancellationToken::new();
    tokio::spawn(listener.run(shutdown.clone()));
    RunningAgent { addr, shutdown }
}

async fn start_master(registry: Arc<StorageAgentRegistry>) -> (String, CancellationToken) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let router = Arc::new(MasterApi::new(registry, "127.0.0.1:0")).router();
    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
            .unwrap();
    });
    (url, shutdown)
}

#[tokio::test]
async fn agent_registers_over_http_and_master_tracks_liveness() {
    let agent = start_agent(None).await;
    let master_notes = Arc::new(InMemoryNotificationService::new());
    let registry = Arc::new(StorageAgentRegistry::new(
        Arc::new(SocketPingProbe::new(storage_client(&transfer()))),
        master_notes.clone(),
        manual_checks(),
    ));
    let (master_url, master_shutdown) = start_master(registry.clone()).await;

    let connection = AgentConnection::new(
        StorageAgentInfo::new("agent-a", AGENT_URL, agent.addr.clone()).with_served_volumes(["nrs"]),
        Arc::new(HttpMasterClient::new()),
        Arc::new(InMemoryNotificationService::new()),
        ConnectionCheckConfig {
            period: Duration::from_secs(3600),
            initial_delay: Duration::from_secs(3600),
            trip_threshold: 1,
        },
    );
    connection.connect_to(&master_url).await.unwrap();
    assert_eq!(connection.check_now().await, Some(CheckerHealth::Healthy));

    let local = connection.local_agent_info().await;
    let registered = registry.find_registered_agent(AGENT_URL).unwrap();
    assert!(local.registration_token.is_some());
    assert_eq!(local.registration_token, registered.registration_token);
    assert!(registered.serves_volume_name("nrs"));

    assert_eq!(connection.check_now().await, Some(CheckerHealth::Healthy));
    assert_eq!(registry.check_agent(AGENT_URL).await, Some(CheckerHealth::Healthy));
    assert!(master_notes.notifications().is_empty());

    drop(agent);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(registry.check_agent(AGENT_URL).await, Some(CheckerHealth::Unhealthy));
    assert_eq!(registry.check_agent(AGENT_URL).await, Some(CheckerHealth::Unhealthy));
    assert_eq!(master_notes.count_matching("Master lost connection to"), 1);
    assert!(!registry.find_registered_agent(AGENT_URL).unwrap().is_connected());

    connection.disconnect().await;
    assert!(registry.find_registered_agent(AGENT_URL).is_none());

    registry.shutdown();
    master_shutdown.cancel();
}

#[tokio::test]
async fn allocated_bundle_is_accounted_after_persist() {
    let root = tempfile::tempdir().unwrap();
    let volumes = Arc::new(InMemoryVolumeDao::new([StorageVolume::new(
        7,
        "local",
        root.path().join("${username}").to_string_lossy().to_string(),
    )
    .owned_by("agent-a")]));
    let bundles = Arc::new(InMemoryBundleDao::new());
    let registry = Arc::new(StorageAgentRegistry::new(
        Arc::new(SocketPingProbe::new(storage_client(&transfer()))),
        Arc::new(InMemoryNotificationService::new()),
        manual_checks(),
    ));
    let allocator = Arc::new(DistributedStorageAllocator::new(
        registry.clone(),
        volumes,
        bundles.clone(),
    ));
    let agent = start_agent(Some(Arc::new(BundleAccounting::new(allocator.clone())))).await;

    let connection = AgentConnection::new(
        StorageAgentInfo::new("agent-a", AGENT_URL, agent.addr.clone()),
        Arc::new(InProcessMasterClient::new(registry.clone())),
        Arc::new(InMemoryNotificationService::new()),
        ConnectionCheckConfig::default(),
    );
    connection.connect_to("in-process").await.unwrap();
    assert_eq!(connection.check_now().await, Some(CheckerHealth::Healthy));

    let bundle = allocator
        .allocate_storage(
            "user:jdoe",
            DataBundle::new("", "sample", StorageFormat::SingleDataFile),
        )
        .unwrap()
        .unwrap();
    let id = bundle.id.unwrap();
    let remote = bundle.path.clone().unwrap();
    assert!(remote.starts_with(root.path().join("jdoe")));

    let local = tempfile::tempdir().unwrap();
    let source = local.path().join("sample.bin");
    std::fs::write(&source, b"0123456789").unwrap();

    let target = DataTransferTarget::new(
        agent.addr.clone(),
        remote.to_string_lossy(),
        StorageFormat::SingleDataFile,
    )
    .with_bundle_id(id);
    let response = storage_client(&transfer())
        .persist_data(&source, &target)
        .await
        .unwrap();
    assert!(response.is_ok(), "{}", response.message);
    assert_eq!(std::fs::read(&remote).unwrap(), b"0123456789");

    let stored = bundles.find_bundle_by_id(id).unwrap().unwrap();
    assert_eq!(stored.used_space_bytes, Some(10));
    assert_eq!(stored.checksum.as_ref().map(String::len), Some(64));

    connection.disconnect().await;
    assert!(registry.is_empty());
}
