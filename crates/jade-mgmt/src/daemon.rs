//! Wiring for the long-running master and agent processes.

use std::sync::Arc;

use jade_storage::BundleIoProvider;
use jade_transport::{
    AcceptAnyToken, DataTransferEngine, JwtTokenValidator, SocketStorageClient, StorageAgentListener,
    TokenValidator,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::AgentConnection;
use crate::api::MasterApi;
use crate::config::{JadeConfig, TransferConfig};
use crate::info::StorageAgentInfo;
use crate::master::HttpMasterClient;
use crate::notify::{LogNotificationService, NotificationService, WebhookNotificationService};
use crate::registry::{SocketPingProbe, StorageAgentRegistry};

fn notifier(webhook_url: Option<&str>) -> Arc<dyn NotificationService> {
    match webhook_url {
        Some(url) => Arc::new(WebhookNotificationService::new(url)),
        None => Arc::new(LogNotificationService),
    }
}

fn engine(transfer: &TransferConfig) -> DataTransferEngine {
    DataTransferEngine::new(Arc::new(BundleIoProvider::default()), transfer.engine())
}

/// Socket client tuned by `transfer`.
pub fn storage_client(transfer: &TransferConfig) -> SocketStorageClient {
    SocketStorageClient::new(engine(transfer), transfer.client())
}

/// Runs the master until `shutdown` is cancelled.
pub async fn run_master(config: JadeConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let probe = Arc::new(SocketPingProbe::new(storage_client(&config.transfer)));
    let registry = Arc::new(StorageAgentRegistry::new(
        probe,
        notifier(config.master.webhook_url.as_deref()),
        config.master.registry(),
    ));
    info!(bind_addr = %config.master.bind_addr, "starting master");

    let result = MasterApi::new(Arc::clone(&registry), config.master.bind_addr.clone())
        .serve(shutdown)
        .await;
    registry.shutdown();
    result
}

/// Runs a storage agent until `shutdown` is cancelled, then deregisters it.
pub async fn run_agent(config: JadeConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let agent = &config.agent;
    let validator: Arc<dyn TokenValidator> = match &agent.token_secret {
        Some(secret) => Arc::new(JwtTokenValidator::new(secret.as_bytes())),
        None => Arc::new(AcceptAnyToken),
    };
    let listener = StorageAgentListener::bind(
        config.transfer.listener(&agent.listener_addr),
        engine(&config.transfer),
        validator,
    )
    .await?;
    let connection_info = match &agent.connection_info {
        Some(advertised) => advertised.clone(),
        None => listener.local_addr()?.to_string(),
    };
    let identity = StorageAgentInfo::new(agent.agent_id.clone(), agent.agent_url.clone(), connection_info)
        .with_served_volumes(agent.served_volumes.iter().cloned());

    let connection = AgentConnection::new(
        identity,
        Arc::new(HttpMasterClient::new()),
        notifier(agent.webhook_url.as_deref()),
        agent.connection_checks(),
    );
    if let Some(master_url) = &agent.master_url {
        connection.connect_to(master_url).await?;
    }

    let metrics = listener.metrics();
    info!(agent_id = %agent.agent_id, "storage agent running");
    let result = listener.run(shutdown).await;

    connection.disconnect().await;
    let snapshot = metrics.snapshot();
    info!(
        connections = snapshot.connections_accepted,
        persists = snapshot.persists_served,
        retrieves = snapshot.retrieves_served,
        failures = snapshot.transfers_failed,
        "storage agent stopped"
    );
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_agent_stops_on_shutdown() {
        let mut config = JadeConfig::default();
        config.agent.listener_addr = "127.0.0.1:0".to_string();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_agent(config, shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_master_stops_on_shutdown() {
        let mut config = JadeConfig::default();
        config.master.bind_addr = "127.0.0.1:0".to_string();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_master(config, shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
