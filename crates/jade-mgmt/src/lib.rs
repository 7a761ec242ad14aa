#![warn(missing_docs)]

//! JADE management subsystem: agent registration and connection monitoring,
//! distributed storage allocation, master API and the `jade` CLI.

pub mod agent;
pub mod allocator;
pub mod api;
pub mod checker;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod info;
pub mod master;
pub mod notify;
pub mod registry;

pub use agent::{AgentConnection, AgentConnectionState, ConnectionCheckConfig};
pub use allocator::{BundleAccounting, DistributedStorageAllocator};
pub use api::MasterApi;
pub use checker::{CheckerHealth, ConnectionTester, PeriodicConnectionChecker};
pub use config::{AgentConfig, JadeConfig, MasterConfig, TransferConfig};
pub use daemon::{run_agent, run_master, storage_client};
pub use error::{MgmtError, Result};
pub use info::{ConnectionStatus, StorageAgentInfo, ALL_VOLUMES};
pub use master::{HttpMasterClient, InProcessMasterClient, MasterClient, AGENT_TOKEN_HEADER};
pub use notify::{
    InMemoryNotificationService, LogNotificationService, Notification, NotificationService,
    WebhookNotificationService,
};
pub use registry::{AgentStatusProbe, RegistryConfig, SocketPingProbe, StorageAgentRegistry};
