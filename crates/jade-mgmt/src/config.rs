//! Configuration files for the master, the agent and transfers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use jade_transport::{ClientConfig, EngineConfig, ListenerConfig, ReadTimeouts};

use crate::agent::ConnectionCheckConfig;
use crate::error::{MgmtError, Result};
use crate::registry::RegistryConfig;

/// Master process settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Registration API address.
    pub bind_addr: String,
    /// Seconds between agent probes.
    pub agent_check_period_secs: u64,
    /// Seconds before the first probe of a new agent.
    pub agent_check_initial_delay_secs: u64,
    /// Consecutive probe results needed to flip agent health.
    pub failure_trip_threshold: u32,
    /// Notifications are posted here when set, logged otherwise.
    pub webhook_url: Option<String>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_addr: String::from("0.0.0.0:8080"),
            agent_check_period_secs: 60,
            agent_check_initial_delay_secs: 0,
            failure_trip_threshold: 1,
            webhook_url: None,
        }
    }
}

impl MasterConfig {
    /// Probe schedule for the registry.
    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            check_period: Duration::from_secs(self.agent_check_period_secs),
            initial_delay: Duration::from_secs(self.agent_check_initial_delay_secs),
            trip_threshold: self.failure_trip_threshold,
        }
    }
}

/// Storage agent settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Identity reported to the master.
    pub agent_id: String,
    /// Registry key on the master.
    pub agent_url: String,
    /// Socket protocol address.
    pub listener_addr: String,
    /// Address advertised to the master; the bound listener address when unset.
    pub connection_info: Option<String>,
    /// Master to register with; standalone when unset.
    pub master_url: Option<String>,
    /// Shared volume names this agent serves.
    pub served_volumes: BTreeSet<String>,
    /// Seconds between master checks.
    pub connection_check_period_secs: u64,
    /// Seconds before the first master check.
    pub connection_check_initial_delay_secs: u64,
    /// Consecutive check results needed to flip master health.
    pub failure_trip_threshold: u32,
    /// HS256 secret; tokens are not checked when unset.
    pub token_secret: Option<String>,
    /// Notifications are posted here when set, logged otherwise.
    pub webhook_url: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: String::from("agent-1"),
            agent_url: String::from("http://localhost:8881"),
            listener_addr: String::from("0.0.0.0:10000"),
            connection_info: None,
            master_url: None,
            served_volumes: BTreeSet::new(),
            connection_check_period_secs: 60,
            connection_check_initial_delay_secs: 30,
            failure_trip_threshold: 1,
            token_secret: None,
            webhook_url: None,
        }
    }
}

impl AgentConfig {
    /// Check schedule for the master connection.
    pub fn connection_checks(&self) -> ConnectionCheckConfig {
        ConnectionCheckConfig {
            period: Duration::from_secs(self.connection_check_period_secs),
            initial_delay: Duration::from_secs(self.connection_check_initial_delay_secs),
            trip_threshold: self.failure_trip_threshold,
        }
    }
}

/// Data transfer tuning shared by agents and clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunks buffered between socket and bundle I/O.
    pub pipe_capacity: usize,
    /// Bytes per chunk.
    pub chunk_size: usize,
    /// Concurrent bundle readers and writers.
    pub worker_threads: usize,
    /// Per-read wait in milliseconds.
    pub select_timeout_ms: u64,
    /// Silent reads tolerated before giving up.
    pub max_consecutive_timeouts: u32,
    /// Connect budget in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: 64,
            chunk_size: 64 * 1024,
            worker_threads: 8,
            select_timeout_ms: 10_000,
            max_consecutive_timeouts: 5,
            connect_timeout_ms: 5000,
        }
    }
}

impl TransferConfig {
    /// Engine settings.
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            pipe_capacity: self.pipe_capacity,
            chunk_size: self.chunk_size,
            worker_threads: self.worker_threads,
        }
    }

    /// Read timeout policy.
    pub fn timeouts(&self) -> ReadTimeouts {
        ReadTimeouts {
            select_timeout: Duration::from_millis(self.select_timeout_ms),
            max_consecutive_timeouts: self.max_consecutive_timeouts,
        }
    }

    /// Socket client settings.
    pub fn client(&self) -> ClientConfig {
        ClientConfig {
            connect_timeout_ms: self.connect_timeout_ms,
            timeouts: self.timeouts(),
            ..ClientConfig::default()
        }
    }

    /// Listener settings bound to `bind_addr`.
    pub fn listener(&self, bind_addr: &str) -> ListenerConfig {
        ListenerConfig {
            bind_addr: bind_addr.to_string(),
            timeouts: self.timeouts(),
            ..ListenerConfig::default()
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JadeConfig {
    /// Master settings.
    pub master: MasterConfig,
    /// Agent settings.
    pub agent: AgentConfig,
    /// Transfer tuning.
    pub transfer: TransferConfig,
}

impl JadeConfig {
    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| MgmtError::Config(e.to_string())),
            "json" => serde_json::from_str(&contents).map_err(|e| MgmtError::Config(e.to_string())),
            _ => Err(MgmtError::Config(format!(
                "Unsupported config file extension: {}",
                ext
            ))),
        }
    }

    /// Loads `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = JadeConfig::default();
        assert_eq!(config.master.agent_check_period_secs, 60);
        assert_eq!(config.master.failure_trip_threshold, 1);
        assert_eq!(config.agent.listener_addr, "0.0.0.0:10000");
        assert_eq!(config.agent.connection_check_initial_delay_secs, 30);
        assert!(config.agent.master_url.is_none());
        assert_eq!(config.transfer.chunk_size, 65536);
        assert_eq!(config.transfer.select_timeout_ms, 10_000);
        assert_eq!(config.transfer.max_consecutive_timeouts, 5);
        assert_eq!(config.master.registry().check_period, Duration::from_secs(60));
        assert_eq!(config.agent.connection_checks().initial_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_transfer_conversions() {
        let transfer = TransferConfig {
            select_timeout_ms: 200,
            max_consecutive_timeouts: 3,
            ..TransferConfig::default()
        };
        assert_eq!(transfer.timeouts().total(), Duration::from_millis(600));
        assert_eq!(transfer.engine().worker_threads, 8);
        assert_eq!(transfer.client().connect_timeout_ms, 5000);
        assert_eq!(transfer.listener("127.0.0.1:0").bind_addr, "127.0.0.1:0");
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "agent": {{
                    "agent_id": "a-7",
                    "agent_url": "http://agent7:8881",
                    "served_volumes": ["nrsFilestore", "*"]
                }},
                "transfer": {{ "worker_threads": 2 }}
            }}"#
        )
        .unwrap();

        let config = JadeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.agent.agent_id, "a-7");
        assert_eq!(config.agent.agent_url, "http://agent7:8881");
        assert!(config.agent.served_volumes.contains("nrsFilestore"));
        assert_eq!(config.agent.listener_addr, "0.0.0.0:10000");
        assert_eq!(config.transfer.worker_threads, 2);
        assert_eq!(config.transfer.pipe_capacity, 64);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[master]
bind_addr = "10.0.0.1:8080"
agent_check_period_secs = 15
webhook_url = "http://hooks:9000/jade"

[agent]
master_url = "http://master:8080"
token_secret = "s3cret"
"#
        )
        .unwrap();

        let config = JadeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.master.bind_addr, "10.0.0.1:8080");
        assert_eq!(config.master.agent_check_period_secs, 15);
        assert_eq!(config.master.webhook_url.as_deref(), Some("http://hooks:9000/jade"));
        assert_eq!(config.agent.master_url.as_deref(), Some("http://master:8080"));
        assert_eq!(config.agent.token_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.transfer, TransferConfig::default());
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        let err = JadeConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Unsupported config file extension"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = JadeConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, JadeConfig::default());
    }
}
