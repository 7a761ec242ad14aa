//! Agent descriptions exchanged with the master.

use std::collections::BTreeSet;

use jade_storage::StorageVolume;
use serde::{Deserialize, Serialize};

/// Served-volume entry matching every shared volume.
pub const ALL_VOLUMES: &str = "*";

/// State of an agent-to-master connection. `Closed` is the healthy state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    /// Not registered, or the last check failed.
    #[default]
    Open,
    /// Registered and answering.
    Closed,
}

impl ConnectionStatus {
    /// True for `Closed`.
    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Closed
    }
}

/// What an agent tells the master about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageAgentInfo {
    /// Agent identity.
    pub agent_id: String,
    /// Registry key.
    pub agent_url: String,
    /// Socket protocol address, `host:port`.
    pub connection_info: String,
    /// Shared volume names served; `*` serves all.
    #[serde(default)]
    pub served_volumes: BTreeSet<String>,
    /// Volumes the agent reports it cannot reach.
    #[serde(default)]
    pub unavailable_volume_ids: BTreeSet<u64>,
    /// Link state as seen by the reporter.
    #[serde(default)]
    pub connection_status: ConnectionStatus,
    /// Consecutive failed checks.
    #[serde(default)]
    pub connection_attempts: u32,
    /// Token issued by the master on registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_token: Option<String>,
}

impl StorageAgentInfo {
    /// Agent info with nothing served and no token.
    pub fn new(
        agent_id: impl Into<String>,
        agent_url: impl Into<String>,
        connection_info: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_url: agent_url.into(),
            connection_info: connection_info.into(),
            served_volumes: BTreeSet::new(),
            unavailable_volume_ids: BTreeSet::new(),
            connection_status: ConnectionStatus::Open,
            connection_attempts: 0,
            registration_token: None,
        }
    }

    /// Adds served shared volume names.
    pub fn with_served_volumes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.served_volumes = names.into_iter().map(Into::into).collect();
        self
    }

    /// True when the connection status is `Closed`.
    pub fn is_connected(&self) -> bool {
        self.connection_status.is_connected()
    }

    /// True when the agent may store data on a shared volume named `name`.
    pub fn serves_volume_name(&self, name: &str) -> bool {
        self.served_volumes.contains(ALL_VOLUMES) || self.served_volumes.contains(name)
    }

    /// True when the agent owns `volume`, or serves it as a shared volume,
    /// and has not reported it unavailable.
    pub fn can_serve(&self, volume: &StorageVolume) -> bool {
        if self.unavailable_volume_ids.contains(&volume.id) {
            return false;
        }
        match &volume.storage_agent_id {
            Some(owner) if !volume.shared => owner == &self.agent_id,
            _ => self.serves_volume_name(&volume.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let mut info = StorageAgentInfo::new("a-1", "http://a1:8881", "a1:10000").with_served_volumes(["nrs"]);
        info.registration_token = Some("tok".to_string());
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["agentUrl"], "http://a1:8881");
        assert_eq!(json["connectionStatus"], "OPEN");
        assert_eq!(json["registrationToken"], "tok");
        let back: StorageAgentInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_can_serve() {
        let mut info = StorageAgentInfo::new("a-1", "http://a1:8881", "a1:10000").with_served_volumes(["nrs"]);
        let own = StorageVolume::new(1, "local", "/a").owned_by("a-1");
        let other = StorageVolume::new(2, "local-b", "/b").owned_by("a-2");
        let shared = StorageVolume::new(3, "nrs", "/nrs");
        let unknown = StorageVolume::new(4, "tape", "/tape");
        assert!(info.can_serve(&own));
        assert!(!info.can_serve(&other));
        assert!(info.can_serve(&shared));
        assert!(!info.can_serve(&unknown));

        info.unavailable_volume_ids.insert(3);
        assert!(!info.can_serve(&shared));
        info.served_volumes.insert(ALL_VOLUMES.to_string());
        assert!(info.can_serve(&unknown));
    }
}
