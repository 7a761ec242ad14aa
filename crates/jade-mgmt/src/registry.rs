//! Master-side registry of storage agents.
//!
//! Agents are keyed by URL. Each registered agent gets a random token and a
//! checker that probes it periodically; the probe result drives the agent's
//! connection status and operator notifications.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};
use uuid::Uuid;

use jade_transport::SocketStorageClient;

use crate::checker::{CheckerHealth, ConnectionTester, PeriodicConnectionChecker};
use crate::error::{MgmtError, Result};
use crate::info::{ConnectionStatus, StorageAgentInfo};
use crate::notify::NotificationService;

/// Answers whether a registered agent is reachable.
#[async_trait]
pub trait AgentStatusProbe: Send + Sync {
    /// True when `agent` answered.
    async fn probe(&self, agent: &StorageAgentInfo) -> bool;
}

/// Probes an agent with a socket PING to its connection address.
pub struct SocketPingProbe {
    client: SocketStorageClient,
}

impl SocketPingProbe {
    /// Probe pinging through `client`.
    pub fn new(client: SocketStorageClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AgentStatusProbe for SocketPingProbe {
    async fn probe(&self, agent: &StorageAgentInfo) -> bool {
        match self.client.ping(&agent.connection_info).await {
            Ok(response) => response.is_ok(),
            Err(e) => {
                debug!(agent_url = %agent.agent_url, error = %e, "agent ping failed");
                false
            }
        }
    }
}

/// Probe schedule for registered agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Time between probes.
    pub check_period: Duration,
    /// Delay before the first scheduled probe.
    pub initial_delay: Duration,
    /// Consecutive results needed to flip health.
    pub trip_threshold: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            check_period: Duration::from_secs(60),
            initial_delay: Duration::ZERO,
            trip_threshold: 1,
        }
    }
}

struct ProbeTester {
    probe: Arc<dyn AgentStatusProbe>,
}

#[async_trait]
impl ConnectionTester<StorageAgentInfo> for ProbeTester {
    async fn test_connection(
        &self,
        agent: &StorageAgentInfo,
    ) -> std::result::Result<StorageAgentInfo, StorageAgentInfo> {
        let mut next = agent.clone();
        if self.probe.probe(agent).await {
            next.connection_status = ConnectionStatus::Closed;
            Ok(next)
        } else {
            next.connection_status = ConnectionStatus::Open;
            Err(next)
        }
    }
}

struct RegisteredAgent {
    info: Arc<Mutex<StorageAgentInfo>>,
    checker: PeriodicConnectionChecker<StorageAgentInfo>,
}

impl RegisteredAgent {
    fn snapshot(&self) -> StorageAgentInfo {
        self.info.lock().clone()
    }

    fn token_matches(&self, token: &str) -> bool {
        self.info.lock().registration_token.as_deref() == Some(token)
    }
}

/// Registered storage agents, keyed by agent URL.
pub struct StorageAgentRegistry {
    agents: DashMap<String, Arc<RegisteredAgent>>,
    probe: Arc<dyn AgentStatusProbe>,
    notifier: Arc<dyn NotificationService>,
    config: RegistryConfig,
}

impl StorageAgentRegistry {
    /// Empty registry probing with `probe`.
    pub fn new(
        probe: Arc<dyn AgentStatusProbe>,
        notifier: Arc<dyn NotificationService>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            agents: DashMap::new(),
            probe,
            notifier,
            config,
        }
    }

    /// Registers `agent` unless its URL is already known.
    ///
    /// A new agent gets a fresh token, is marked connected and starts being
    /// probed. A known agent is returned as stored, token unchanged.
    pub fn register_agent(&self, mut agent: StorageAgentInfo) -> StorageAgentInfo {
        match self.agents.entry(agent.agent_url.clone()) {
            Entry::Occupied(existing) => {
                debug!(agent_url = %agent.agent_url, "agent already registered");
                existing.get().snapshot()
            }
            Entry::Vacant(slot) => {
                agent.registration_token = Some(Uuid::new_v4().to_string());
                agent.connection_status = ConnectionStatus::Closed;
                let shared = Arc::new(Mutex::new(agent.clone()));
                let checker = self.new_checker(&agent, Arc::clone(&shared));
                checker.start(self.config.initial_delay, self.config.check_period);
                slot.insert(Arc::new(RegisteredAgent {
                    info: shared,
                    checker,
                }));
                info!(
                    agent_id = %agent.agent_id,
                    agent_url = %agent.agent_url,
                    connection_info = %agent.connection_info,
                    "agent registered"
                );
                agent
            }
        }
    }

    fn new_checker(
        &self,
        agent: &StorageAgentInfo,
        shared: Arc<Mutex<StorageAgentInfo>>,
    ) -> PeriodicConnectionChecker<StorageAgentInfo> {
        let url = agent.agent_url.clone();
        let tester = Arc::new(ProbeTester {
            probe: Arc::clone(&self.probe),
        });
        let (up_info, up_notifier, up_url) = (Arc::clone(&shared), Arc::clone(&self.notifier), url.clone());
        let (down_info, down_notifier, down_url) = (shared, Arc::clone(&self.notifier), url.clone());
        PeriodicConnectionChecker::new(format!("agent {}", url), agent.clone(), tester, self.config.trip_threshold)
            .on_success(move |_| {
                let mut info = up_info.lock();
                if info.connection_status != ConnectionStatus::Closed {
                    up_notifier.send_notification(
                        &format!("Master reconnected to {}", up_url),
                        &format!("Agent {} at {} answers again", info.agent_id, up_url),
                    );
                }
                info.connection_status = ConnectionStatus::Closed;
            })
            .on_failure(move |_| {
                let mut info = down_info.lock();
                info.connection_status = ConnectionStatus::Open;
                down_notifier.send_notification(
                    &format!("Master lost connection to {}", down_url),
                    &format!("Agent {} at {} does not answer", info.agent_id, down_url),
                );
            })
    }

    /// Replaces the token of `agent_url` if it still equals `expected`.
    pub fn update_token(&self, agent_url: &str, expected: &str, new_token: &str) -> bool {
        let Some(agent) = self.agents.get(agent_url).map(|a| Arc::clone(a.value())) else {
            return false;
        };
        let mut info = agent.info.lock();
        if info.registration_token.as_deref() == Some(expected) {
            info.registration_token = Some(new_token.to_string());
            true
        } else {
            false
        }
    }

    /// Removes `agent_url` when `token` matches its registration token.
    ///
    /// `Ok(None)` when the agent is unknown.
    pub fn deregister_agent(&self, agent_url: &str, token: &str) -> Result<Option<StorageAgentInfo>> {
        match self.agents.remove_if(agent_url, |_, agent| agent.token_matches(token)) {
            Some((_, agent)) => {
                agent.checker.dispose();
                info!(agent_url = %agent_url, "agent deregistered");
                Ok(Some(agent.snapshot()))
            }
            None if self.agents.contains_key(agent_url) => {
                warn!(agent_url = %agent_url, "deregistration refused: token mismatch");
                Err(MgmtError::InvalidToken {
                    url: agent_url.to_string(),
                })
            }
            None => Ok(None),
        }
    }

    /// Snapshot of the agent registered under `agent_url`.
    pub fn find_registered_agent(&self, agent_url: &str) -> Option<StorageAgentInfo> {
        self.agents.get(agent_url).map(|agent| agent.snapshot())
    }

    /// Registered agents accepted by `predicate`.
    pub fn registered_agents<P>(&self, predicate: P) -> Vec<StorageAgentInfo>
    where
        P: Fn(&StorageAgentInfo) -> bool,
    {
        self.agents
            .iter()
            .map(|agent| agent.snapshot())
            .filter(|info| predicate(info))
            .collect()
    }

    /// A uniformly random agent among those accepted by `predicate`.
    pub fn find_random_registered_agent<P>(&self, predicate: P) -> Option<StorageAgentInfo>
    where
        P: Fn(&StorageAgentInfo) -> bool,
    {
        self.registered_agents(predicate)
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    /// Probes `agent_url` now, outside the schedule.
    pub async fn check_agent(&self, agent_url: &str) -> Option<CheckerHealth> {
        let agent = self.agents.get(agent_url).map(|a| Arc::clone(a.value()))?;
        Some(agent.checker.tick().await)
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// True with no registered agents.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Stops probing and forgets every agent.
    pub fn shutdown(&self) {
        for agent in self.agents.iter() {
            agent.checker.dispose();
        }
        self.agents.clear();
        info!("agent registry shut down");
    }
}

impl std::fmt::Debug for StorageAgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAgentRegistry")
            .field("agents", &self.agents.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::InMemoryNotificationService;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Switch(AtomicBool);

    #[async_trait]
    impl AgentStatusProbe for Switch {
        async fn probe(&self, _agent: &StorageAgentInfo) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn registry() -> (StorageAgentRegistry, Arc<Switch>, Arc<InMemoryNotificationService>) {
        let probe = Arc::new(Switch(AtomicBool::new(true)));
        let notifier = Arc::new(InMemoryNotificationService::new());
        let config = RegistryConfig {
            check_period: Duration::from_secs(3600),
            initial_delay: Duration::from_secs(3600),
            trip_threshold: 1,
        };
        let registry = StorageAgentRegistry::new(probe.clone(), notifier.clone(), config);
        (registry, probe, notifier)
    }

    fn agent(url: &str) -> StorageAgentInfo {
        StorageAgentInfo::new("a-1", url, "127.0.0.1:10000")
    }

    #[tokio::test]
    async fn test_register_assigns_token_once() {
        let (registry, _, _) = registry();
        let first = registry.register_agent(agent("http://a1:8881"));
        assert!(first.registration_token.is_some());
        assert!(first.is_connected());

        let again = registry.register_agent(agent("http://a1:8881"));
        assert_eq!(again.registration_token, first.registration_token);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_token_compare_and_swap() {
        let (registry, _, _) = registry();
        let token = registry
            .register_agent(agent("http://a1:8881"))
            .registration_token
            .unwrap();
        assert!(!registry.update_token("http://a1:8881", "stale", "next"));
        assert!(registry.update_token("http://a1:8881", &token, "next"));
        assert!(!registry.update_token("http://a1:8881", &token, "other"));
        assert!(!registry.update_token("http://missing:8881", "next", "x"));
        let info = registry.find_registered_agent("http://a1:8881").unwrap();
        assert_eq!(info.registration_token.as_deref(), Some("next"));
    }

    #[tokio::test]
    async fn test_deregister_requires_token() {
        let (registry, _, _) = registry();
        let token = registry
            .register_agent(agent("http://a1:8881"))
            .registration_token
            .unwrap();

        let err = registry.deregister_agent("http://a1:8881", "wrong").unwrap_err();
        assert!(matches!(err, MgmtError::InvalidToken { .. }));
        assert!(registry.find_registered_agent("http://a1:8881").is_some());

        let removed = registry.deregister_agent("http://a1:8881", &token).unwrap();
        assert!(removed.is_some());
        assert!(registry.is_empty());
        assert!(registry.deregister_agent("http://a1:8881", &token).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_probe_failures_notify_on_edges() {
        let (registry, probe, notifier) = registry();
        let url = "http://a1:8881";
        registry.register_agent(agent(url));

        registry.check_agent(url).await;
        assert_eq!(notifier.notifications().len(), 0);

        probe.0.store(false, Ordering::SeqCst);
        for _ in 0..3 {
            registry.check_agent(url).await;
        }
        assert_eq!(notifier.count_matching("Master lost connection to"), 1);
        assert!(!registry.find_registered_agent(url).unwrap().is_connected());

        probe.0.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            registry.check_agent(url).await;
        }
        assert_eq!(notifier.count_matching("Master reconnected to"), 1);
        assert!(registry.find_registered_agent(url).unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_random_agent_honors_predicate() {
        let (registry, _, _) = registry();
        for i in 0..5 {
            let mut info = agent(&format!("http://a{}:8881", i));
            info.agent_id = format!("a-{}", i);
            registry.register_agent(info);
        }
        for _ in 0..20 {
            let picked = registry
                .find_random_registered_agent(|a| a.agent_id == "a-3")
                .unwrap();
            assert_eq!(picked.agent_url, "http://a3:8881");
        }
        assert!(registry.find_random_registered_agent(|a| a.agent_id == "zz").is_none());
        assert_eq!(registry.registered_agents(|_| true).len(), 5);

        registry.shutdown();
        assert!(registry.is_empty());
    }
}
