//! Agent-side connection to the master.
//!
//! While disconnected the checker keeps trying to register; once connected
//! it probes the master for the agent's registration and falls back to
//! registering when the master no longer knows it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::checker::{CheckerHealth, ConnectionTester, PeriodicConnectionChecker};
use crate::error::{MgmtError, Result};
use crate::info::{ConnectionStatus, StorageAgentInfo};
use crate::master::MasterClient;
use crate::notify::NotificationService;

/// The agent's view of its link to one master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConnectionState {
    /// Master this state belongs to.
    pub master_url: String,
    /// `Closed` once registered and answering.
    pub status: ConnectionStatus,
    /// Consecutive failed checks.
    pub attempts: u32,
    /// Registration token from the last successful registration.
    pub token: Option<String>,
}

impl AgentConnectionState {
    fn new(master_url: impl Into<String>) -> Self {
        Self {
            master_url: master_url.into(),
            status: ConnectionStatus::Open,
            attempts: 0,
            token: None,
        }
    }
}

/// Check schedule for the master connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionCheckConfig {
    /// Time between checks.
    pub period: Duration,
    /// Delay before the first scheduled check.
    pub initial_delay: Duration,
    /// Consecutive results needed to flip health.
    pub trip_threshold: u32,
}

impl Default for ConnectionCheckConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(60),
            initial_delay: Duration::from_secs(30),
            trip_threshold: 1,
        }
    }
}

struct AgentShared {
    identity: StorageAgentInfo,
    master: Arc<dyn MasterClient>,
    notifier: Arc<dyn NotificationService>,
    /// Token of the registration currently in use.
    adopted_token: Mutex<Option<String>>,
}

impl AgentShared {
    fn registration(&self, state: &AgentConnectionState) -> StorageAgentInfo {
        let mut info = self.identity.clone();
        info.connection_status = state.status;
        info.connection_attempts = state.attempts;
        info.registration_token = state.token.clone();
        info
    }

    /// Switches to `token`; a replaced token means the master re-registered us.
    fn adopt_token(&self, master_url: &str, token: Option<String>) {
        let mut adopted = self.adopted_token.lock();
        if *adopted == token {
            return;
        }
        if adopted.is_some() {
            self.notifier.send_notification(
                &format!("Agent {} reconnected to {}", self.identity.agent_id, master_url),
                &format!("{} registered again with {}", self.identity.agent_url, master_url),
            );
        }
        *adopted = token;
    }

    fn connection_lost(&self, state: &AgentConnectionState) {
        if self.adopted_token.lock().is_none() {
            debug!(master_url = %state.master_url, attempts = state.attempts, "master not reachable yet");
            return;
        }
        self.notifier.send_notification(
            &format!("Agent {} lost connection to {}", self.identity.agent_id, state.master_url),
            &format!("{} can no longer reach {}", self.identity.agent_url, state.master_url),
        );
    }
}

struct MasterConnectionTester {
    shared: Arc<AgentShared>,
}

#[async_trait]
impl ConnectionTester<AgentConnectionState> for MasterConnectionTester {
    async fn test_connection(
        &self,
        state: &AgentConnectionState,
    ) -> std::result::Result<AgentConnectionState, AgentConnectionState> {
        let master = &self.shared.master;
        match state.status {
            ConnectionStatus::Open => {
                let request = self.shared.registration(state);
                match master.register_agent(&state.master_url, &request).await {
                    Ok(registered) => Ok(AgentConnectionState {
                        status: ConnectionStatus::Closed,
                        attempts: state.attempts + 1,
                        token: registered.registration_token,
                        ..state.clone()
                    }),
                    Err(e) => {
                        debug!(master_url = %state.master_url, error = %e, "registration failed");
                        Err(AgentConnectionState {
                            attempts: state.attempts + 1,
                            ..state.clone()
                        })
                    }
                }
            }
            ConnectionStatus::Closed => {
                let found = master
                    .find_registered_agent(&state.master_url, &self.shared.identity.agent_url)
                    .await;
                match found {
                    Ok(Some(registered)) => {
                        if registered.registration_token != state.token {
                            self.shared
                                .adopt_token(&state.master_url, registered.registration_token.clone());
                        }
                        Ok(AgentConnectionState {
                            token: registered.registration_token,
                            ..state.clone()
                        })
                    }
                    outcome => {
                        if let Err(e) = outcome {
                            debug!(master_url = %state.master_url, error = %e, "master probe failed");
                        }
                        Err(AgentConnectionState {
                            status: ConnectionStatus::Open,
                            attempts: 0,
                            ..state.clone()
                        })
                    }
                }
            }
        }
    }
}

struct Session {
    master_url: String,
    checker: PeriodicConnectionChecker<AgentConnectionState>,
}

/// Keeps a storage agent registered with its master.
pub struct AgentConnection {
    shared: Arc<AgentShared>,
    config: ConnectionCheckConfig,
    session: AsyncMutex<Option<Session>>,
}

impl AgentConnection {
    /// Creates a connection manager for `identity`; nothing runs until `connect_to`.
    pub fn new(
        identity: StorageAgentInfo,
        master: Arc<dyn MasterClient>,
        notifier: Arc<dyn NotificationService>,
        config: ConnectionCheckConfig,
    ) -> Self {
        Self {
            shared: Arc::new(AgentShared {
                identity,
                master,
                notifier,
                adopted_token: Mutex::new(None),
            }),
            config,
            session: AsyncMutex::new(None),
        }
    }

    /// Starts keeping the agent registered with `master_url`.
    ///
    /// No-op when already connected to the same master; a different master
    /// replaces the current one.
    pub async fn connect_to(&self, master_url: &str) -> Result<()> {
        let master_url = master_url.trim();
        if master_url.is_empty() {
            return Err(MgmtError::Config("master URL must not be empty".to_string()));
        }
        let mut session = self.session.lock().await;
        if let Some(current) = session.as_ref() {
            if current.master_url == master_url {
                debug!(master_url = %master_url, "already connected");
                return Ok(());
            }
        }
        if let Some(previous) = session.take() {
            self.end_session(previous).await;
        }

        *self.shared.adopted_token.lock() = None;
        let tester = Arc::new(MasterConnectionTester {
            shared: Arc::clone(&self.shared),
        });
        let (up, down) = (Arc::clone(&self.shared), Arc::clone(&self.shared));
        let checker = PeriodicConnectionChecker::new(
            format!("master {}", master_url),
            AgentConnectionState::new(master_url),
            tester,
            self.config.trip_threshold,
        )
        .on_success(move |state| up.adopt_token(&state.master_url, state.token.clone()))
        .on_failure(move |state| down.connection_lost(state));
        checker.start(self.config.initial_delay, self.config.period);

        info!(
            agent_id = %self.shared.identity.agent_id,
            master_url = %master_url,
            "connecting to master"
        );
        *session = Some(Session {
            master_url: master_url.to_string(),
            checker,
        });
        Ok(())
    }

    /// Stops checking and deregisters from the current master.
    pub async fn disconnect(&self) {
        let session = self.session.lock().await.take();
        match session {
            Some(session) => self.end_session(session).await,
            None => debug!("not connected to a master"),
        }
    }

    async fn end_session(&self, session: Session) {
        session.checker.dispose();
        let state = session.checker.state().await;
        *self.shared.adopted_token.lock() = None;
        let Some(token) = state.token else {
            return;
        };
        let result = self
            .shared
            .master
            .deregister_agent(&session.master_url, &self.shared.identity.agent_url, &token)
            .await;
        match result {
            Ok(()) => info!(master_url = %session.master_url, "deregistered from master"),
            Err(e) => warn!(master_url = %session.master_url, error = %e, "deregistration failed"),
        }
    }

    /// Runs one connection check now, outside the schedule.
    pub async fn check_now(&self) -> Option<CheckerHealth> {
        let session = self.session.lock().await;
        match session.as_ref() {
            Some(session) => Some(session.checker.tick().await),
            None => None,
        }
    }

    /// This agent as the master sees it.
    pub async fn local_agent_info(&self) -> StorageAgentInfo {
        let session = self.session.lock().await;
        match session.as_ref() {
            Some(session) => self.shared.registration(&session.checker.state().await),
            None => self.shared.identity.clone(),
        }
    }

    /// URL of the current master, if connected to one.
    pub async fn master_url(&self) -> Option<String> {
        self.session.lock().await.as_ref().map(|s| s.master_url.clone())
    }
}

impl std::fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnection")
            .field("agent_id", &self.shared.identity.agent_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
