//! Clients for the master's agent registration protocol.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::error::{MgmtError, Result};
use crate::info::StorageAgentInfo;
use crate::registry::StorageAgentRegistry;

/// Header carrying the registration token on deregistration.
pub const AGENT_TOKEN_HEADER: &str = "agenttoken";

/// Registration calls an agent makes against a master.
#[async_trait]
pub trait MasterClient: Send + Sync {
    /// Registers `agent`; the reply carries its token.
    async fn register_agent(&self, master_url: &str, agent: &StorageAgentInfo) -> Result<StorageAgentInfo>;

    /// `None` when the master does not know `agent_url`.
    async fn find_registered_agent(&self, master_url: &str, agent_url: &str) -> Result<Option<StorageAgentInfo>>;

    /// Removes the registration if `token` still owns it.
    async fn deregister_agent(&self, master_url: &str, agent_url: &str, token: &str) -> Result<()>;
}

/// Talks to the master's HTTP API.
#[derive(Debug, Clone, Default)]
pub struct HttpMasterClient {
    client: reqwest::Client,
}

impl HttpMasterClient {
    /// Client with a default HTTP connection pool.
    pub fn new() -> Self {
        Self::default()
    }

    fn agent_endpoint(master_url: &str, agent_url: &str) -> String {
        format!(
            "{}/agents/url/{}",
            master_url.trim_end_matches('/'),
            urlencoding::encode(agent_url)
        )
    }
}

#[async_trait]
impl MasterClient for HttpMasterClient {
    async fn register_agent(&self, master_url: &str, agent: &StorageAgentInfo) -> Result<StorageAgentInfo> {
        let url = format!("{}/agents", master_url.trim_end_matches('/'));
        debug!(url = %url, agent_url = %agent.agent_url, "registering agent");
        let response = self.client.post(&url).json(agent).send().await?;
        if !response.status().is_success() {
            return Err(MgmtError::Registration(format!(
                "{} answered {}",
                url,
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn find_registered_agent(&self, master_url: &str, agent_url: &str) -> Result<Option<StorageAgentInfo>> {
        let response = self
            .client
            .get(Self::agent_endpoint(master_url, agent_url))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }

    async fn deregister_agent(&self, master_url: &str, agent_url: &str, token: &str) -> Result<()> {
        let response = self
            .client
            .delete(Self::agent_endpoint(master_url, agent_url))
            .header(AGENT_TOKEN_HEADER, token)
            .send()
            .await?;
        match response.status() {
            StatusCode::FORBIDDEN => Err(MgmtError::InvalidToken {
                url: agent_url.to_string(),
            }),
            StatusCode::NOT_FOUND => Err(MgmtError::AgentNotFound {
                url: agent_url.to_string(),
            }),
            _ => {
                response.error_for_status()?;
                Ok(())
            }
        }
    }
}

/// Calls a registry in the same process; the master URL is ignored.
#[derive(Debug, Clone)]
pub struct InProcessMasterClient {
    registry: Arc<StorageAgentRegistry>,
}

impl InProcessMasterClient {
    /// Client calling `registry` directly.
    pub fn new(registry: Arc<StorageAgentRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl MasterClient for InProcessMasterClient {
    async fn register_agent(&self, _master_url: &str, agent: &StorageAgentInfo) -> Result<StorageAgentInfo> {
        Ok(self.registry.register_agent(agent.clone()))
    }

    async fn find_registered_agent(&self, _master_url: &str, agent_url: &str) -> Result<Option<StorageAgentInfo>> {
        Ok(self.registry.find_registered_agent(agent_url))
    }

    async fn deregister_agent(&self, _master_url: &str, agent_url: &str, token: &str) -> Result<()> {
        match self.registry.deregister_agent(agent_url, token)? {
            Some(_) => Ok(()),
            None => Err(MgmtError::AgentNotFound {
                url: agent_url.to_string(),
            }),
        }
    }
}
