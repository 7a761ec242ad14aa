//! Master HTTP API for agent registration.

use crate::error::MgmtError;
use crate::info::StorageAgentInfo;
use crate::master::AGENT_TOKEN_HEADER;
use crate::registry::StorageAgentRegistry;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// HTTP surface of the master: agent registration and health.
#[derive(Clone)]
pub struct MasterApi {
    registry: Arc<StorageAgentRegistry>,
    bind_addr: String,
}

impl MasterApi {
    /// API for `registry`, served on `bind_addr`.
    pub fn new(registry: Arc<StorageAgentRegistry>, bind_addr: impl Into<String>) -> Self {
        Self {
            registry,
            bind_addr: bind_addr.into(),
        }
    }

    /// Routes with `self` as shared state.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/agents", post(register_handler).get(list_handler))
            .route(
                "/agents/url/:agent_url",
                get(find_handler).delete(deregister_handler),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    /// Serves until `shutdown` is cancelled.
    pub async fn serve(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.bind_addr).await?;
        tracing::info!("Master API listening on {}", listener.local_addr()?);
        let router = Arc::new(self).router();

        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

async fn health_handler(State(state): State<Arc<MasterApi>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "registeredAgents": state.registry.len(),
    }))
}

async fn register_handler(
    State(state): State<Arc<MasterApi>>,
    Json(agent): Json<StorageAgentInfo>,
) -> Response {
    if agent.agent_url.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "agentUrl is required"})),
        )
            .into_response();
    }
    Json(state.registry.register_agent(agent)).into_response()
}

async fn list_handler(State(state): State<Arc<MasterApi>>) -> Json<Vec<StorageAgentInfo>> {
    Json(state.registry.registered_agents(|_| true))
}

async fn find_handler(
    State(state): State<Arc<MasterApi>>,
    Path(agent_url): Path<String>,
) -> Response {
    match state.registry.find_registered_agent(&agent_url) {
        Some(agent) => Json(agent).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn deregister_handler(
    State(state): State<Arc<MasterApi>>,
    Path(agent_url): Path<String>,
    headers: HeaderMap,
) -> StatusCode {
    let token = headers
        .get(AGENT_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    match state.registry.deregister_agent(&agent_url, token) {
        Ok(Some(_)) => StatusCode::NO_CONTENT,
        Ok(None) => StatusCode::NOT_FOUND,
        Err(MgmtError::InvalidToken { .. }) => StatusCode::FORBIDDEN,
        Err(e) => {
            tracing::error!(agent_url = %agent_url, error = %e, "deregistration failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
