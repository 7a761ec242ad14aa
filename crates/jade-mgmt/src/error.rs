//! Error types for the management subsystem.

use jade_storage::StorageError;
use jade_transport::TransportError;
use thiserror::Error;

/// Errors raised by registration, allocation and configuration.
#[derive(Debug, Error)]
pub enum MgmtError {
    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The master refused or failed a registration.
    #[error("registration failed: {0}")]
    Registration(String),

    /// No agent is registered under the URL.
    #[error("no agent registered for {url}")]
    AgentNotFound {
        /// Agent URL looked up.
        url: String,
    },

    /// The presented registration token is stale or wrong.
    #[error("registration token does not match for {url}")]
    InvalidToken {
        /// Agent URL the token was presented for.
        url: String,
    },

    /// HTTP call to the master failed.
    #[error("master request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Transport layer failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Storage layer failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Local I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for management operations.
pub type Result<T> = std::result::Result<T, MgmtError>;
