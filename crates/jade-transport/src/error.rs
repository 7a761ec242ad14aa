//! Error types for the transport subsystem.

use jade_storage::StorageError;
use thiserror::Error;

/// Errors raised while framing, moving or validating transfer data.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A frame could not be decoded.
    #[error("malformed frame: {reason}")]
    MalformedFrame {
        /// What was wrong with the frame.
        reason: String,
    },

    /// A frame announced a payload above the limit.
    #[error("frame too large: {size} bytes (max {max_size})")]
    FrameTooLarge {
        /// Announced payload size.
        size: u32,
        /// Largest accepted payload.
        max_size: u32,
    },

    /// The request token was rejected.
    #[error("Authentication failure: {reason}")]
    AuthenticationFailure {
        /// Why validation failed.
        reason: String,
    },

    /// Connecting did not finish in time.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Address being dialled.
        addr: String,
        /// Connect budget in milliseconds.
        timeout_ms: u64,
    },

    /// The peer stayed silent past the read budget.
    #[error("timed out after {waited_ms}ms waiting for the peer")]
    Timeout {
        /// Total time waited.
        waited_ms: u64,
    },

    /// The peer closed the connection mid-frame.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// The bundle side of a transfer failed.
    #[error("{reason}")]
    TransferIo {
        /// Message reported to the peer.
        reason: String,
    },

    /// A header named an operation this side does not serve.
    #[error("unknown operation: {name}")]
    UnknownOperation {
        /// The operation name received.
        name: String,
    },

    /// Storage layer failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Socket I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
