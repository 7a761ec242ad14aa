#![warn(missing_docs)]

//! JADE transport subsystem: framed socket protocol, transfer state machine, data transfer engine
//!
//! A storage agent accepts one request per TCP connection. The request header
//! is a length-prefixed msgpack frame; the data that follows is raw bytes in
//! the bundle's storage format. The [`engine`] moves those bytes between the
//! connection and a bundle reader or writer running on a bounded pool.

pub mod auth;
pub mod client;
pub mod engine;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod pipe;
pub mod protocol;
pub mod transfer;
pub mod wire;

pub use auth::{AcceptAnyToken, JwtTokenValidator, TokenClaims, TokenValidator};
pub use client::{ClientConfig, DataTransferTarget, SocketStorageClient};
pub use engine::{DataTransferEngine, EngineConfig};
pub use error::{Result, TransportError};
pub use listener::{ListenerConfig, StorageAgentListener, TransferObserver};
pub use metrics::{MetricsSnapshot, TransferMetrics};
pub use protocol::{
    HeaderCodec, MessageCodec, Operation, ResponseCodec, ResponseStatus, StorageMessageHeader,
    StorageMessageResponse,
};
pub use transfer::{TransferPhase, TransferState, TransferStatus, TransferSummary};
pub use wire::ReadTimeouts;
