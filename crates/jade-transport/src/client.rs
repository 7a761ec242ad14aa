//! Socket client for storage agents.
//!
//! The client runs its own [`DataTransferEngine`] for the local side: a
//! persist reads the local source through a bundle reader and streams it to
//! the agent, a retrieve feeds the agent's stream to a local bundle writer.

use std::path::Path;

use bytes::BytesMut;
use jade_storage::StorageFormat;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::engine::DataTransferEngine;
use crate::error::{Result, TransportError};
use crate::protocol::{HeaderCodec, ResponseCodec, StorageMessageHeader, StorageMessageResponse};
use crate::transfer::{TransferPhase, TransferState};
use crate::wire::{connect, read_frame, read_some, write_frame, ReadTimeouts};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Read timeouts while waiting for the agent.
    pub timeouts: ReadTimeouts,
    /// Whether to enable TCP_NODELAY.
    pub nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            timeouts: ReadTimeouts::default(),
            nodelay: true,
        }
    }
}

/// Where a transfer goes on the agent side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTransferTarget {
    /// Agent socket address, `host:port`.
    pub agent_addr: String,
    /// Path on the agent.
    pub path: String,
    /// Format of the data on the agent.
    pub format: StorageFormat,
    /// Token checked by the agent.
    pub auth_token: String,
    /// Bundle the transfer belongs to, if any.
    pub data_bundle_id: Option<u64>,
}

impl DataTransferTarget {
    /// Target without a token or bundle.
    pub fn new(agent_addr: impl Into<String>, path: impl Into<String>, format: StorageFormat) -> Self {
        Self {
            agent_addr: agent_addr.into(),
            path: path.into(),
            format,
            auth_token: String::new(),
            data_bundle_id: None,
        }
    }

    /// Sets the auth token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = token.into();
        self
    }

    /// Sets the bundle id.
    pub fn with_bundle_id(mut self, id: u64) -> Self {
        self.data_bundle_id = Some(id);
        self
    }

    fn header(&self, persist: bool) -> StorageMessageHeader {
        let header = if persist {
            StorageMessageHeader::persist(self.format, self.path.clone(), self.auth_token.clone())
        } else {
            StorageMessageHeader::retrieve(self.format, self.path.clone(), self.auth_token.clone())
        };
        match self.data_bundle_id {
            Some(id) => header.with_bundle_id(id),
            None => header,
        }
    }
}

/// Client side of the storage socket protocol.
#[derive(Debug, Clone)]
pub struct SocketStorageClient {
    engine: DataTransferEngine,
    config: ClientConfig,
}

impl SocketStorageClient {
    /// Creates a client whose local side runs on `engine`.
    pub fn new(engine: DataTransferEngine, config: ClientConfig) -> Self {
        Self { engine, config }
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream> {
        connect(addr, self.config.connect_timeout_ms, self.config.nodelay).await
    }

    async fn read_response(&self, stream: &mut TcpStream, pending: &mut BytesMut) -> Result<StorageMessageResponse> {
        let mut state = TransferState::new();
        read_frame(stream, &mut state, &ResponseCodec, pending, &self.config.timeouts).await?;
        state.take_message().ok_or_else(|| TransportError::MalformedFrame {
            reason: "no response".to_string(),
        })
    }

    /// Checks that an agent answers.
    pub async fn ping(&self, addr: &str) -> Result<StorageMessageResponse> {
        let mut stream = self.connect(addr).await?;
        write_frame(&mut stream, &HeaderCodec, &StorageMessageHeader::ping()).await?;
        self.read_response(&mut stream, &mut BytesMut::new()).await
    }

    /// Sends `local_path` to the agent.
    ///
    /// A directory is sent as a tar stream and cannot go to a single-file
    /// target. A file is sent as is, which for a non single-file target means
    /// it must already be a tar archive.
    pub async fn persist_data(&self, local_path: &Path, target: &DataTransferTarget) -> Result<StorageMessageResponse> {
        if !local_path.exists() {
            return Ok(StorageMessageResponse::error(format!(
                "No file found for {}",
                local_path.display()
            )));
        }
        if local_path.is_dir() && target.format == StorageFormat::SingleDataFile {
            return Ok(StorageMessageResponse::error(format!(
                "Cannot persist directory {} as a single file",
                local_path.display()
            )));
        }
        let local_format = if local_path.is_dir() {
            StorageFormat::DataDirectory
        } else if target.format == StorageFormat::SingleDataFile {
            StorageFormat::SingleDataFile
        } else {
            StorageFormat::ArchiveDataFile
        };

        let mut stream = self.connect(&target.agent_addr).await?;
        write_frame(&mut stream, &HeaderCodec, &target.header(true)).await?;

        let mut local = TransferState::with_message(StorageMessageHeader::retrieve(
            local_format,
            local_path.to_string_lossy(),
            "",
        ));
        self.engine.begin_data_transfer(&mut local)?;
        debug!(source = %local_path.display(), %local_format, agent = %target.agent_addr, "sending data");

        let mut buf = vec![0u8; self.engine.chunk_size().max(1)];
        let mut send_error = None;
        while let Some(n) = self.engine.read_data(&mut buf, &mut local).await? {
            if let Err(e) = stream.write_all(&buf[..n]).await {
                self.engine.abort_data_transfer(&mut local);
                send_error = Some(e);
                break;
            }
        }
        let phase = local.status().wait_terminal_for(self.config.timeouts.total()).await?;
        if phase.is_error() {
            let message = local.status().error_message().unwrap_or_default();
            warn!(source = %local_path.display(), error = %message, "local read failed");
            // Reset instead of a clean close so the agent drops the partial data.
            let _ = stream.set_linger(Some(std::time::Duration::ZERO));
            if send_error.is_none() {
                return Ok(StorageMessageResponse::error(message));
            }
        }
        if send_error.is_none() {
            stream.shutdown().await.map_err(TransportError::Io)?;
        }

        match self.read_response(&mut stream, &mut BytesMut::new()).await {
            Ok(response) => Ok(response),
            Err(e) => Err(send_error.map(TransportError::Io).unwrap_or(e)),
        }
    }

    /// Fetches the target into `local_path`.
    ///
    /// A single-file target is written as one file; every other format is
    /// expanded into a directory.
    pub async fn retrieve_data(&self, local_path: &Path, target: &DataTransferTarget) -> Result<StorageMessageResponse> {
        let mut stream = self.connect(&target.agent_addr).await?;
        write_frame(&mut stream, &HeaderCodec, &target.header(false)).await?;

        let mut pending = BytesMut::new();
        let preamble = self.read_response(&mut stream, &mut pending).await?;
        if !preamble.is_ok() {
            return Ok(preamble);
        }

        let local_format = if target.format == StorageFormat::SingleDataFile {
            StorageFormat::SingleDataFile
        } else {
            StorageFormat::DataDirectory
        };
        let mut local = TransferState::with_message(StorageMessageHeader::persist(
            local_format,
            local_path.to_string_lossy(),
            "",
        ));
        self.engine.begin_data_transfer(&mut local)?;
        debug!(target = %local_path.display(), %local_format, agent = %target.agent_addr, "receiving data");

        let mut consuming = pending.is_empty() || self.engine.write_data(&pending, &mut local).await?.is_some();
        let mut buf = vec![0u8; self.engine.chunk_size().max(1)];
        while consuming {
            let n = match read_some(&mut stream, &mut buf, &self.config.timeouts).await {
                Ok(n) => n,
                Err(e) => {
                    self.engine.abort_data_transfer(&mut local);
                    let _ = local.status().wait_terminal_for(self.config.timeouts.total()).await;
                    return Err(e);
                }
            };
            if n == 0 {
                break;
            }
            consuming = self.engine.write_data(&buf[..n], &mut local).await?.is_some();
        }
        self.engine.end_data_transfer(&mut local);

        let phase = local.status().wait_terminal_for(self.config.timeouts.total()).await?;
        let summary = local.status().summary();
        let response = if phase == TransferPhase::WriteDataComplete {
            StorageMessageResponse::ok(preamble.message)
        } else {
            StorageMessageResponse::error(local.status().error_message().unwrap_or_default())
        };
        Ok(response.with_counts(summary.transferred_bytes, summary.persisted_bytes, summary.checksum))
    }
}
