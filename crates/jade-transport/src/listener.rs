//! Storage agent socket listener.
//!
//! One task per accepted connection. A connection carries exactly one
//! request: a framed [`StorageMessageHeader`], then for PERSIST_DATA the raw
//! data bytes up to the client's write shutdown. The agent answers with one
//! framed [`StorageMessageResponse`]; for RETRIEVE_DATA the OK response is a
//! preamble followed by the data bytes up to the agent's write shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::TokenValidator;
use crate::engine::DataTransferEngine;
use crate::error::{Result, TransportError};
use crate::metrics::TransferMetrics;
use crate::protocol::{HeaderCodec, Operation, ResponseCodec, StorageMessageHeader, StorageMessageResponse};
use crate::transfer::{TransferPhase, TransferState, TransferSummary};
use crate::wire::{read_frame, read_some, write_frame, ReadTimeouts};

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind, `host:port`.
    pub bind_addr: String,
    /// Read timeouts applied to every connection.
    pub timeouts: ReadTimeouts,
    /// Whether to enable TCP_NODELAY on accepted sockets.
    pub nodelay: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:10000".to_string(),
            timeouts: ReadTimeouts::default(),
            nodelay: true,
        }
    }
}

/// Told about every bundle an agent stored successfully.
pub trait TransferObserver: Send + Sync {
    /// Called after a PERSIST_DATA transfer reached `WriteDataComplete`.
    fn on_persisted(&self, header: &StorageMessageHeader, summary: &TransferSummary);
}

struct ConnectionContext {
    engine: DataTransferEngine,
    validator: Arc<dyn TokenValidator>,
    observer: Option<Arc<dyn TransferObserver>>,
    timeouts: ReadTimeouts,
    nodelay: bool,
    metrics: Arc<TransferMetrics>,
}

/// Accepts storage requests on a TCP socket.
pub struct StorageAgentListener {
    listener: TcpListener,
    context: ConnectionContext,
}

impl std::fmt::Debug for StorageAgentListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAgentListener")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish_non_exhaustive()
    }
}

impl StorageAgentListener {
    /// Binds the listener socket.
    pub async fn bind(
        config: ListenerConfig,
        engine: DataTransferEngine,
        validator: Arc<dyn TokenValidator>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(TransportError::Io)?;
        Ok(Self {
            listener,
            context: ConnectionContext {
                engine,
                validator,
                observer: None,
                timeouts: config.timeouts,
                nodelay: config.nodelay,
                metrics: Arc::new(TransferMetrics::new()),
            },
        })
    }

    /// Registers an observer for completed persists.
    pub fn with_observer(mut self, observer: Arc<dyn TransferObserver>) -> Self {
        self.context.observer = Some(observer);
        self
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(TransportError::Io)
    }

    /// Shared counters for this listener.
    pub fn metrics(&self) -> Arc<TransferMetrics> {
        Arc::clone(&self.context.metrics)
    }

    /// Accepts connections until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self { listener, context } = self;
        let context = Arc::new(context);
        info!(addr = ?listener.local_addr().ok(), "storage agent listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("storage agent listener stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        context.metrics.connection_opened();
                        let context = Arc::clone(&context);
                        tokio::spawn(async move {
                            if let Err(e) = context.serve(stream, peer).await {
                                if matches!(e, TransportError::Timeout { .. }) {
                                    context.metrics.inc_timeouts();
                                }
                                context.metrics.inc_failures();
                                warn!(peer = %peer, error = %e, "connection ended with an error");
                            }
                            context.metrics.connection_closed();
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

impl ConnectionContext {
    async fn serve(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        if self.nodelay {
            stream.set_nodelay(true).map_err(TransportError::Io)?;
        }
        debug!(peer = %peer, "connection accepted");

        let mut state = TransferState::new();
        let mut pending = BytesMut::new();
        match read_frame(&mut stream, &mut state, &HeaderCodec, &mut pending, &self.timeouts).await {
            Ok(()) => {}
            Err(e @ (TransportError::MalformedFrame { .. } | TransportError::FrameTooLarge { .. })) => {
                warn!(peer = %peer, error = %e, "invalid request header");
                self.metrics.inc_failures();
                return respond(&mut stream, &StorageMessageResponse::error(e.to_string())).await;
            }
            Err(e) => return Err(e),
        }
        let header = match state.message().cloned() {
            Some(header) => header,
            None => {
                return Err(TransportError::MalformedFrame {
                    reason: "no request header".to_string(),
                })
            }
        };

        if header.operation == Operation::Ping {
            self.metrics.inc_pings();
            debug!(peer = %peer, "ping");
            return respond(&mut stream, &StorageMessageResponse::ok("")).await;
        }

        if let Err(e) = self.validator.validate(&header.auth_token) {
            warn!(peer = %peer, operation = %header.operation, error = %e, "request rejected");
            self.metrics.inc_auth_failures();
            self.metrics.inc_failures();
            if header.operation == Operation::PersistData {
                self.discard_input(&mut stream).await;
            }
            return respond(&mut stream, &StorageMessageResponse::error(e.to_string())).await;
        }

        info!(
            peer = %peer,
            operation = %header.operation,
            location = %header.location,
            bundle_id = ?header.data_bundle_id,
            "storage request"
        );
        match header.operation {
            Operation::PersistData => self.persist(&mut stream, state, pending, &header).await,
            Operation::RetrieveData => self.retrieve(&mut stream, state).await,
            Operation::Ping => Ok(()),
        }
    }

    async fn persist(
        &self,
        stream: &mut TcpStream,
        mut state: TransferState<StorageMessageHeader>,
        pending: BytesMut,
        header: &StorageMessageHeader,
    ) -> Result<()> {
        if let Err(e) = self.engine.begin_data_transfer(&mut state) {
            warn!(location = %header.location, error = %e, "cannot start persist");
            self.metrics.inc_failures();
            self.discard_input(stream).await;
            return respond(stream, &StorageMessageResponse::error(e.to_string())).await;
        }

        let mut received = pending.len() as u64;
        let mut consuming = pending.is_empty() || self.engine.write_data(&pending, &mut state).await?.is_some();
        let mut buf = vec![0u8; self.engine.chunk_size().max(1)];
        loop {
            let n = match read_some(stream, &mut buf, &self.timeouts).await {
                Ok(n) => n,
                Err(e) => {
                    self.engine.abort_data_transfer(&mut state);
                    let _ = state.status().wait_terminal_for(self.timeouts.total()).await;
                    return Err(e);
                }
            };
            if n == 0 {
                break;
            }
            received += n as u64;
            // Once the writer has stopped, the rest of the input is discarded
            // so the client still gets to read the response.
            if consuming {
                consuming = self.engine.write_data(&buf[..n], &mut state).await?.is_some();
            }
        }
        self.metrics.add_bytes_in(received);
        self.engine.end_data_transfer(&mut state);

        let phase = match state.status().wait_terminal_for(self.timeouts.total()).await {
            Ok(phase) => phase,
            Err(e) => {
                self.metrics.inc_failures();
                return respond(stream, &StorageMessageResponse::error(e.to_string())).await;
            }
        };
        let summary = state.status().summary();
        let response = if phase == TransferPhase::WriteDataComplete {
            self.metrics.inc_persists();
            if let Some(observer) = &self.observer {
                observer.on_persisted(header, &summary);
            }
            info!(
                location = %header.location,
                transferred = summary.transferred_bytes,
                persisted = summary.persisted_bytes,
                "persist complete"
            );
            StorageMessageResponse::ok("")
        } else {
            self.metrics.inc_failures();
            let message = state
                .status()
                .error_message()
                .unwrap_or_else(|| format!("Error writing data to {}", header.location));
            StorageMessageResponse::error(message)
        };
        respond(
            stream,
            &response.with_counts(summary.transferred_bytes, summary.persisted_bytes, summary.checksum),
        )
        .await
    }

    async fn retrieve(&self, stream: &mut TcpStream, mut state: TransferState<StorageMessageHeader>) -> Result<()> {
        if let Err(e) = self.engine.begin_data_transfer(&mut state) {
            self.metrics.inc_failures();
            return respond(stream, &StorageMessageResponse::error(e.to_string())).await;
        }

        let mut buf = vec![0u8; self.engine.chunk_size().max(1)];
        let first = match self.engine.read_data(&mut buf, &mut state).await {
            Ok(first) => first,
            Err(e) => {
                self.metrics.inc_failures();
                return respond(stream, &StorageMessageResponse::error(e.to_string())).await;
            }
        };
        let first = match first {
            Some(n) => n,
            None => {
                // Nothing was produced: either an empty bundle or an error.
                let phase = state.status().wait_terminal_for(self.timeouts.total()).await?;
                let summary = state.status().summary();
                let response = if phase.is_error() {
                    self.metrics.inc_failures();
                    StorageMessageResponse::error(state.status().error_message().unwrap_or_default())
                } else {
                    self.metrics.inc_retrieves();
                    StorageMessageResponse::ok("")
                };
                respond(
                    stream,
                    &response.with_counts(summary.transferred_bytes, summary.persisted_bytes, summary.checksum),
                )
                .await?;
                return stream.shutdown().await.map_err(TransportError::Io);
            }
        };

        respond(stream, &StorageMessageResponse::ok("")).await?;
        let mut sent = 0u64;
        let mut n = first;
        loop {
            if let Err(e) = stream.write_all(&buf[..n]).await {
                self.engine.abort_data_transfer(&mut state);
                return Err(TransportError::Io(e));
            }
            sent += n as u64;
            match self.engine.read_data(&mut buf, &mut state).await {
                Ok(Some(next)) => n = next,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "retrieve stream broke");
                    break;
                }
            }
        }
        self.metrics.add_bytes_out(sent);

        let phase = state.status().wait_terminal_for(self.timeouts.total()).await?;
        if phase.is_error() {
            // The preamble already said OK; reset the connection so the
            // client cannot take a truncated stream for a complete one.
            warn!(
                error = ?state.status().error_message(),
                sent,
                "retrieve failed after the stream started"
            );
            self.metrics.inc_failures();
            let _ = stream.set_linger(Some(Duration::ZERO));
            return Ok(());
        }
        self.metrics.inc_retrieves();
        info!(sent, "retrieve complete");
        stream.flush().await.map_err(TransportError::Io)?;
        stream.shutdown().await.map_err(TransportError::Io)
    }

    async fn discard_input(&self, stream: &mut TcpStream) {
        let mut buf = [0u8; 8192];
        while let Ok(n) = read_some(stream, &mut buf, &self.timeouts).await {
            if n == 0 {
                break;
            }
        }
    }
}

async fn respond(stream: &mut TcpStream, response: &StorageMessageResponse) -> Result<()> {
    write_frame(stream, &ResponseCodec, response).await
}
