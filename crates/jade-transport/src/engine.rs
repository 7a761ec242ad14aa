//! Data transfer engine.
//!
//! Bridges the connection side of a transfer to a bundle reader or writer.
//! The bundle I/O runs on tokio's blocking pool, gated by a semaphore so at
//! most `worker_threads` transfers touch the disk at once, and talks to the
//! connection through a bounded [`pipe`](crate::pipe). The engine never
//! touches a socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use jade_storage::{persisted_size, BundleIoProvider, StorageFormat};
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::error::{Result, TransportError};
use crate::pipe::data_pipe;
use crate::protocol::{Operation, StorageMessageHeader};
use crate::transfer::{TransferPhase, TransferState, TransferStatus};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Chunks the pipe holds before the producer blocks.
    pub pipe_capacity: usize,
    /// Largest chunk moved through the pipe.
    pub chunk_size: usize,
    /// Transfers allowed to run bundle I/O concurrently.
    pub worker_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: 64,
            chunk_size: 64 * 1024,
            worker_threads: 8,
        }
    }
}

/// Runs bundle reads and writes in the background for connections.
#[derive(Debug, Clone)]
pub struct DataTransferEngine {
    io: Arc<BundleIoProvider>,
    config: EngineConfig,
    permits: Arc<Semaphore>,
}

impl DataTransferEngine {
    /// Creates an engine over the given readers and writers.
    pub fn new(io: Arc<BundleIoProvider>, config: EngineConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.worker_threads.max(1)));
        Self {
            io,
            config,
            permits,
        }
    }

    /// Configured chunk size.
    pub fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    /// Starts the transfer described by the state's header.
    ///
    /// PERSIST_DATA opens a pipe whose read end feeds the bundle writer for
    /// the header's format; RETRIEVE_DATA opens a pipe filled by the bundle
    /// reader. Must be called from within a tokio runtime.
    pub fn begin_data_transfer(&self, state: &mut TransferState<StorageMessageHeader>) -> Result<()> {
        let header = state
            .message()
            .cloned()
            .ok_or_else(|| TransportError::TransferIo {
                reason: "no request header to start a transfer from".to_string(),
            })?;
        if state.has_open_channel() {
            return Err(TransportError::TransferIo {
                reason: "a transfer is already running on this connection".to_string(),
            });
        }
        let format = match (header.operation, header.format) {
            (Operation::Ping, _) => {
                return Err(TransportError::UnknownOperation {
                    name: format!("{} has no data phase", header.operation),
                })
            }
            (_, Some(format)) => format,
            (_, None) => {
                return Err(TransportError::TransferIo {
                    reason: format!("{} request without a storage format", header.operation),
                })
            }
        };
        match header.operation {
            Operation::PersistData => self.begin_persist(state, format, PathBuf::from(&header.location)),
            Operation::RetrieveData => self.begin_retrieve(state, format, PathBuf::from(&header.location)),
            Operation::Ping => Ok(()),
        }
    }

    fn begin_persist(
        &self,
        state: &mut TransferState<StorageMessageHeader>,
        format: StorageFormat,
        target: PathBuf,
    ) -> Result<()> {
        let writer = self.io.writer(format)?;
        let (tx, rx) = data_pipe(self.config.pipe_capacity, self.config.chunk_size);
        state.channel.writer = Some(tx);
        let status = Arc::clone(state.status());
        status.set_phase(TransferPhase::WriteDataStarted);
        debug!(target = %target.display(), %format, "persist transfer started");

        let task_status = Arc::clone(&status);
        self.spawn(status, TransferPhase::WriteDataError, move || {
            task_status.set_phase(TransferPhase::WriteData);
            let mut input = rx;
            let result = writer.write_bundle(&mut input, &target);
            // Close the read end before publishing the outcome so that a
            // terminal phase implies further sends fail.
            drop(input);
            match result {
                Ok(info) => {
                    let persisted = persisted_or_transferred(&target, info.num_bytes);
                    debug!(target = %target.display(), bytes = info.num_bytes, persisted, "persist transfer complete");
                    task_status.complete(TransferPhase::WriteDataComplete, info.num_bytes, persisted, info.checksum);
                }
                Err(e) => {
                    warn!(target = %target.display(), error = %e, "persist transfer failed");
                    task_status.fail(
                        TransferPhase::WriteDataError,
                        format!("Error writing data to {}: {}", target.display(), e),
                    );
                }
            }
        });
        Ok(())
    }

    fn begin_retrieve(
        &self,
        state: &mut TransferState<StorageMessageHeader>,
        format: StorageFormat,
        source: PathBuf,
    ) -> Result<()> {
        let reader = self.io.reader(format)?;
        let (tx, rx) = data_pipe(self.config.pipe_capacity, self.config.chunk_size);
        state.channel.reader = Some(rx);
        let status = Arc::clone(state.status());
        status.set_phase(TransferPhase::ReadDataStarted);
        debug!(source = %source.display(), %format, "retrieve transfer started");

        let task_status = Arc::clone(&status);
        self.spawn(status, TransferPhase::ReadDataError, move || {
            task_status.set_phase(TransferPhase::ReadData);
            let mut output = tx;
            match reader.read_bundle(&source, &mut output) {
                Ok(info) => {
                    debug!(source = %source.display(), bytes = info.num_bytes, "retrieve transfer complete");
                    task_status.complete(TransferPhase::ReadDataComplete, info.num_bytes, info.num_bytes, info.checksum);
                }
                Err(e) => {
                    warn!(source = %source.display(), error = %e, "retrieve transfer failed");
                    task_status.fail(
                        TransferPhase::ReadDataError,
                        format!("Error reading data from {}: {}", source.display(), e),
                    );
                }
            }
            // The phase is terminal before the reader sees end-of-stream.
            drop(output);
        });
        Ok(())
    }

    fn spawn<F>(&self, status: Arc<TransferStatus>, error_phase: TransferPhase, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    status.fail(error_phase, "transfer pool is shut down");
                    return;
                }
            };
            if let Err(e) = tokio::task::spawn_blocking(job).await {
                error!(error = %e, "transfer task did not finish");
                status.fail(error_phase, format!("transfer task failed: {}", e));
            }
        });
    }

    /// Reads bytes produced by the background bundle reader.
    ///
    /// Returns `Ok(None)` at end-of-stream or when no read channel is open;
    /// the channel is closed at that point.
    pub async fn read_data(
        &self,
        buf: &mut [u8],
        state: &mut TransferState<StorageMessageHeader>,
    ) -> Result<Option<usize>> {
        let reader = match state.channel.reader.as_mut() {
            Some(reader) => reader,
            None => return Ok(None),
        };
        match reader.recv(buf).await {
            Ok(0) if !buf.is_empty() => {
                state.channel.reader = None;
                Ok(None)
            }
            Ok(n) => Ok(Some(n)),
            Err(e) => {
                state.channel.reader = None;
                Err(TransportError::TransferIo {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Hands bytes received from the network to the background bundle writer.
    ///
    /// Returns `Ok(None)` when no write channel is open or the writer stopped
    /// consuming; the caller then reads the outcome from the status.
    pub async fn write_data(
        &self,
        buf: &[u8],
        state: &mut TransferState<StorageMessageHeader>,
    ) -> Result<Option<usize>> {
        let writer = match state.channel.writer.as_ref() {
            Some(writer) => writer,
            None => return Ok(None),
        };
        match writer.send(buf).await {
            Ok(()) => Ok(Some(buf.len())),
            Err(_) => {
                state.channel.writer = None;
                Ok(None)
            }
        }
    }

    /// Signals end-of-stream to the background writer. No-op without an open
    /// write channel.
    pub fn end_data_transfer(&self, state: &mut TransferState<StorageMessageHeader>) {
        state.channel.writer = None;
    }

    /// Ends the transfer early; the background task finishes with an error.
    pub fn abort_data_transfer(&self, state: &mut TransferState<StorageMessageHeader>) {
        if let Some(writer) = state.channel.writer.take() {
            writer.abort();
        }
        if let Some(mut reader) = state.channel.reader.take() {
            reader.close();
        }
    }
}

/// Size on disk of a finished write, or the transferred byte count when the
/// target cannot be measured.
fn persisted_or_transferred(target: &Path, transferred: u64) -> u64 {
    match persisted_size(target) {
        Ok(size) => size,
        Err(e) => {
            warn!(target = %target.display(), error = %e, "cannot size persisted data, using transferred bytes");
            transferred
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    fn engine() -> DataTransferEngine {
        DataTransferEngine::new(
            Arc::new(BundleIoProvider::default()),
            EngineConfig {
                pipe_capacity: 2,
                chunk_size: 4,
                worker_threads: 2,
            },
        )
    }

    const WAIT: Duration = Duration::from_secs(10);

    #[test]
    fn test_persisted_size_falls_back_to_transferred() {
        let dir = tempfile::tempdir().unwrap();
        let written = dir.path().join("written");
        fs::write(&written, b"0123456789").unwrap();
        assert_eq!(persisted_or_transferred(&written, 99), 10);
        assert_eq!(persisted_or_transferred(&dir.path().join("vanished"), 99), 99);
    }

    #[tokio::test]
    async fn test_persist_then_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("stored.bin");
        let engine = engine();

        let mut persist = TransferState::with_message(StorageMessageHeader::persist(
            StorageFormat::SingleDataFile,
            target.to_string_lossy(),
            "",
        ));
        engine.begin_data_transfer(&mut persist).unwrap();
        assert_eq!(engine.write_data(b"0123456789", &mut persist).await.unwrap(), Some(10));
        engine.end_data_transfer(&mut persist);
        let phase = persist.status().wait_terminal_for(WAIT).await.unwrap();
        assert_eq!(phase, TransferPhase::WriteDataComplete);
        assert_eq!(persist.status().transferred_bytes(), 10);
        assert_eq!(persist.status().persisted_bytes(), 10);
        assert_eq!(fs::read(&target).unwrap(), b"0123456789");

        let mut retrieve = TransferState::with_message(StorageMessageHeader::retrieve(
            StorageFormat::SingleDataFile,
            target.to_string_lossy(),
            "",
        ));
        engine.begin_data_transfer(&mut retrieve).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        while let Some(n) = engine.read_data(&mut buf, &mut retrieve).await.unwrap() {
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"0123456789");
        assert_eq!(retrieve.phase(), TransferPhase::ReadDataComplete);
        assert_eq!(retrieve.status().summary().checksum, persist.status().summary().checksum);
    }

    #[tokio::test]
    async fn test_retrieve_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("missing");
        let engine = engine();
        let mut state = TransferState::with_message(StorageMessageHeader::retrieve(
            StorageFormat::SingleDataFile,
            source.to_string_lossy(),
            "",
        ));
        engine.begin_data_transfer(&mut state).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(engine.read_data(&mut buf, &mut state).await.unwrap(), None);
        assert_eq!(state.phase(), TransferPhase::ReadDataError);
        let message = state.status().error_message().unwrap();
        assert!(message.contains(&format!("No file found for {}", source.display())));
    }

    #[tokio::test]
    async fn test_existing_target_stops_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("taken");
        fs::write(&target, b"old").unwrap();
        let engine = engine();
        let mut state = TransferState::with_message(StorageMessageHeader::persist(
            StorageFormat::SingleDataFile,
            target.to_string_lossy(),
            "",
        ));
        engine.begin_data_transfer(&mut state).unwrap();
        let phase = state.status().wait_terminal_for(WAIT).await.unwrap();
        assert_eq!(phase, TransferPhase::WriteDataError);
        assert_eq!(engine.write_data(b"more", &mut state).await.unwrap(), None);
        assert!(state.status().error_message().unwrap().contains("already exists"));
        assert_eq!(fs::read(&target).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_abort_leaves_no_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("partial");
        let engine = engine();
        let mut state = TransferState::with_message(StorageMessageHeader::persist(
            StorageFormat::SingleDataFile,
            target.to_string_lossy(),
            "",
        ));
        engine.begin_data_transfer(&mut state).unwrap();
        engine.write_data(b"half", &mut state).await.unwrap();
        engine.abort_data_transfer(&mut state);
        let phase = state.status().wait_terminal_for(WAIT).await.unwrap();
        assert_eq!(phase, TransferPhase::WriteDataError);
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_end_without_channel_is_noop() {
        let engine = engine();
        let mut state: TransferState<StorageMessageHeader> = TransferState::new();
        engine.end_data_transfer(&mut state);
        assert!(!state.has_open_channel());
        assert_eq!(engine.write_data(b"x", &mut state).await.unwrap(), None);
        assert!(engine.begin_data_transfer(&mut state).is_err());
    }

    #[tokio::test]
    async fn test_ping_has_no_data_phase() {
        let engine = engine();
        let mut state = TransferState::with_message(StorageMessageHeader::ping());
        let err = engine.begin_data_transfer(&mut state).unwrap_err();
        assert!(matches!(err, TransportError::UnknownOperation { .. }));
    }
}
