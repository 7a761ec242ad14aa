//! Per-connection transfer state.
//!
//! A [`TransferState`] belongs to exactly one connection. It reassembles the
//! opening frame from whatever chunks the socket delivers and holds the ends
//! of the data pipe while a transfer runs. The part the background task
//! updates (phase, counters, error) lives in a shared [`TransferStatus`] whose
//! phase is an atomic that never leaves a terminal value.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Buf;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::trace;

use crate::error::{Result, TransportError};
use crate::pipe::{PipeReader, PipeWriter};
use crate::protocol::{MessageCodec, FRAME_SIZE_PREFIX, MAX_FRAME_SIZE};

const PHASE_IDLE: u8 = 0;
const PHASE_READ_HEADER_SIZE: u8 = 1;
const PHASE_READ_HEADER_PAYLOAD: u8 = 2;
const PHASE_READ_DATA_STARTED: u8 = 3;
const PHASE_READ_DATA: u8 = 4;
const PHASE_READ_DATA_COMPLETE: u8 = 5;
const PHASE_READ_DATA_ERROR: u8 = 6;
const PHASE_WRITE_DATA_STARTED: u8 = 7;
const PHASE_WRITE_DATA: u8 = 8;
const PHASE_WRITE_DATA_COMPLETE: u8 = 9;
const PHASE_WRITE_DATA_ERROR: u8 = 10;

/// Phase of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum TransferPhase {
    /// Nothing read yet.
    #[default]
    Idle,
    /// Reading the frame length prefix.
    ReadHeaderSize,
    /// Reading the frame payload.
    ReadHeaderPayload,
    /// A bundle read was scheduled.
    ReadDataStarted,
    /// The bundle reader is producing bytes.
    ReadData,
    /// The bundle was read completely.
    ReadDataComplete,
    /// The bundle read failed.
    ReadDataError,
    /// A bundle write was scheduled.
    WriteDataStarted,
    /// The bundle writer is consuming bytes.
    WriteData,
    /// The bundle was written completely.
    WriteDataComplete,
    /// The bundle write failed.
    WriteDataError,
}

impl TransferPhase {
    /// Complete and error phases are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferPhase::ReadDataComplete
                | TransferPhase::ReadDataError
                | TransferPhase::WriteDataComplete
                | TransferPhase::WriteDataError
        )
    }

    /// True for the two error phases.
    pub fn is_error(self) -> bool {
        matches!(self, TransferPhase::ReadDataError | TransferPhase::WriteDataError)
    }
}

impl From<u8> for TransferPhase {
    fn from(raw: u8) -> Self {
        match raw {
            PHASE_READ_HEADER_SIZE => TransferPhase::ReadHeaderSize,
            PHASE_READ_HEADER_PAYLOAD => TransferPhase::ReadHeaderPayload,
            PHASE_READ_DATA_STARTED => TransferPhase::ReadDataStarted,
            PHASE_READ_DATA => TransferPhase::ReadData,
            PHASE_READ_DATA_COMPLETE => TransferPhase::ReadDataComplete,
            PHASE_READ_DATA_ERROR => TransferPhase::ReadDataError,
            PHASE_WRITE_DATA_STARTED => TransferPhase::WriteDataStarted,
            PHASE_WRITE_DATA => TransferPhase::WriteData,
            PHASE_WRITE_DATA_COMPLETE => TransferPhase::WriteDataComplete,
            PHASE_WRITE_DATA_ERROR => TransferPhase::WriteDataError,
            _ => TransferPhase::Idle,
        }
    }
}

impl From<TransferPhase> for u8 {
    fn from(phase: TransferPhase) -> Self {
        match phase {
            TransferPhase::Idle => PHASE_IDLE,
            TransferPhase::ReadHeaderSize => PHASE_READ_HEADER_SIZE,
            TransferPhase::ReadHeaderPayload => PHASE_READ_HEADER_PAYLOAD,
            TransferPhase::ReadDataStarted => PHASE_READ_DATA_STARTED,
            TransferPhase::ReadData => PHASE_READ_DATA,
            TransferPhase::ReadDataComplete => PHASE_READ_DATA_COMPLETE,
            TransferPhase::ReadDataError => PHASE_READ_DATA_ERROR,
            TransferPhase::WriteDataStarted => PHASE_WRITE_DATA_STARTED,
            TransferPhase::WriteData => PHASE_WRITE_DATA,
            TransferPhase::WriteDataComplete => PHASE_WRITE_DATA_COMPLETE,
            TransferPhase::WriteDataError => PHASE_WRITE_DATA_ERROR,
        }
    }
}

/// Counters of a finished transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferSummary {
    /// Bytes that crossed the pipe.
    pub transferred_bytes: u64,
    /// Bytes stored on disk.
    pub persisted_bytes: u64,
    /// Checksum of the stream.
    pub checksum: Vec<u8>,
}

/// Transfer progress shared between a connection and its background task.
#[derive(Debug, Default)]
pub struct TransferStatus {
    phase: AtomicU8,
    transferred_bytes: AtomicU64,
    persisted_bytes: AtomicU64,
    error_message: Mutex<Option<String>>,
    checksum: Mutex<Vec<u8>>,
    terminal: Notify,
}

impl TransferStatus {
    /// Creates an idle status.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    pub fn phase(&self) -> TransferPhase {
        TransferPhase::from(self.phase.load(Ordering::Acquire))
    }

    /// Moves to `next` unless the current phase is terminal.
    ///
    /// Returns whether the phase changed.
    pub fn set_phase(&self, next: TransferPhase) -> bool {
        let mut current = self.phase.load(Ordering::Acquire);
        loop {
            if TransferPhase::from(current).is_terminal() {
                return false;
            }
            match self.phase.compare_exchange_weak(
                current,
                next.into(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        trace!(from = ?TransferPhase::from(current), to = ?next, "transfer phase");
        if next.is_terminal() {
            self.terminal.notify_waiters();
        }
        true
    }

    /// Records the counters and moves to the terminal `phase`.
    pub fn complete(&self, phase: TransferPhase, transferred: u64, persisted: u64, checksum: Vec<u8>) -> bool {
        if self.phase().is_terminal() {
            return false;
        }
        self.transferred_bytes.store(transferred, Ordering::Release);
        self.persisted_bytes.store(persisted, Ordering::Release);
        *self.checksum.lock() = checksum;
        self.set_phase(phase)
    }

    /// Records `message` and moves to the terminal error `phase`.
    pub fn fail(&self, phase: TransferPhase, message: impl Into<String>) -> bool {
        let mut slot = self.error_message.lock();
        if self.phase().is_terminal() {
            return false;
        }
        *slot = Some(message.into());
        drop(slot);
        self.set_phase(phase)
    }

    /// Waits until the phase is terminal and returns it.
    pub async fn wait_terminal(&self) -> TransferPhase {
        loop {
            let notified = self.terminal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let phase = self.phase();
            if phase.is_terminal() {
                return phase;
            }
            notified.await;
        }
    }

    /// Like [`wait_terminal`](Self::wait_terminal), bounded by `limit`.
    pub async fn wait_terminal_for(&self, limit: Duration) -> Result<TransferPhase> {
        tokio::time::timeout(limit, self.wait_terminal())
            .await
            .map_err(|_| TransportError::Timeout {
                waited_ms: limit.as_millis() as u64,
            })
    }

    /// Bytes that crossed the pipe.
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Acquire)
    }

    /// Bytes stored on disk.
    pub fn persisted_bytes(&self) -> u64 {
        self.persisted_bytes.load(Ordering::Acquire)
    }

    /// Error recorded by [`fail`](Self::fail).
    pub fn error_message(&self) -> Option<String> {
        self.error_message.lock().clone()
    }

    /// Snapshot of the counters.
    pub fn summary(&self) -> TransferSummary {
        TransferSummary {
            transferred_bytes: self.transferred_bytes(),
            persisted_bytes: self.persisted_bytes(),
            checksum: self.checksum.lock().clone(),
        }
    }
}

/// Pipe ends held by the connection side of a transfer.
#[derive(Debug, Default)]
pub(crate) struct DataChannel {
    pub(crate) writer: Option<PipeWriter>,
    pub(crate) reader: Option<PipeReader>,
}

/// State of one connection: frame reassembly plus the running transfer.
#[derive(Debug)]
pub struct TransferState<M> {
    status: Arc<TransferStatus>,
    size_buf: [u8; FRAME_SIZE_PREFIX],
    size_filled: usize,
    payload: Option<Vec<u8>>,
    payload_filled: usize,
    message: Option<M>,
    pub(crate) channel: DataChannel,
}

impl<M> Default for TransferState<M> {
    fn default() -> Self {
        Self {
            status: Arc::new(TransferStatus::new()),
            size_buf: [0; FRAME_SIZE_PREFIX],
            size_filled: 0,
            payload: None,
            payload_filled: 0,
            message: None,
            channel: DataChannel::default(),
        }
    }
}

impl<M> TransferState<M> {
    /// Fresh state waiting for a frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// State for a message that did not come off the wire, such as the local
    /// side of a client transfer.
    pub fn with_message(message: M) -> Self {
        Self {
            message: Some(message),
            ..Self::default()
        }
    }

    /// Shared status.
    pub fn status(&self) -> &Arc<TransferStatus> {
        &self.status
    }

    /// Current phase.
    pub fn phase(&self) -> TransferPhase {
        self.status.phase()
    }

    /// The decoded message, once complete.
    pub fn message(&self) -> Option<&M> {
        self.message.as_ref()
    }

    /// Takes the decoded message out of the state.
    pub fn take_message(&mut self) -> Option<M> {
        self.message.take()
    }

    /// True while a pipe end is held.
    pub fn has_open_channel(&self) -> bool {
        self.channel.writer.is_some() || self.channel.reader.is_some()
    }

    /// Consumes frame bytes from `buf`.
    ///
    /// Returns `Ok(true)` once the whole frame has been read and decoded, and
    /// `Ok(false)` while more bytes are needed. Bytes past the frame stay in
    /// `buf`. Once complete, further calls return `Ok(true)` without touching
    /// `buf`.
    pub fn read_message<B, C>(&mut self, buf: &mut B, codec: &C) -> Result<bool>
    where
        B: Buf,
        C: MessageCodec<M> + ?Sized,
    {
        if self.message.is_some() {
            return Ok(true);
        }
        if self.phase() == TransferPhase::Idle {
            self.status.set_phase(TransferPhase::ReadHeaderSize);
        }

        while self.size_filled < FRAME_SIZE_PREFIX {
            if !buf.has_remaining() {
                return Ok(false);
            }
            let n = buf.remaining().min(FRAME_SIZE_PREFIX - self.size_filled);
            buf.copy_to_slice(&mut self.size_buf[self.size_filled..self.size_filled + n]);
            self.size_filled += n;
        }

        if self.payload.is_none() {
            let size = u32::from_be_bytes(self.size_buf);
            if size > MAX_FRAME_SIZE {
                return Err(TransportError::FrameTooLarge {
                    size,
                    max_size: MAX_FRAME_SIZE,
                });
            }
            self.payload = Some(vec![0; size as usize]);
            self.status.set_phase(TransferPhase::ReadHeaderPayload);
        }

        let payload = match self.payload.as_mut() {
            Some(payload) => payload,
            None => return Ok(false),
        };
        while self.payload_filled < payload.len() {
            if !buf.has_remaining() {
                return Ok(false);
            }
            let n = buf.remaining().min(payload.len() - self.payload_filled);
            buf.copy_to_slice(&mut payload[self.payload_filled..self.payload_filled + n]);
            self.payload_filled += n;
        }

        let message = codec.decode(payload.as_slice())?;
        self.message = Some(message);
        self.payload = None;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HeaderCodec, StorageMessageHeader};
    use jade_storage::StorageFormat;

    fn header() -> StorageMessageHeader {
        StorageMessageHeader::persist(StorageFormat::SingleDataFile, "/data/file", "token")
    }

    #[test]
    fn test_single_chunk() {
        let frame = HeaderCodec.encode(&header()).unwrap();
        let mut state = TransferState::new();
        let mut buf = &frame[..];
        assert!(state.read_message(&mut buf, &HeaderCodec).unwrap());
        assert_eq!(state.message(), Some(&header()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_one_byte_chunks() {
        let frame = HeaderCodec.encode(&header()).unwrap();
        let mut state = TransferState::new();
        for (i, byte) in frame.iter().enumerate() {
            let one = [*byte];
            let mut chunk = &one[..];
            let done = state.read_message(&mut chunk, &HeaderCodec).unwrap();
            assert_eq!(done, i == frame.len() - 1);
            assert!(chunk.is_empty());
        }
        assert_eq!(state.message(), Some(&header()));
        assert_eq!(state.phase(), TransferPhase::ReadHeaderPayload);
    }

    #[test]
    fn test_reread_is_idempotent() {
        let mut frame = HeaderCodec.encode(&header()).unwrap();
        frame.extend_from_slice(b"payload bytes");
        let mut state = TransferState::new();
        let mut buf = &frame[..];
        assert!(state.read_message(&mut buf, &HeaderCodec).unwrap());
        assert_eq!(buf, b"payload bytes");
        assert!(state.read_message(&mut buf, &HeaderCodec).unwrap());
        assert_eq!(buf, b"payload bytes");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut state: TransferState<StorageMessageHeader> = TransferState::new();
        let prefix = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let err = state.read_message(&mut &prefix[..], &HeaderCodec).unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        let mut frame = 3u32.to_be_bytes().to_vec();
        frame.extend_from_slice(&[0xff, 0xff, 0xff]);
        let mut state: TransferState<StorageMessageHeader> = TransferState::new();
        let err = state.read_message(&mut &frame[..], &HeaderCodec).unwrap_err();
        assert!(matches!(err, TransportError::MalformedFrame { .. }));
    }

    #[test]
    fn test_terminal_phase_is_sticky() {
        let status = TransferStatus::new();
        assert!(status.set_phase(TransferPhase::WriteDataStarted));
        assert!(status.complete(TransferPhase::WriteDataComplete, 10, 10, vec![1]));
        assert!(!status.set_phase(TransferPhase::WriteData));
        assert!(!status.fail(TransferPhase::WriteDataError, "late"));
        assert_eq!(status.phase(), TransferPhase::WriteDataComplete);
        assert_eq!(status.error_message(), None);
        assert_eq!(status.summary().transferred_bytes, 10);
    }

    #[test]
    fn test_error_phase_is_sticky() {
        let status = TransferStatus::new();
        assert!(status.fail(TransferPhase::ReadDataError, "boom"));
        assert!(!status.complete(TransferPhase::ReadDataComplete, 1, 1, Vec::new()));
        assert_eq!(status.phase(), TransferPhase::ReadDataError);
        assert_eq!(status.error_message().as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_wait_terminal_wakes() {
        let status = Arc::new(TransferStatus::new());
        let waiter = {
            let status = Arc::clone(&status);
            tokio::spawn(async move { status.wait_terminal().await })
        };
        tokio::task::yield_now().await;
        status.set_phase(TransferPhase::WriteData);
        status.fail(TransferPhase::WriteDataError, "disk full");
        assert_eq!(waiter.await.unwrap(), TransferPhase::WriteDataError);
    }

    #[tokio::test]
    async fn test_wait_terminal_times_out() {
        let status = TransferStatus::new();
        let err = status
            .wait_terminal_for(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
    }
}
