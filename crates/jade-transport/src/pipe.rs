//! Bounded in-process byte pipe between a connection task and a pool thread.
//!
//! The pipe is a bounded channel of byte chunks. Each end has an async face
//! used by the connection task and a blocking `std::io` face used by the
//! bundle reader or writer running on a blocking pool thread. A full pipe
//! blocks the producer, so a fast socket never buffers more than
//! `capacity * chunk_size` bytes ahead of the disk.
//!
//! Dropping the writer is end-of-stream. [`PipeWriter::abort`] ends the stream
//! with an error instead, so a consumer can tell a truncated transfer from a
//! complete one.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use tokio::sync::mpsc;

/// Creates a pipe holding at most `capacity` chunks of up to `chunk_size` bytes.
pub fn data_pipe(capacity: usize, chunk_size: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let aborted = Arc::new(AtomicBool::new(false));
    (
        PipeWriter {
            tx,
            chunk_size: chunk_size.max(1),
            aborted: Arc::clone(&aborted),
        },
        PipeReader {
            rx,
            pending: Bytes::new(),
            aborted,
        },
    )
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed")
}

/// Producing end of a pipe.
#[derive(Debug)]
pub struct PipeWriter {
    tx: mpsc::Sender<Bytes>,
    chunk_size: usize,
    aborted: Arc<AtomicBool>,
}

impl PipeWriter {
    /// Sends `data`, waiting for room in the pipe.
    pub async fn send(&self, data: &[u8]) -> io::Result<()> {
        for chunk in data.chunks(self.chunk_size) {
            self.tx
                .send(Bytes::copy_from_slice(chunk))
                .await
                .map_err(|_| broken_pipe())?;
        }
        Ok(())
    }

    /// True once the reader is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Ends the stream with an error visible to the reader.
    pub fn abort(self) {
        self.aborted.store(true, Ordering::Release);
    }
}

impl io::Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(self.chunk_size);
        self.tx
            .blocking_send(Bytes::copy_from_slice(&buf[..n]))
            .map_err(|_| broken_pipe())?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Consuming end of a pipe.
#[derive(Debug)]
pub struct PipeReader {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
    aborted: Arc<AtomicBool>,
}

impl PipeReader {
    /// Reads into `buf`, waiting for data. Returns 0 at end-of-stream.
    pub async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.pending.has_remaining() {
            match self.rx.recv().await {
                Some(chunk) => self.pending = chunk,
                None => return self.end_of_stream(),
            }
        }
        Ok(self.drain_pending(buf))
    }

    /// Stops accepting data; the writer sees a broken pipe.
    pub fn close(&mut self) {
        self.rx.close();
    }

    fn drain_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending.len());
        self.pending.copy_to_slice(&mut buf[..n]);
        n
    }

    fn end_of_stream(&self) -> io::Result<usize> {
        if self.aborted.load(Ordering::Acquire) {
            Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "transfer aborted by peer",
            ))
        } else {
            Ok(0)
        }
    }
}

impl io::Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.pending.has_remaining() {
            match self.rx.blocking_recv() {
                Some(chunk) => self.pending = chunk,
                None => return self.end_of_stream(),
            }
        }
        Ok(self.drain_pending(buf))
    }
}
