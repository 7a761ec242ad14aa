//! Socket helpers shared by the agent listener and the client.
//!
//! Every read is bounded by `select_timeout`; a connection that misses
//! `max_consecutive_timeouts` reads in a row is given up on.

use std::io;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Result, TransportError};
use crate::protocol::MessageCodec;
use crate::transfer::TransferState;

/// Bounded-wait rules for socket reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadTimeouts {
    /// Longest a single read may wait.
    pub select_timeout: Duration,
    /// Reads allowed to time out in a row before giving up.
    pub max_consecutive_timeouts: u32,
}

impl Default for ReadTimeouts {
    fn default() -> Self {
        Self {
            select_timeout: Duration::from_secs(10),
            max_consecutive_timeouts: 5,
        }
    }
}

impl ReadTimeouts {
    /// Longest time a peer may stay silent.
    pub fn total(&self) -> Duration {
        self.select_timeout * self.max_consecutive_timeouts.max(1)
    }
}

/// Opens a connection to `addr`, bounded by `connect_timeout_ms`.
pub async fn connect(addr: &str, connect_timeout_ms: u64, nodelay: bool) -> Result<TcpStream> {
    let timeout = Duration::from_millis(connect_timeout_ms);
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::ConnectionTimeout {
            addr: addr.to_string(),
            timeout_ms: connect_timeout_ms,
        })?
        .map_err(TransportError::Io)?;
    if nodelay {
        stream.set_nodelay(true).map_err(TransportError::Io)?;
    }
    tracing::debug!(addr = addr, "connected to storage agent");
    Ok(stream)
}

fn map_read_error(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe => {
            TransportError::ConnectionReset
        }
        _ => TransportError::Io(e),
    }
}

/// Reads whatever is available into `buf`. Returns 0 when the peer closed
/// its write half.
pub async fn read_some<R>(reader: &mut R, buf: &mut [u8], timeouts: &ReadTimeouts) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut misses = 0u32;
    loop {
        match tokio::time::timeout(timeouts.select_timeout, reader.read(buf)).await {
            Ok(Ok(n)) => return Ok(n),
            Ok(Err(e)) => return Err(map_read_error(e)),
            Err(_) => {
                misses += 1;
                tracing::debug!(misses, "socket read timed out");
                if misses >= timeouts.max_consecutive_timeouts.max(1) {
                    return Err(TransportError::Timeout {
                        waited_ms: timeouts.total().as_millis() as u64,
                    });
                }
            }
        }
    }
}

/// Reads one frame into `state`.
///
/// Bytes are accumulated in `pending`; whatever arrives past the frame stays
/// there for the data phase. A peer that closes mid-frame is a reset.
pub async fn read_frame<R, M, C>(
    reader: &mut R,
    state: &mut TransferState<M>,
    codec: &C,
    pending: &mut BytesMut,
    timeouts: &ReadTimeouts,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    C: MessageCodec<M> + ?Sized,
{
    let mut chunk = [0u8; 4096];
    loop {
        if state.read_message(pending, codec)? {
            return Ok(());
        }
        let n = read_some(reader, &mut chunk, timeouts).await?;
        if n == 0 {
            return Err(TransportError::ConnectionReset);
        }
        pending.extend_from_slice(&chunk[..n]);
    }
}

/// Encodes `message` and writes the whole frame.
pub async fn write_frame<W, M, C>(writer: &mut W, codec: &C, message: &M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    C: MessageCodec<M> + ?Sized,
{
    let bytes = codec.encode(message)?;
    writer.write_all(&bytes).await.map_err(TransportError::Io)?;
    writer.flush().await.map_err(TransportError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HeaderCodec, StorageMessageHeader};
    use jade_storage::StorageFormat;

    #[tokio::test]
    async fn test_frame_over_duplex_keeps_trailing_bytes() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let header = StorageMessageHeader::persist(StorageFormat::SingleDataFile, "/data/x", "tok");
        let mut bytes = HeaderCodec.encode(&header).unwrap();
        bytes.extend_from_slice(b"payload");
        let writer = tokio::spawn(async move {
            client.write_all(&bytes).await.unwrap();
            client.shutdown().await.unwrap();
        });

        let mut state = TransferState::new();
        let mut pending = BytesMut::new();
        read_frame(&mut server, &mut state, &HeaderCodec, &mut pending, &ReadTimeouts::default())
            .await
            .unwrap();
        writer.await.unwrap();
        assert_eq!(state.message(), Some(&header));
        let mut rest = pending.to_vec();
        let mut tail = Vec::new();
        server.read_to_end(&mut tail).await.unwrap();
        rest.extend_from_slice(&tail);
        assert_eq!(rest, b"payload");
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_reset() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 9, 1]).await.unwrap();
        drop(client);
        let mut state: TransferState<StorageMessageHeader> = TransferState::new();
        let mut pending = BytesMut::new();
        let err = read_frame(&mut server, &mut state, &HeaderCodec, &mut pending, &ReadTimeouts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionReset));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (_client, mut server) = tokio::io::duplex(64);
        let timeouts = ReadTimeouts {
            select_timeout: Duration::from_millis(100),
            max_consecutive_timeouts: 3,
        };
        let mut buf = [0u8; 8];
        let err = read_some(&mut server, &mut buf, &timeouts).await.unwrap_err();
        match err {
            TransportError::Timeout { waited_ms } => assert_eq!(waited_ms, 300),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_connect_refused_is_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(connect(&addr, 1000, true).await.is_err());
    }
}
