//! Streaming checksums for bundle transfers.
//!
//! Every bundle reader and writer passes the transferred bytes through one of
//! the wrappers below, so the byte count and SHA-256 digest of the stream come
//! out of the copy itself instead of a second pass over the data.

use std::io::{self, Read, Write};

use sha2::{Digest, Sha256};
use tracing::trace;

/// Running byte count and digest over a stream.
#[derive(Debug, Clone, Default)]
pub struct StreamDigest {
    hasher: Sha256,
    num_bytes: u64,
}

impl StreamDigest {
    /// Creates an empty digest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes into the digest.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.num_bytes += data.len() as u64;
    }

    /// Number of bytes seen so far.
    pub fn num_bytes(&self) -> u64 {
        self.num_bytes
    }

    /// Consumes the digest, returning the byte count and the SHA-256 value.
    pub fn finish(self) -> (u64, Vec<u8>) {
        trace!(num_bytes = self.num_bytes, "stream digest finished");
        (self.num_bytes, self.hasher.finalize().to_vec())
    }
}

/// Reader adapter that digests everything read through it.
pub struct DigestReader<R> {
    inner: R,
    digest: StreamDigest,
}

impl<R: Read> DigestReader<R> {
    /// Wraps a reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            digest: StreamDigest::new(),
        }
    }

    /// Returns the byte count and digest of what was read.
    pub fn finish(self) -> (u64, Vec<u8>) {
        self.digest.finish()
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}

/// Writer adapter that digests everything written through it.
pub struct DigestWriter<W> {
    inner: W,
    digest: StreamDigest,
}

impl<W: Write> DigestWriter<W> {
    /// Wraps a writer.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            digest: StreamDigest::new(),
        }
    }

    /// Flushes the inner writer and returns the byte count and digest.
    pub fn finish(mut self) -> io::Result<(u64, Vec<u8>)> {
        self.inner.flush()?;
        Ok(self.digest.finish())
    }

    /// Flushes and returns the inner writer with the byte count and digest.
    pub fn into_parts(mut self) -> io::Result<(W, u64, Vec<u8>)> {
        self.inner.flush()?;
        let (num_bytes, checksum) = self.digest.finish();
        Ok((self.inner, num_bytes, checksum))
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Lowercase hex rendering of a checksum, used in logs and the bundle store.
pub fn to_hex(checksum: &[u8]) -> String {
    checksum.iter().map(|b| format!("{:02x}", b)).collect()
}
