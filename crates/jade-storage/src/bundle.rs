//! Bundle reader/writer contract.
//!
//! A bundle reader serializes a stored bundle into a byte stream and a bundle
//! writer does the reverse. Both report a [`TransferInfo`] with the number of
//! stream bytes and their checksum. Readers and writers are looked up by
//! [`StorageFormat`] through a [`BundleIoProvider`].

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::archive::{ArchiveBundleReader, ArchiveBundleWriter};
use crate::directory::{DataDirectoryBundleReader, DataDirectoryBundleWriter};
use crate::error::{StorageError, StorageResult};
use crate::format::StorageFormat;
use crate::single_file::{SingleFileBundleReader, SingleFileBundleWriter};

/// Outcome of a bundle read or write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInfo {
    /// Bytes that crossed the stream.
    pub num_bytes: u64,
    /// SHA-256 of the stream bytes.
    pub checksum: Vec<u8>,
}

impl TransferInfo {
    /// Builds a transfer result from a byte count and checksum.
    pub fn new(num_bytes: u64, checksum: Vec<u8>) -> Self {
        Self {
            num_bytes,
            checksum,
        }
    }
}

impl From<(u64, Vec<u8>)> for TransferInfo {
    fn from((num_bytes, checksum): (u64, Vec<u8>)) -> Self {
        Self::new(num_bytes, checksum)
    }
}

/// Serializes a stored bundle into a stream.
pub trait BundleReader: Send + Sync {
    /// Formats this reader understands.
    fn supported_formats(&self) -> &[StorageFormat];

    /// Streams the bundle stored at `source` into `out`.
    fn read_bundle(&self, source: &Path, out: &mut dyn Write) -> StorageResult<TransferInfo>;
}

/// Materializes a stream as a stored bundle.
pub trait BundleWriter: Send + Sync {
    /// Formats this writer understands.
    fn supported_formats(&self) -> &[StorageFormat];

    /// Consumes `input` and stores it at `target`.
    ///
    /// Fails with [`StorageError::TargetAlreadyExists`] without touching
    /// `target` when it is already populated.
    fn write_bundle(&self, input: &mut dyn Read, target: &Path) -> StorageResult<TransferInfo>;
}

/// Registry of readers and writers keyed by format.
#[derive(Clone)]
pub struct BundleIoProvider {
    readers: HashMap<StorageFormat, Arc<dyn BundleReader>>,
    writers: HashMap<StorageFormat, Arc<dyn BundleWriter>>,
}

impl BundleIoProvider {
    /// Creates a provider with nothing registered.
    pub fn empty() -> Self {
        Self {
            readers: HashMap::new(),
            writers: HashMap::new(),
        }
    }

    /// Registers a reader for all formats it supports.
    pub fn with_reader(mut self, reader: Arc<dyn BundleReader>) -> Self {
        for format in reader.supported_formats() {
            self.readers.insert(*format, Arc::clone(&reader));
        }
        self
    }

    /// Registers a writer for all formats it supports.
    pub fn with_writer(mut self, writer: Arc<dyn BundleWriter>) -> Self {
        for format in writer.supported_formats() {
            self.writers.insert(*format, Arc::clone(&writer));
        }
        self
    }

    /// Reader for `format`.
    pub fn reader(&self, format: StorageFormat) -> StorageResult<Arc<dyn BundleReader>> {
        self.readers
            .get(&format)
            .cloned()
            .ok_or_else(|| StorageError::UnsupportedFormat {
                format: format.to_string(),
            })
    }

    /// Writer for `format`.
    pub fn writer(&self, format: StorageFormat) -> StorageResult<Arc<dyn BundleWriter>> {
        self.writers
            .get(&format)
            .cloned()
            .ok_or_else(|| StorageError::UnsupportedFormat {
                format: format.to_string(),
            })
    }
}

impl Default for BundleIoProvider {
    fn default() -> Self {
        Self::empty()
            .with_reader(Arc::new(SingleFileBundleReader))
            .with_reader(Arc::new(DataDirectoryBundleReader))
            .with_reader(Arc::new(ArchiveBundleReader))
            .with_writer(Arc::new(SingleFileBundleWriter))
            .with_writer(Arc::new(DataDirectoryBundleWriter))
            .with_writer(Arc::new(ArchiveBundleWriter))
    }
}

impl std::fmt::Debug for BundleIoProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleIoProvider")
            .field("readers", &self.readers.keys().collect::<Vec<_>>())
            .field("writers", &self.writers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Size on disk of a stored bundle: the file length, or the sum of all file
/// lengths below a directory.
pub fn persisted_size(path: &Path) -> StorageResult<u64> {
    let meta = path.metadata()?;
    if meta.is_file() {
        return Ok(meta.len());
    }
    let mut total = 0u64;
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(|e| StorageError::Io(e.into()))?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(|e| StorageError::Io(e.into()))?.len();
        }
    }
    Ok(total)
}

/// Fails with `SourceNotFound` unless `source` exists.
pub(crate) fn require_source(source: &Path) -> StorageResult<()> {
    if !source.exists() {
        return Err(StorageError::SourceNotFound {
            path: source.display().to_string(),
        });
    }
    Ok(())
}
