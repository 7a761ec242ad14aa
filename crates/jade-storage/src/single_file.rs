//! Single regular file bundles.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use tracing::debug;

use crate::atomic_write::{commit_file, ensure_absent, staging_file};
use crate::bundle::{require_source, BundleReader, BundleWriter, TransferInfo};
use crate::checksum::{DigestReader, DigestWriter};
use crate::error::{StorageError, StorageResult};
use crate::format::StorageFormat;

const FORMATS: &[StorageFormat] = &[StorageFormat::SingleDataFile];

/// Streams a single file as raw bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleFileBundleReader;

impl BundleReader for SingleFileBundleReader {
    fn supported_formats(&self) -> &[StorageFormat] {
        FORMATS
    }

    fn read_bundle(&self, source: &Path, out: &mut dyn Write) -> StorageResult<TransferInfo> {
        require_source(source)?;
        if !source.is_file() {
            return Err(StorageError::InvalidPath {
                path: source.display().to_string(),
                reason: "not a regular file".to_string(),
            });
        }
        let mut reader = DigestReader::new(BufReader::new(File::open(source)?));
        io::copy(&mut reader, out)?;
        out.flush()?;
        let info = TransferInfo::from(reader.finish());
        debug!(source = %source.display(), num_bytes = info.num_bytes, "read single file bundle");
        Ok(info)
    }
}

/// Stores a raw byte stream as a single file.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleFileBundleWriter;

impl BundleWriter for SingleFileBundleWriter {
    fn supported_formats(&self) -> &[StorageFormat] {
        FORMATS
    }

    fn write_bundle(&self, input: &mut dyn Read, target: &Path) -> StorageResult<TransferInfo> {
        ensure_absent(target)?;
        let staged = staging_file(target)?;
        let mut writer = DigestWriter::new(staged);
        io::copy(input, &mut writer)?;
        let (staged, num_bytes, checksum) = writer.into_parts()?;
        commit_file(staged, target)?;
        let info = TransferInfo::new(num_bytes, checksum);
        debug!(target = %target.display(), num_bytes = info.num_bytes, "wrote single file bundle");
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_round_trip_ten_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.bin");
        fs::write(&source, b"0123456789").unwrap();

        let mut stream = Vec::new();
        let read = SingleFileBundleReader.read_bundle(&source, &mut stream).unwrap();
        assert_eq!(read.num_bytes, 10);

        let target = dir.path().join("copy/dst.bin");
        let written = SingleFileBundleWriter
            .write_bundle(&mut &stream[..], &target)
            .unwrap();
        assert_eq!(written, read);
        assert_eq!(fs::read(&target).unwrap(), b"0123456789");
    }

    #[test]
    fn test_zero_length_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("empty");
        let info = SingleFileBundleWriter
            .write_bundle(&mut io::empty(), &target)
            .unwrap();
        assert_eq!(info.num_bytes, 0);
        assert_eq!(fs::metadata(&target).unwrap().len(), 0);
    }

    #[test]
    fn test_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("missing");
        let err = SingleFileBundleReader
            .read_bundle(&source, &mut Vec::new())
            .unwrap_err();
        assert_eq!(err.to_string(), format!("No file found for {}", source.display()));
    }

    #[test]
    fn test_existing_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("dst");
        fs::write(&target, b"keep").unwrap();
        let err = SingleFileBundleWriter
            .write_bundle(&mut &b"new"[..], &target)
            .unwrap_err();
        assert!(err.is_target_exists());
        assert_eq!(fs::read(&target).unwrap(), b"keep");
    }
}
