//! Tar archive bundles kept as a single file on the volume.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use tracing::debug;

use crate::atomic_write::{commit_file, ensure_absent, staging_file};
use crate::bundle::{require_source, BundleReader, BundleWriter, TransferInfo};
use crate::checksum::{DigestReader, DigestWriter};
use crate::directory::write_tar;
use crate::error::StorageResult;
use crate::format::StorageFormat;

const FORMATS: &[StorageFormat] = &[StorageFormat::ArchiveDataFile];

/// Streams a stored archive byte for byte.
///
/// A directory source is archived on the fly so the stream is a tar archive
/// either way.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveBundleReader;

impl BundleReader for ArchiveBundleReader {
    fn supported_formats(&self) -> &[StorageFormat] {
        FORMATS
    }

    fn read_bundle(&self, source: &Path, out: &mut dyn Write) -> StorageResult<TransferInfo> {
        require_source(source)?;
        if source.is_dir() {
            return write_tar(source, out);
        }
        let mut reader = DigestReader::new(BufReader::new(File::open(source)?));
        io::copy(&mut reader, out)?;
        out.flush()?;
        let info = TransferInfo::from(reader.finish());
        debug!(source = %source.display(), num_bytes = info.num_bytes, "read archive bundle");
        Ok(info)
    }
}

/// Stores an incoming tar stream as one archive file.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveBundleWriter;

impl BundleWriter for ArchiveBundleWriter {
    fn supported_formats(&self) -> &[StorageFormat] {
        FORMATS
    }

    fn write_bundle(&self, input: &mut dyn Read, target: &Path) -> StorageResult<TransferInfo> {
        ensure_absent(target)?;
        let mut writer = DigestWriter::new(staging_file(target)?);
        io::copy(input, &mut writer)?;
        let (staged, num_bytes, checksum) = writer.into_parts()?;
        commit_file(staged, target)?;
        debug!(target = %target.display(), num_bytes, "wrote archive bundle");
        Ok(TransferInfo::new(num_bytes, checksum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::DataDirectoryBundleWriter;
    use std::fs;

    #[test]
    fn test_directory_stored_as_archive_then_expanded() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(&source).unwrap();
        for (name, len) in [("one", 1usize), ("two", 22), ("three", 333)] {
            fs::write(source.join(name), vec![7u8; len]).unwrap();
        }

        let mut stream = Vec::new();
        ArchiveBundleReader.read_bundle(&source, &mut stream).unwrap();
        let archive = dir.path().join("stored.tar");
        let stored = ArchiveBundleWriter
            .write_bundle(&mut &stream[..], &archive)
            .unwrap();
        assert_eq!(stored.num_bytes, fs::metadata(&archive).unwrap().len());

        let mut replay = Vec::new();
        let replayed = ArchiveBundleReader.read_bundle(&archive, &mut replay).unwrap();
        assert_eq!(replayed, stored);

        let expanded = dir.path().join("expanded");
        DataDirectoryBundleWriter
            .write_bundle(&mut &replay[..], &expanded)
            .unwrap();
        for (name, len) in [("one", 1u64), ("two", 22), ("three", 333)] {
            assert_eq!(fs::metadata(expanded.join(name)).unwrap().len(), len);
        }
    }
}
