//! Expanded directory bundles, streamed as tar archives.

use std::io::{self, Read, Write};
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

use crate::atomic_write::{commit_dir, ensure_absent, staging_dir};
use crate::bundle::{require_source, BundleReader, BundleWriter, TransferInfo};
use crate::checksum::{DigestReader, DigestWriter};
use crate::error::{StorageError, StorageResult};
use crate::format::StorageFormat;

const FORMATS: &[StorageFormat] = &[StorageFormat::DataDirectory];

fn archive_err(e: io::Error) -> StorageError {
    StorageError::Archive {
        reason: e.to_string(),
    }
}

/// Writes `source` as a tar stream into `out`.
///
/// Directory entries are stored relative to `source` in file name order. A
/// regular file source produces an archive with that single entry.
pub(crate) fn write_tar(source: &Path, out: &mut dyn Write) -> StorageResult<TransferInfo> {
    let mut builder = tar::Builder::new(DigestWriter::new(out));
    if source.is_dir() {
        for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| StorageError::Io(e.into()))?;
            let rel = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| StorageError::InvalidPath {
                    path: entry.path().display().to_string(),
                    reason: e.to_string(),
                })?;
            if entry.file_type().is_dir() {
                builder.append_dir(rel, entry.path()).map_err(archive_err)?;
            } else {
                builder
                    .append_path_with_name(entry.path(), rel)
                    .map_err(archive_err)?;
            }
        }
    } else {
        let name = source.file_name().ok_or_else(|| StorageError::InvalidPath {
            path: source.display().to_string(),
            reason: "source has no file name".to_string(),
        })?;
        builder
            .append_path_with_name(source, name)
            .map_err(archive_err)?;
    }
    let digest = builder.into_inner().map_err(archive_err)?;
    Ok(TransferInfo::from(digest.finish()?))
}

/// Streams a directory tree as a tar archive.
#[derive(Debug, Default, Clone, Copy)]
pub struct DataDirectoryBundleReader;

impl BundleReader for DataDirectoryBundleReader {
    fn supported_formats(&self) -> &[StorageFormat] {
        FORMATS
    }

    fn read_bundle(&self, source: &Path, out: &mut dyn Write) -> StorageResult<TransferInfo> {
        require_source(source)?;
        let info = write_tar(source, out)?;
        debug!(source = %source.display(), num_bytes = info.num_bytes, "read directory bundle");
        Ok(info)
    }
}

/// Expands a tar stream into a new directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct DataDirectoryBundleWriter;

impl BundleWriter for DataDirectoryBundleWriter {
    fn supported_formats(&self) -> &[StorageFormat] {
        FORMATS
    }

    fn write_bundle(&self, input: &mut dyn Read, target: &Path) -> StorageResult<TransferInfo> {
        ensure_absent(target)?;
        let staged = staging_dir(target)?;
        let mut archive = tar::Archive::new(DigestReader::new(input));
        archive.unpack(staged.path()).map_err(archive_err)?;
        let mut reader = archive.into_inner();
        // The end-of-archive marker may not be fully consumed by unpack.
        io::copy(&mut reader, &mut io::sink())?;
        let info = TransferInfo::from(reader.finish());
        commit_dir(staged, target)?;
        debug!(target = %target.display(), num_bytes = info.num_bytes, "wrote directory bundle");
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a.txt"), b"alpha").unwrap();
        fs::write(root.join("b.txt"), b"bravo!").unwrap();
        fs::write(root.join("sub/c.txt"), b"charlie..").unwrap();
    }

    #[test]
    fn test_directory_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        sample_tree(&source);

        let mut stream = Vec::new();
        let read = DataDirectoryBundleReader
            .read_bundle(&source, &mut stream)
            .unwrap();
        assert_eq!(read.num_bytes, stream.len() as u64);

        let target = dir.path().join("dst");
        let written = DataDirectoryBundleWriter
            .write_bundle(&mut &stream[..], &target)
            .unwrap();
        assert_eq!(written, read);
        assert_eq!(fs::read(target.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(fs::read(target.join("b.txt")).unwrap(), b"bravo!");
        assert_eq!(fs::read(target.join("sub/c.txt")).unwrap(), b"charlie..");
    }

    #[test]
    fn test_garbage_stream_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("dst");
        let garbage = vec![0x41u8; 700];
        let result = DataDirectoryBundleWriter.write_bundle(&mut &garbage[..], &target);
        assert!(result.is_err());
        assert!(!target.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_existing_target_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = DataDirectoryBundleWriter
            .write_bundle(&mut io::empty(), dir.path())
            .unwrap_err();
        assert!(err.is_target_exists());
    }
}
