//! Atomic placement of bundle targets.
//!
//! Writers never stream into the final location. Data lands in a temporary
//! sibling of the target first and is renamed into place only once the stream
//! completed, so a failed or rejected write leaves nothing behind.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::{NamedTempFile, TempDir};
use tracing::debug;

use crate::error::{StorageError, StorageResult};

const TEMP_PREFIX: &str = ".jade-tmp-";

/// Fails with `TargetAlreadyExists` if anything lives at `target`.
pub fn ensure_absent(target: &Path) -> StorageResult<()> {
    if target.symlink_metadata().is_ok() {
        return Err(StorageError::TargetAlreadyExists {
            path: target.display().to_string(),
        });
    }
    Ok(())
}

/// Creates the parent directories of `target` and returns the parent.
pub fn prepare_parent(target: &Path) -> StorageResult<PathBuf> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        Some(_) => PathBuf::from("."),
        None => {
            return Err(StorageError::InvalidPath {
                path: target.display().to_string(),
                reason: "target has no parent directory".to_string(),
            })
        }
    };
    fs::create_dir_all(&parent)?;
    Ok(parent)
}

/// Temporary file next to `target`, to be committed with [`commit_file`].
pub fn staging_file(target: &Path) -> StorageResult<NamedTempFile> {
    let parent = prepare_parent(target)?;
    let file = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent)?;
    Ok(file)
}

/// Temporary directory next to `target`, to be committed with [`commit_dir`].
pub fn staging_dir(target: &Path) -> StorageResult<TempDir> {
    let parent = prepare_parent(target)?;
    let dir = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempdir_in(parent)?;
    Ok(dir)
}

/// Moves a finished staging file to `target` without replacing anything there.
pub fn commit_file(staged: NamedTempFile, target: &Path) -> StorageResult<()> {
    staged.as_file().sync_all()?;
    staged
        .persist_noclobber(target)
        .map_err(|e| exists_or_io(e.error, target))?;
    debug!(target = %target.display(), "committed staged file");
    Ok(())
}

fn exists_or_io(e: std::io::Error, target: &Path) -> StorageError {
    if e.kind() == std::io::ErrorKind::AlreadyExists {
        StorageError::TargetAlreadyExists {
            path: target.display().to_string(),
        }
    } else {
        StorageError::Io(e)
    }
}

/// Moves a finished staging directory to `target`.
///
/// The name is claimed with `mkdir(2)` first, which fails for every committer
/// but one. `rename(2)` then replaces the claimed empty directory in one step.
pub fn commit_dir(staged: TempDir, target: &Path) -> StorageResult<()> {
    fs::create_dir(target).map_err(|e| exists_or_io(e, target))?;
    if let Err(e) = fs::rename(staged.path(), target) {
        // A non-empty claim means someone wrote into it after we created it.
        return Err(match fs::remove_dir(target) {
            Ok(()) => StorageError::Io(e),
            Err(_) => StorageError::TargetAlreadyExists {
                path: target.display().to_string(),
            },
        });
    }
    debug!(target = %target.display(), "committed staged directory");
    // The staging path is gone; dropping `staged` finds nothing to clean up.
    drop(staged);
    Ok(())
}
