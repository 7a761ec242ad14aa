//! Error types for the storage subsystem.

use thiserror::Error;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The source of a read does not exist.
    #[error("No file found for {path}")]
    SourceNotFound {
        /// The missing source path.
        path: String,
    },

    /// The destination of a write is already populated.
    #[error("Target path {path} already exists")]
    TargetAlreadyExists {
        /// The existing target path.
        path: String,
    },

    /// No reader or writer is registered for the requested format.
    #[error("Unsupported storage format: {format}")]
    UnsupportedFormat {
        /// Wire name of the format.
        format: String,
    },

    /// A path cannot be used for the requested operation.
    #[error("Invalid path {path}: {reason}")]
    InvalidPath {
        /// The offending path.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Building or unpacking a tar stream failed.
    #[error("Archive error: {reason}")]
    Archive {
        /// Description of the archive failure.
        reason: String,
    },

    /// The requested volume is not known to the volume store.
    #[error("Volume not found: {id}")]
    VolumeNotFound {
        /// The missing volume id.
        id: u64,
    },

    /// The requested bundle is not known to the bundle store.
    #[error("Bundle not found: {id}")]
    BundleNotFound {
        /// The missing bundle id.
        id: u64,
    },
}

impl StorageError {
    /// Returns true when the error reports an already populated target.
    pub fn is_target_exists(&self) -> bool {
        matches!(self, StorageError::TargetAlreadyExists { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_path() {
        let err = StorageError::TargetAlreadyExists {
            path: "/data/p".to_string(),
        };
        assert_eq!(err.to_string(), "Target path /data/p already exists");
        assert!(err.is_target_exists());

        let err = StorageError::SourceNotFound {
            path: "/data/missing".to_string(),
        };
        assert_eq!(err.to_string(), "No file found for /data/missing");
        assert!(!err.is_target_exists());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: StorageError = io.into();
        assert!(matches!(err, StorageError::Io(_)));
    }
}
