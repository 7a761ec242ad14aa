//! Storage formats a data bundle can be kept in.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Layout of a data bundle on a storage volume.
///
/// The wire names are the `SCREAMING_SNAKE_CASE` variant names, which is what
/// travels in request headers and what the serde representation uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageFormat {
    /// One regular file, streamed as raw bytes.
    SingleDataFile,
    /// An expanded directory tree, streamed as a tar archive.
    DataDirectory,
    /// A tar archive kept as a single file, streamed as its raw bytes.
    ArchiveDataFile,
}

impl StorageFormat {
    /// All known formats.
    pub const ALL: [StorageFormat; 3] = [
        StorageFormat::SingleDataFile,
        StorageFormat::DataDirectory,
        StorageFormat::ArchiveDataFile,
    ];

    /// Wire name of the format.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageFormat::SingleDataFile => "SINGLE_DATA_FILE",
            StorageFormat::DataDirectory => "DATA_DIRECTORY",
            StorageFormat::ArchiveDataFile => "ARCHIVE_DATA_FILE",
        }
    }

    /// Whether the byte stream for this format is a tar archive.
    pub fn is_archive_stream(&self) -> bool {
        !matches!(self, StorageFormat::SingleDataFile)
    }
}

impl fmt::Display for StorageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageFormat {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorageFormat::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| StorageError::UnsupportedFormat {
                format: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wire_names() {
        for format in StorageFormat::ALL {
            assert_eq!(format.as_str().parse::<StorageFormat>().unwrap(), format);
        }
        assert_eq!(
            "data_directory".parse::<StorageFormat>().unwrap(),
            StorageFormat::DataDirectory
        );
    }

    #[test]
    fn test_unknown_name_rejected() {
        let err = "ZIP".parse::<StorageFormat>().unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedFormat { .. }));
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let json = serde_json::to_string(&StorageFormat::ArchiveDataFile).unwrap();
        assert_eq!(json, "\"ARCHIVE_DATA_FILE\"");
    }

    #[test]
    fn test_archive_stream() {
        assert!(!StorageFormat::SingleDataFile.is_archive_stream());
        assert!(StorageFormat::DataDirectory.is_archive_stream());
        assert!(StorageFormat::ArchiveDataFile.is_archive_stream());
    }
}
