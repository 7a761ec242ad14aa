#![warn(missing_docs)]

//! JADE storage subsystem: bundle formats, bundle readers/writers, volume selection
//!
//! This crate holds everything that touches a storage volume directly. It
//! serializes stored bundles to and from byte streams in one of the supported
//! storage formats, keeps the volume and bundle records behind persistence
//! traits, and decides which volume a new bundle lands on.

pub mod archive;
pub mod atomic_write;
pub mod bundle;
pub mod checksum;
pub mod dao;
pub mod directory;
pub mod error;
pub mod format;
pub mod selector;
pub mod single_file;
pub mod volume;

pub use archive::{ArchiveBundleReader, ArchiveBundleWriter};
pub use bundle::{persisted_size, BundleIoProvider, BundleReader, BundleWriter, TransferInfo};
pub use checksum::{to_hex, DigestReader, DigestWriter, StreamDigest};
pub use dao::{BundleDao, InMemoryBundleDao, InMemoryVolumeDao, StorageVolumeDao};
pub use directory::{DataDirectoryBundleReader, DataDirectoryBundleWriter};
pub use error::{StorageError, StorageResult};
pub use format::StorageFormat;
pub use selector::{
    ChainedVolumeSelector, LocalStorageVolumeSelector, OverflowStorageVolumeSelector,
    ServePredicate, SharedStorageVolumeSelector, StorageVolumeSelector,
};
pub use single_file::{SingleFileBundleReader, SingleFileBundleWriter};
pub use volume::{
    BundleUpdate, DataBundle, StorageVolume, VolumeQuery, VolumeRequest, VolumeUpdate,
    OVERFLOW_VOLUME, OWNER_PLACEHOLDER,
};
