//! Persistence interfaces for volumes and bundles, with in-memory stores.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::volume::{BundleUpdate, DataBundle, StorageVolume, VolumeQuery, VolumeUpdate};

/// Volume persistence.
pub trait StorageVolumeDao: Send + Sync {
    /// Looks up a volume by id.
    fn find_volume_by_id(&self, id: u64) -> StorageResult<Option<StorageVolume>>;

    /// Volumes matching `query`, in ascending id order.
    fn find_matching_volumes(&self, query: &VolumeQuery) -> StorageResult<Vec<StorageVolume>>;

    /// Applies `update` to the volume `id`.
    fn update_volume(&self, id: u64, update: VolumeUpdate) -> StorageResult<StorageVolume>;
}

/// Bundle persistence.
pub trait BundleDao: Send + Sync {
    /// Looks up a bundle by id.
    fn find_bundle_by_id(&self, id: u64) -> StorageResult<Option<DataBundle>>;

    /// Saves a bundle, assigning an id if it has none.
    fn save_bundle(&self, bundle: DataBundle) -> StorageResult<DataBundle>;

    /// Applies `update` to the bundle `id`.
    fn update_bundle(&self, id: u64, update: BundleUpdate) -> StorageResult<DataBundle>;
}

/// Volume store backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryVolumeDao {
    volumes: RwLock<BTreeMap<u64, StorageVolume>>,
}

impl InMemoryVolumeDao {
    /// Creates a store holding `volumes`.
    pub fn new(volumes: impl IntoIterator<Item = StorageVolume>) -> Self {
        Self {
            volumes: RwLock::new(volumes.into_iter().map(|v| (v.id, v)).collect()),
        }
    }

    /// Adds or replaces a volume.
    pub fn insert(&self, volume: StorageVolume) {
        self.volumes.write().insert(volume.id, volume);
    }
}

impl StorageVolumeDao for InMemoryVolumeDao {
    fn find_volume_by_id(&self, id: u64) -> StorageResult<Option<StorageVolume>> {
        Ok(self.volumes.read().get(&id).cloned())
    }

    fn find_matching_volumes(&self, query: &VolumeQuery) -> StorageResult<Vec<StorageVolume>> {
        Ok(self
            .volumes
            .read()
            .values()
            .filter(|v| query.matches(v))
            .cloned()
            .collect())
    }

    fn update_volume(&self, id: u64, update: VolumeUpdate) -> StorageResult<StorageVolume> {
        let mut volumes = self.volumes.write();
        let volume = volumes
            .get_mut(&id)
            .ok_or(StorageError::VolumeNotFound { id })?;
        if let Some(space) = update.available_space_bytes {
            volume.available_space_bytes = Some(space);
        }
        if let Some(full) = update.percentage_full {
            volume.percentage_full = Some(full);
        }
        if let Some(url) = update.access_url {
            volume.access_url = Some(url);
        }
        if let Some(active) = update.active {
            volume.active = active;
        }
        Ok(volume.clone())
    }
}

/// Bundle store backed by a map with sequential ids.
#[derive(Debug)]
pub struct InMemoryBundleDao {
    bundles: RwLock<BTreeMap<u64, DataBundle>>,
    next_id: AtomicU64,
}

impl Default for InMemoryBundleDao {
    fn default() -> Self {
        Self {
            bundles: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl InMemoryBundleDao {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored bundles.
    pub fn len(&self) -> usize {
        self.bundles.read().len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BundleDao for InMemoryBundleDao {
    fn find_bundle_by_id(&self, id: u64) -> StorageResult<Option<DataBundle>> {
        Ok(self.bundles.read().get(&id).cloned())
    }

    fn save_bundle(&self, mut bundle: DataBundle) -> StorageResult<DataBundle> {
        let id = match bundle.id {
            Some(id) => id,
            None => self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        bundle.id = Some(id);
        self.bundles.write().insert(id, bundle.clone());
        debug!(bundle_id = id, owner = %bundle.owner_key, "saved bundle");
        Ok(bundle)
    }

    fn update_bundle(&self, id: u64, update: BundleUpdate) -> StorageResult<DataBundle> {
        let mut bundles = self.bundles.write();
        let bundle = bundles
            .get_mut(&id)
            .ok_or(StorageError::BundleNotFound { id })?;
        if let Some(volume_id) = update.storage_volume_id {
            bundle.storage_volume_id = Some(volume_id);
        }
        if let Some(path) = update.path {
            bundle.path = Some(path);
        }
        if let Some(used) = update.used_space_bytes {
            bundle.used_space_bytes = Some(used);
        }
        if let Some(checksum) = update.checksum {
            bundle.checksum = Some(checksum);
        }
        Ok(bundle.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::StorageFormat;

    #[test]
    fn test_matching_volumes_sorted_by_id() {
        let dao = InMemoryVolumeDao::new([
            StorageVolume::new(9, "nine", "/9"),
            StorageVolume::new(2, "two", "/2"),
            StorageVolume::new(5, "five", "/5"),
        ]);
        let query = VolumeQuery {
            include_shared: true,
            ..VolumeQuery::default()
        };
        let ids: Vec<u64> = dao
            .find_matching_volumes(&query)
            .unwrap()
            .iter()
            .map(|v| v.id)
            .collect();
        assert_eq!(ids, vec![2, 5, 9]);
    }

    #[test]
    fn test_update_volume() {
        let dao = InMemoryVolumeDao::new([StorageVolume::new(1, "v", "/v")]);
        let updated = dao
            .update_volume(
                1,
                VolumeUpdate {
                    available_space_bytes: Some(42),
                    active: Some(false),
                    ..VolumeUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(updated.available_space_bytes, Some(42));
        assert!(!updated.active);
        assert!(matches!(
            dao.update_volume(7, VolumeUpdate::default()),
            Err(StorageError::VolumeNotFound { id: 7 })
        ));
    }

    #[test]
    fn test_bundle_ids_and_updates() {
        let dao = InMemoryBundleDao::new();
        let first = dao
            .save_bundle(DataBundle::new("user:a", "one", StorageFormat::SingleDataFile))
            .unwrap();
        let second = dao
            .save_bundle(DataBundle::new("user:a", "two", StorageFormat::SingleDataFile))
            .unwrap();
        assert_eq!(first.id, Some(1));
        assert_eq!(second.id, Some(2));

        let updated = dao
            .update_bundle(
                2,
                BundleUpdate {
                    used_space_bytes: Some(10),
                    checksum: Some("ab".to_string()),
                    ..BundleUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(updated.used_space_bytes, Some(10));
        assert_eq!(
            dao.find_bundle_by_id(2).unwrap().unwrap().checksum.as_deref(),
            Some("ab")
        );
        assert_eq!(dao.len(), 2);
    }
}
