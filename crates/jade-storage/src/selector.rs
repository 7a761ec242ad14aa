//! Storage volume selection for new bundles.
//!
//! A selector is a pure function of the stored volumes, the identity of the
//! agent asking, and the placement pinned on the bundle. Selection never fails
//! for lack of a match; that case is `Ok(None)` and the caller decides whether
//! to fall back or to refuse the allocation.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::dao::StorageVolumeDao;
use crate::error::StorageResult;
use crate::volume::{DataBundle, StorageVolume, VolumeQuery, OVERFLOW_VOLUME};

/// Decides whether an agent can reach a shared volume.
pub type ServePredicate = Arc<dyn Fn(&StorageVolume) -> bool + Send + Sync>;

/// Picks a volume for a bundle.
pub trait StorageVolumeSelector: Send + Sync {
    /// Returns the volume to store `bundle` on, or `None` when nothing fits.
    fn select_storage_volume(&self, bundle: &DataBundle) -> StorageResult<Option<StorageVolume>>;
}

/// Selects among the volumes one agent can serve.
///
/// Candidates are the active volumes exclusive to the agent plus the shared
/// volumes the serve predicate admits, minus the volumes the agent reported
/// unavailable. The first candidate in store order wins.
pub struct LocalStorageVolumeSelector {
    dao: Arc<dyn StorageVolumeDao>,
    agent_id: String,
    unavailable_ids: BTreeSet<u64>,
    can_serve_shared: ServePredicate,
}

impl LocalStorageVolumeSelector {
    /// Selector for `agent_id` serving the shared volumes named in `served_volumes`.
    pub fn new(
        dao: Arc<dyn StorageVolumeDao>,
        agent_id: impl Into<String>,
        served_volumes: BTreeSet<String>,
    ) -> Self {
        Self {
            dao,
            agent_id: agent_id.into(),
            unavailable_ids: BTreeSet::new(),
            can_serve_shared: Arc::new(move |v: &StorageVolume| served_volumes.contains(&v.name)),
        }
    }

    /// Replaces the shared-volume predicate.
    pub fn with_serve_predicate(mut self, predicate: ServePredicate) -> Self {
        self.can_serve_shared = predicate;
        self
    }

    /// Volumes to skip regardless of ownership.
    pub fn with_unavailable(mut self, ids: BTreeSet<u64>) -> Self {
        self.unavailable_ids = ids;
        self
    }
}

impl StorageVolumeSelector for LocalStorageVolumeSelector {
    fn select_storage_volume(&self, bundle: &DataBundle) -> StorageResult<Option<StorageVolume>> {
        let mut query = VolumeQuery::from_request(&bundle.requested);
        query.storage_agent_ids.insert(self.agent_id.clone());
        query.include_shared = true;
        query.excluded_ids = self.unavailable_ids.clone();

        let selected = self
            .dao
            .find_matching_volumes(&query)?
            .into_iter()
            .find(|v| !v.shared || (self.can_serve_shared)(v));
        debug!(
            agent_id = %self.agent_id,
            bundle = %bundle.name,
            volume = ?selected.as_ref().map(|v| &v.name),
            "local volume selection"
        );
        Ok(selected)
    }
}

/// Selects among shared volumes only.
pub struct SharedStorageVolumeSelector {
    dao: Arc<dyn StorageVolumeDao>,
}

impl SharedStorageVolumeSelector {
    /// Creates a shared-volume selector.
    pub fn new(dao: Arc<dyn StorageVolumeDao>) -> Self {
        Self { dao }
    }
}

impl StorageVolumeSelector for SharedStorageVolumeSelector {
    fn select_storage_volume(&self, bundle: &DataBundle) -> StorageResult<Option<StorageVolume>> {
        let mut query = VolumeQuery::from_request(&bundle.requested);
        query.shared_only = true;
        let selected = self.dao.find_matching_volumes(&query)?.into_iter().next();
        debug!(
            bundle = %bundle.name,
            volume = ?selected.as_ref().map(|v| &v.name),
            "shared volume selection"
        );
        Ok(selected)
    }
}

/// Falls back to the shared overflow volume for bundles that pin nothing.
pub struct OverflowStorageVolumeSelector {
    dao: Arc<dyn StorageVolumeDao>,
}

impl OverflowStorageVolumeSelector {
    /// Creates an overflow selector.
    pub fn new(dao: Arc<dyn StorageVolumeDao>) -> Self {
        Self { dao }
    }
}

impl StorageVolumeSelector for OverflowStorageVolumeSelector {
    fn select_storage_volume(&self, bundle: &DataBundle) -> StorageResult<Option<StorageVolume>> {
        if bundle.requested.is_pinned() {
            return Ok(None);
        }
        let query = VolumeQuery {
            name: Some(OVERFLOW_VOLUME.to_string()),
            shared_only: true,
            active_only: true,
            min_available_space_bytes: bundle.requested.min_available_space_bytes,
            ..VolumeQuery::default()
        };
        Ok(self.dao.find_matching_volumes(&query)?.into_iter().next())
    }
}

/// Tries selectors in order and returns the first match.
#[derive(Default)]
pub struct ChainedVolumeSelector {
    selectors: Vec<Arc<dyn StorageVolumeSelector>>,
}

impl ChainedVolumeSelector {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a selector to the chain.
    pub fn then(mut self, selector: Arc<dyn StorageVolumeSelector>) -> Self {
        self.selectors.push(selector);
        self
    }
}

impl StorageVolumeSelector for ChainedVolumeSelector {
    fn select_storage_volume(&self, bundle: &DataBundle) -> StorageResult<Option<StorageVolume>> {
        for selector in &self.selectors {
            if let Some(volume) = selector.select_storage_volume(bundle)? {
                return Ok(Some(volume));
            }
        }
        Ok(None)
    }
}
