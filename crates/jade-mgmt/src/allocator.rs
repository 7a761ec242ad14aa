//! Placement of new bundles across registered agents.

use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use jade_storage::{
    to_hex, BundleDao, BundleUpdate, ChainedVolumeSelector, DataBundle, LocalStorageVolumeSelector,
    OverflowStorageVolumeSelector, SharedStorageVolumeSelector, StorageVolume, StorageVolumeDao,
    StorageVolumeSelector,
};
use jade_transport::{StorageMessageHeader, TransferObserver, TransferSummary};

use crate::error::Result;
use crate::info::StorageAgentInfo;
use crate::registry::StorageAgentRegistry;

/// Chooses a volume and an agent for new bundles and records them.
pub struct DistributedStorageAllocator {
    registry: Arc<StorageAgentRegistry>,
    volume_dao: Arc<dyn StorageVolumeDao>,
    bundle_dao: Arc<dyn BundleDao>,
    overflow: bool,
}

impl DistributedStorageAllocator {
    /// Creates an allocator without overflow fallback.
    pub fn new(
        registry: Arc<StorageAgentRegistry>,
        volume_dao: Arc<dyn StorageVolumeDao>,
        bundle_dao: Arc<dyn BundleDao>,
    ) -> Self {
        Self {
            registry,
            volume_dao,
            bundle_dao,
            overflow: false,
        }
    }

    /// Falls back to the overflow volume when no shared volume fits.
    pub fn with_overflow(mut self, overflow: bool) -> Self {
        self.overflow = overflow;
        self
    }

    fn local_selector(&self, agent: &StorageAgentInfo) -> LocalStorageVolumeSelector {
        let served = agent.clone();
        LocalStorageVolumeSelector::new(
            Arc::clone(&self.volume_dao),
            agent.agent_id.clone(),
            agent.served_volumes.clone(),
        )
        .with_serve_predicate(Arc::new(move |v: &StorageVolume| served.serves_volume_name(&v.name)))
        .with_unavailable(agent.unavailable_volume_ids.clone())
    }

    /// Picks a volume for `bundle` and the agent that will write it.
    ///
    /// Volumes local to a connected agent win; then shared volumes (and the
    /// overflow volume, when enabled) served by a random connected agent.
    pub fn select_storage(&self, bundle: &DataBundle) -> Result<Option<(StorageVolume, StorageAgentInfo)>> {
        let mut agents = self.registry.registered_agents(|a| a.is_connected());
        agents.shuffle(&mut rand::thread_rng());
        for agent in agents {
            if let Some(volume) = self.local_selector(&agent).select_storage_volume(bundle)? {
                debug!(agent_id = %agent.agent_id, volume = %volume.name, "selected agent volume");
                return Ok(Some((volume, agent)));
            }
        }

        let mut shared = ChainedVolumeSelector::new()
            .then(Arc::new(SharedStorageVolumeSelector::new(Arc::clone(&self.volume_dao))));
        if self.overflow {
            shared = shared.then(Arc::new(OverflowStorageVolumeSelector::new(Arc::clone(&self.volume_dao))));
        }
        let Some(volume) = shared.select_storage_volume(bundle)? else {
            debug!(bundle = %bundle.name, "no volume matches");
            return Ok(None);
        };
        let agent = self
            .registry
            .find_random_registered_agent(|a| a.is_connected() && a.can_serve(&volume));
        match agent {
            Some(agent) => {
                debug!(agent_id = %agent.agent_id, volume = %volume.name, "selected shared volume");
                Ok(Some((volume, agent)))
            }
            None => {
                debug!(volume = %volume.name, "no connected agent serves volume");
                Ok(None)
            }
        }
    }

    /// Allocates storage for `bundle` on behalf of `owner_key`.
    ///
    /// The saved bundle lives at `<volume root>/<bundle id>`, the root
    /// resolved for the owner's name. `None` when nothing fits.
    pub fn allocate_storage(&self, owner_key: &str, mut bundle: DataBundle) -> Result<Option<DataBundle>> {
        if !owner_key.is_empty() {
            bundle.owner_key = owner_key.to_string();
        }
        let Some((volume, agent)) = self.select_storage(&bundle)? else {
            return Ok(None);
        };
        bundle.storage_volume_id = Some(volume.id);
        let saved = self.bundle_dao.save_bundle(bundle)?;
        let Some(id) = saved.id else {
            return Ok(Some(saved));
        };
        let path = volume.resolve_root(saved.owner_name()).join(id.to_string());
        let updated = self.bundle_dao.update_bundle(
            id,
            BundleUpdate {
                path: Some(path),
                ..BundleUpdate::default()
            },
        )?;
        info!(
            bundle_id = id,
            volume = %volume.name,
            agent_id = %agent.agent_id,
            "storage allocated"
        );
        Ok(Some(updated))
    }

    /// Records the size and checksum of a stored bundle.
    pub fn update_storage(&self, bundle_id: u64, used_bytes: u64, checksum: Option<String>) -> Result<DataBundle> {
        let updated = self.bundle_dao.update_bundle(
            bundle_id,
            BundleUpdate {
                used_space_bytes: Some(used_bytes),
                checksum,
                ..BundleUpdate::default()
            },
        )?;
        debug!(bundle_id, used_bytes, "bundle accounting updated");
        Ok(updated)
    }
}

impl std::fmt::Debug for DistributedStorageAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedStorageAllocator")
            .field("overflow", &self.overflow)
            .finish_non_exhaustive()
    }
}

/// Writes the outcome of every persisted transfer back to its bundle.
#[derive(Debug)]
pub struct BundleAccounting {
    allocator: Arc<DistributedStorageAllocator>,
}

impl BundleAccounting {
    /// Accounting that writes through `allocator`.
    pub fn new(allocator: Arc<DistributedStorageAllocator>) -> Self {
        Self { allocator }
    }
}

impl TransferObserver for BundleAccounting {
    fn on_persisted(&self, header: &StorageMessageHeader, summary: &TransferSummary) {
        let Some(bundle_id) = header.data_bundle_id else {
            return;
        };
        let checksum = (!summary.checksum.is_empty()).then(|| to_hex(&summary.checksum));
        if let Err(e) = self
            .allocator
            .update_storage(bundle_id, summary.persisted_bytes, checksum)
        {
            warn!(bundle_id, error = %e, "failed to record persisted bundle");
        }
    }
}
