//! Storage volume and data bundle records.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::format::StorageFormat;

/// Name of the shared volume that takes bundles no other volume accepts.
pub const OVERFLOW_VOLUME: &str = "OVERFLOW_VOLUME";

/// Placeholder in a volume root template replaced by the bundle owner.
pub const OWNER_PLACEHOLDER: &str = "${username}";

/// A storage location that can host bundles.
///
/// Exclusive volumes carry the id of the agent that owns them; shared volumes
/// have no owner and may be served by any agent that can reach them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageVolume {
    /// Volume id.
    pub id: u64,
    /// Volume name, unique among active volumes.
    pub name: String,
    /// Owning agent for exclusive volumes.
    pub storage_agent_id: Option<String>,
    /// Root directory, possibly containing [`OWNER_PLACEHOLDER`].
    pub root_path_template: String,
    /// Path under which clients see the volume.
    pub virtual_path: String,
    /// Free-form tags used for placement.
    pub tags: BTreeSet<String>,
    /// Free space, when known.
    pub available_space_bytes: Option<u64>,
    /// Fill level in percent, when known.
    pub percentage_full: Option<u32>,
    /// Base URL of the serving agent, when known.
    pub access_url: Option<String>,
    /// Inactive volumes are never selected.
    pub active: bool,
    /// Whether the volume is reachable from several agents.
    pub shared: bool,
}

impl StorageVolume {
    /// Creates an active volume with only the identifying fields set.
    pub fn new(id: u64, name: impl Into<String>, root_path_template: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id,
            virtual_path: format!("/{}", name),
            name,
            storage_agent_id: None,
            root_path_template: root_path_template.into(),
            tags: BTreeSet::new(),
            available_space_bytes: None,
            percentage_full: None,
            access_url: None,
            active: true,
            shared: true,
        }
    }

    /// Marks the volume exclusive to `agent_id`.
    pub fn owned_by(mut self, agent_id: impl Into<String>) -> Self {
        self.storage_agent_id = Some(agent_id.into());
        self.shared = false;
        self
    }

    /// Sets the tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the free space.
    pub fn with_available_space(mut self, bytes: u64) -> Self {
        self.available_space_bytes = Some(bytes);
        self
    }

    /// Root directory for bundles of `owner`.
    pub fn resolve_root(&self, owner: &str) -> PathBuf {
        PathBuf::from(self.root_path_template.replace(OWNER_PLACEHOLDER, owner))
    }
}

/// Placement preferences pinned by the requester of a new bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequest {
    /// Exact volume id.
    pub volume_id: Option<u64>,
    /// Exact volume name.
    pub volume_name: Option<String>,
    /// Exact virtual path.
    pub virtual_path: Option<String>,
    /// Tags the volume must all carry.
    pub tags: BTreeSet<String>,
    /// Minimum free space.
    pub min_available_space_bytes: Option<u64>,
}

impl VolumeRequest {
    /// True when the request pins any volume attribute.
    pub fn is_pinned(&self) -> bool {
        self.volume_id.is_some()
            || self.volume_name.is_some()
            || self.virtual_path.is_some()
            || !self.tags.is_empty()
    }
}

/// A logical unit of stored data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBundle {
    /// Bundle id, assigned when first saved.
    pub id: Option<u64>,
    /// Owner key, for example `user:jdoe`.
    pub owner_key: String,
    /// Bundle name.
    pub name: String,
    /// Storage format of the stored data.
    pub format: StorageFormat,
    /// Volume chosen for the bundle.
    pub storage_volume_id: Option<u64>,
    /// Location of the bundle data on its volume.
    pub path: Option<PathBuf>,
    /// Bytes used on the volume.
    pub used_space_bytes: Option<u64>,
    /// Checksum of the last persisted stream, hex encoded.
    pub checksum: Option<String>,
    /// Placement preferences.
    pub requested: VolumeRequest,
}

impl DataBundle {
    /// Creates an unsaved bundle.
    pub fn new(owner_key: impl Into<String>, name: impl Into<String>, format: StorageFormat) -> Self {
        Self {
            id: None,
            owner_key: owner_key.into(),
            name: name.into(),
            format,
            storage_volume_id: None,
            path: None,
            used_space_bytes: None,
            checksum: None,
            requested: VolumeRequest::default(),
        }
    }

    /// Owner name without the `kind:` prefix of the owner key.
    pub fn owner_name(&self) -> &str {
        self.owner_key
            .split_once(':')
            .map(|(_, name)| name)
            .unwrap_or(&self.owner_key)
    }
}

/// Filter over stored volumes.
///
/// Every set field must match; unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeQuery {
    /// Exact id.
    pub id: Option<u64>,
    /// Exact name.
    pub name: Option<String>,
    /// Exact virtual path.
    pub virtual_path: Option<String>,
    /// Tags the volume must all carry.
    pub tags: BTreeSet<String>,
    /// Exclusive volumes are admitted only when owned by one of these agents.
    pub storage_agent_ids: BTreeSet<String>,
    /// Admit shared volumes.
    pub include_shared: bool,
    /// Admit only shared volumes.
    pub shared_only: bool,
    /// Minimum free space. A non-zero floor also rejects volumes whose free
    /// space is unknown.
    pub min_available_space_bytes: Option<u64>,
    /// Skip inactive volumes.
    pub active_only: bool,
    /// Volume ids to skip.
    pub excluded_ids: BTreeSet<u64>,
}

impl VolumeQuery {
    /// Query for active volumes matching what `request` pins.
    pub fn from_request(request: &VolumeRequest) -> Self {
        Self {
            id: request.volume_id,
            name: request.volume_name.clone(),
            virtual_path: request.virtual_path.clone(),
            tags: request.tags.clone(),
            min_available_space_bytes: request.min_available_space_bytes,
            active_only: true,
            ..Self::default()
        }
    }

    /// Whether `volume` passes the filter.
    pub fn matches(&self, volume: &StorageVolume) -> bool {
        if self.active_only && !volume.active {
            return false;
        }
        if self.excluded_ids.contains(&volume.id) {
            return false;
        }
        if self.id.is_some_and(|id| id != volume.id) {
            return false;
        }
        if self.name.as_deref().is_some_and(|n| n != volume.name) {
            return false;
        }
        if self.virtual_path.as_deref().is_some_and(|p| p != volume.virtual_path) {
            return false;
        }
        if !self.tags.is_subset(&volume.tags) {
            return false;
        }
        if let Some(min) = self.min_available_space_bytes.filter(|min| *min > 0) {
            if volume.available_space_bytes.map_or(true, |available| available < min) {
                return false;
            }
        }
        if volume.shared {
            self.include_shared || self.shared_only
        } else if self.shared_only {
            false
        } else {
            match &volume.storage_agent_id {
                Some(owner) => self.storage_agent_ids.contains(owner),
                None => false,
            }
        }
    }
}

/// Fields a volume update may change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeUpdate {
    /// New free space.
    pub available_space_bytes: Option<u64>,
    /// New fill level.
    pub percentage_full: Option<u32>,
    /// New access URL.
    pub access_url: Option<String>,
    /// New activity flag.
    pub active: Option<bool>,
}

/// Fields a bundle update may change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleUpdate {
    /// New volume.
    pub storage_volume_id: Option<u64>,
    /// New location.
    pub path: Option<PathBuf>,
    /// New used space.
    pub used_space_bytes: Option<u64>,
    /// New checksum.
    pub checksum: Option<String>,
}
