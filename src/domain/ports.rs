//! Domain Ports - Core trait definitions for the provisioner
//!
//! These traits define the boundaries between the reconciliation logic and
//! the outside world: the Kubernetes API, host filesystem probing, the mount
//! table and the device-cleaning subsystem. Adapters implement them; tests
//! substitute in-memory fakes.

use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Node, ObjectReference, PersistentVolume, PersistentVolumeClaim, Pod, Taint,
};
use k8s_openapi::api::storage::v1::StorageClass;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

// =============================================================================
// Volume Types
// =============================================================================

/// How a discovered device is exposed to consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum VolumeMode {
    #[default]
    Filesystem,
    Block,
}

impl VolumeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeMode::Filesystem => "Filesystem",
            VolumeMode::Block => "Block",
        }
    }
}

impl std::fmt::Display for VolumeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for VolumeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Filesystem" => Ok(VolumeMode::Filesystem),
            "Block" => Ok(VolumeMode::Block),
            other => Err(Error::Configuration(format!(
                "unsupported volume mode {:?}, expected Filesystem or Block",
                other
            ))),
        }
    }
}

/// Reclaim policies the provisioner is able to honour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReclaimPolicy {
    Retain,
    Delete,
}

impl ReclaimPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReclaimPolicy::Retain => "Retain",
            ReclaimPolicy::Delete => "Delete",
        }
    }
}

impl std::fmt::Display for ReclaimPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ReclaimPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Retain" => Ok(ReclaimPolicy::Retain),
            "Delete" => Ok(ReclaimPolicy::Delete),
            other => Err(Error::Configuration(format!(
                "unsupported reclaim policy {:?}",
                other
            ))),
        }
    }
}

/// Lifecycle phase reported in a volume's status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumePhase {
    Pending,
    Available,
    Bound,
    Released,
    Failed,
    Unknown,
}

impl VolumePhase {
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => VolumePhase::Pending,
            "Available" => VolumePhase::Available,
            "Bound" => VolumePhase::Bound,
            "Released" => VolumePhase::Released,
            "Failed" => VolumePhase::Failed,
            _ => VolumePhase::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VolumePhase::Pending => "Pending",
            VolumePhase::Available => "Available",
            VolumePhase::Bound => "Bound",
            VolumePhase::Released => "Released",
            VolumePhase::Failed => "Failed",
            VolumePhase::Unknown => "",
        }
    }
}

impl std::fmt::Display for VolumePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kubernetes event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

// =============================================================================
// Mount Table
// =============================================================================

/// Point-in-time snapshot of the host mount table
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    mount_points: HashSet<String>,
}

impl MountTable {
    pub fn new<I, S>(mount_points: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mount_points: mount_points.into_iter().map(Into::into).collect(),
        }
    }

    /// Check whether `path` was a mount point when the snapshot was taken
    pub fn is_mount_point(&self, path: &str) -> bool {
        self.mount_points.contains(path)
    }

    pub fn len(&self) -> usize {
        self.mount_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mount_points.is_empty()
    }
}

// =============================================================================
// Cluster API Port
// =============================================================================

/// Port for the Kubernetes API operations the provisioner consumes.
///
/// Single-object getters return `Ok(None)` when the object does not exist.
/// Deletes surface a missing object as [`Error::ResourceNotFound`] so callers
/// can decide whether that counts as success.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List all PersistentVolumes
    async fn list_volumes(&self) -> Result<Vec<PersistentVolume>>;

    /// Get a PersistentVolume by name
    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;

    /// Create a PersistentVolume
    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume>;

    /// Delete a PersistentVolume
    async fn delete_volume(&self, name: &str) -> Result<()>;

    /// Get a PersistentVolumeClaim
    async fn get_claim(&self, namespace: &str, name: &str)
        -> Result<Option<PersistentVolumeClaim>>;

    /// Delete a PersistentVolumeClaim, optionally only if its UID still matches
    async fn delete_claim(&self, namespace: &str, name: &str, uid: Option<&str>) -> Result<()>;

    /// Get a Node by name
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Check whether any Node carries `label_key=value`
    async fn node_exists(&self, label_key: &str, value: &str) -> Result<bool>;

    /// Replace the taints of a Node
    async fn set_node_taints(&self, name: &str, taints: Vec<Taint>) -> Result<()>;

    /// Get a StorageClass by name
    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>>;

    /// List Pods in a namespace
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;

    /// Delete a Pod
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Record an event against an object
    async fn record_event(
        &self,
        target: &ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()>;
}

// =============================================================================
// Host Probing Ports
// =============================================================================

/// Port for filesystem and block-device probing on the host
pub trait VolumeUtil: Send + Sync {
    /// List entry names in a directory
    fn read_dir(&self, path: &Path) -> Result<Vec<String>>;

    /// Classify a path as a block device or a filesystem directory
    fn volume_mode(&self, path: &Path) -> Result<VolumeMode>;

    /// Total capacity in bytes of the filesystem mounted at `path`
    fn fs_capacity(&self, path: &Path) -> Result<u64>;

    /// Size in bytes of the block device at `path`
    fn block_capacity(&self, path: &Path) -> Result<u64>;
}

/// Port for reading the host mount table
pub trait Mounter: Send + Sync {
    /// Snapshot the current mount table
    fn mount_table(&self) -> Result<MountTable>;
}

// =============================================================================
// Cleanup Status Port
// =============================================================================

/// Port for the device-cleaning subsystem
pub trait CleanupTracker: Send + Sync {
    /// Whether cleanup for a previous volume with this name is still running
    fn in_progress(&self, volume_name: &str, use_job: bool) -> bool;

    /// Forget any finished cleanup record for this name.
    /// Returns true when a record was removed.
    fn remove_status(&self, volume_name: &str, use_job: bool) -> Result<bool>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ClusterApiRef = Arc<dyn ClusterApi>;
pub type VolumeUtilRef = Arc<dyn VolumeUtil>;
pub type MounterRef = Arc<dyn Mounter>;
pub type CleanupTrackerRef = Arc<dyn CleanupTracker>;
