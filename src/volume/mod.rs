//! Volume Object Helpers
//!
//! Pure functions over `PersistentVolume` objects shared by every component:
//!
//! - [`naming`]: deterministic volume names and provisioner identity
//! - [`capacity`]: display rounding and quantity formatting
//! - [`spec`]: construction of new local volume objects
//! - [`affinity`]: node-affinity generation, parsing and the cleanup
//!   eligibility predicates

pub mod affinity;
pub mod capacity;
pub mod naming;
pub mod spec;

pub use affinity::*;
pub use capacity::*;
pub use naming::*;
pub use spec::*;

use crate::domain::{ReclaimPolicy, VolumeMode, VolumePhase};
use k8s_openapi::api::core::v1::PersistentVolume;

/// Annotation recording which provisioner created a volume
pub const ANN_PROVISIONED_BY: &str = "pv.kubernetes.io/provisioned-by";

/// Name of a volume object, empty when unset
pub fn volume_name(pv: &PersistentVolume) -> &str {
    pv.metadata.name.as_deref().unwrap_or_default()
}

/// Host path of a local volume
pub fn local_path(pv: &PersistentVolume) -> Option<&str> {
    pv.spec.as_ref()?.local.as_ref().map(|l| l.path.as_str())
}

/// Current phase, `Unknown` when no status was reported yet
pub fn phase(pv: &PersistentVolume) -> VolumePhase {
    pv.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(VolumePhase::parse)
        .unwrap_or(VolumePhase::Unknown)
}

/// Reclaim policy, `None` for policies this crate does not manage
pub fn reclaim_policy(pv: &PersistentVolume) -> Option<ReclaimPolicy> {
    pv.spec
        .as_ref()?
        .persistent_volume_reclaim_policy
        .as_deref()?
        .parse()
        .ok()
}

/// Raw reclaim policy string, used as a metric label
pub fn reclaim_policy_str(pv: &PersistentVolume) -> &str {
    pv.spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
        .unwrap_or_default()
}

/// Volume mode, defaulting to filesystem like the API server does
pub fn volume_mode(pv: &PersistentVolume) -> VolumeMode {
    pv.spec
        .as_ref()
        .and_then(|s| s.volume_mode.as_deref())
        .and_then(|m| m.parse().ok())
        .unwrap_or(VolumeMode::Filesystem)
}

/// StorageClass name of a volume
pub fn storage_class_name(pv: &PersistentVolume) -> Option<&str> {
    pv.spec.as_ref()?.storage_class_name.as_deref()
}

/// Value of the provisioned-by annotation
pub fn provisioned_by(pv: &PersistentVolume) -> Option<&str> {
    pv.metadata
        .annotations
        .as_ref()?
        .get(ANN_PROVISIONED_BY)
        .map(String::as_str)
}

/// Whether a released volume should be reclaimed by deleting it
pub fn is_released_with_delete(pv: &PersistentVolume) -> bool {
    phase(pv) == VolumePhase::Released && reclaim_policy(pv) == Some(ReclaimPolicy::Delete)
}
