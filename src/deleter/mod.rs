//! Stale Volume Deleters
//!
//! Polling reconcilers that retire local volumes whose node is gone:
//!
//! - [`StaleVolumeDeleter`]: deletes Available (or Released with a Delete
//!   policy) volumes pinned to a deleted node
//! - [`PendingPodReaper`]: deletes Pending pods stuck on a claim that was
//!   cleaned up, so their controller recreates the claim
//!
//! Both look up the volume's node through [`deleted_node_of`].

pub mod pending;
pub mod stale;

pub use pending::*;
pub use stale::*;

use crate::domain::ClusterApi;
use crate::error::Result;
use crate::volume::node_attached_to_local_pv;
use k8s_openapi::api::core::v1::PersistentVolume;

/// The node a local volume is pinned to, if that node no longer exists.
///
/// Fails with [`crate::Error::MalformedAffinity`] unless the affinity names
/// exactly one node.
pub async fn deleted_node_of(
    api: &dyn ClusterApi,
    pv: &PersistentVolume,
    node_label_key: &str,
) -> Result<Option<String>> {
    let node_name = node_attached_to_local_pv(pv, node_label_key)?;
    if api.node_exists(node_label_key, &node_name).await? {
        Ok(None)
    } else {
        Ok(Some(node_name))
    }
}
