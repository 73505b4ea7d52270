//! Local volume object construction

use super::{binary_quantity, ANN_PROVISIONED_BY};
use crate::domain::{ReclaimPolicy, VolumeMode};
use k8s_openapi::api::core::v1::{
    LocalVolumeSource, PersistentVolume, PersistentVolumeSpec, VolumeNodeAffinity,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::collections::BTreeMap;

/// Everything needed to build a new local volume object
#[derive(Debug, Clone)]
pub struct LocalPvConfig {
    pub name: String,
    pub host_path: String,
    pub capacity_bytes: u64,
    pub storage_class: String,
    pub reclaim_policy: ReclaimPolicy,
    pub provisioner_name: String,
    pub volume_mode: VolumeMode,
    pub mount_options: Vec<String>,
    pub fs_type: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub node_affinity: Option<VolumeNodeAffinity>,
    /// Set only when volumes should be owned by their Node
    pub owner_reference: Option<OwnerReference>,
}

/// Build the volume object for a discovered device
pub fn create_local_pv_spec(config: &LocalPvConfig) -> PersistentVolume {
    let annotations = BTreeMap::from([(
        ANN_PROVISIONED_BY.to_string(),
        config.provisioner_name.clone(),
    )]);

    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(config.name.clone()),
            labels: (!config.labels.is_empty()).then(|| config.labels.clone()),
            annotations: Some(annotations),
            owner_references: config.owner_reference.clone().map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            capacity: Some(BTreeMap::from([(
                "storage".to_string(),
                binary_quantity(config.capacity_bytes),
            )])),
            local: Some(LocalVolumeSource {
                path: config.host_path.clone(),
                fs_type: config.fs_type.clone().filter(|t| !t.is_empty()),
            }),
            mount_options: (!config.mount_options.is_empty())
                .then(|| config.mount_options.clone()),
            node_affinity: config.node_affinity.clone(),
            persistent_volume_reclaim_policy: Some(config.reclaim_policy.to_string()),
            storage_class_name: Some(config.storage_class.clone()),
            volume_mode: Some(config.volume_mode.to_string()),
            ..Default::default()
        }),
        status: None,
    }
}
