//! Provisioner Configuration
//!
//! The per-node agent reads a YAML document mapping StorageClass names to the
//! host directories it should scan. The node cleanup controller is configured
//! from command-line flags and only needs the smaller [`NodeCleanupConfig`].

use crate::domain::VolumeMode;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Constants
// =============================================================================

/// Label used to pin a volume to its node
pub const DEFAULT_NODE_LABEL_KEY: &str = "kubernetes.io/hostname";

/// Taint applied to nodes until the provisioner has published their volumes
pub const DEFAULT_NOT_READY_TAINT_KEY: &str = "node.kubernetes.io/local-volume-provisioner-not-ready";

// =============================================================================
// Mount Configuration
// =============================================================================

/// Discovery settings for a single StorageClass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountConfig {
    /// Directory on the host containing the volumes, written into the PV
    pub host_dir: String,
    /// Same directory as seen from inside the provisioner container
    #[serde(default)]
    pub mount_dir: String,
    /// Glob selecting which entries are published
    #[serde(default = "default_name_pattern")]
    pub name_pattern: String,
    /// Volume mode of the published PVs
    #[serde(default)]
    pub volume_mode: VolumeMode,
    /// Filesystem type recorded on filesystem-mode block PVs
    #[serde(default)]
    pub fs_type: Option<String>,
}

impl MountConfig {
    pub fn new(host_dir: impl Into<String>, mount_dir: impl Into<String>) -> Self {
        Self {
            host_dir: host_dir.into(),
            mount_dir: mount_dir.into(),
            name_pattern: default_name_pattern(),
            volume_mode: VolumeMode::Filesystem,
            fs_type: None,
        }
    }

    pub fn with_volume_mode(mut self, mode: VolumeMode) -> Self {
        self.volume_mode = mode;
        self
    }

}

fn default_name_pattern() -> String {
    "*".to_string()
}

// =============================================================================
// Provisioner Configuration
// =============================================================================

/// Configuration of the per-node discovery agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionerConfig {
    /// StorageClass name to discovery settings
    #[serde(default)]
    pub storage_class_map: BTreeMap<String, MountConfig>,
    /// Node label keys copied onto every created PV
    #[serde(default, rename = "nodeLabelsForPV")]
    pub node_labels_for_pv: Vec<String>,
    /// Static labels added to every created PV
    #[serde(default, rename = "labelsForPV")]
    pub labels_for_pv: BTreeMap<String, String>,
    /// Clean block devices with Jobs instead of in-process commands
    #[serde(default)]
    pub use_job_for_cleaning: bool,
    /// Identify this agent by node name only, without the node UID
    #[serde(default)]
    pub use_node_name_only: bool,
    /// Make the Node the owner of every PV it hosts
    #[serde(default, rename = "setPVOwnerRef")]
    pub set_pv_owner_ref: bool,
    /// Minimum period between full watch resyncs
    #[serde(default = "default_min_resync_period_secs")]
    pub min_resync_period_secs: u64,
    /// Label identifying the node in PV node affinity
    #[serde(default = "default_node_label_key")]
    pub node_label_key: String,
    /// Remove the not-ready taint once volumes are published
    #[serde(default)]
    pub remove_node_not_ready_taint: bool,
    /// Key of the not-ready taint
    #[serde(default = "default_not_ready_taint_key")]
    pub provisioner_not_ready_node_taint_key: String,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            storage_class_map: BTreeMap::new(),
            node_labels_for_pv: Vec::new(),
            labels_for_pv: BTreeMap::new(),
            use_job_for_cleaning: false,
            use_node_name_only: false,
            set_pv_owner_ref: false,
            min_resync_period_secs: default_min_resync_period_secs(),
            node_label_key: default_node_label_key(),
            remove_node_not_ready_taint: false,
            provisioner_not_ready_node_taint_key: default_not_ready_taint_key(),
        }
    }
}

fn default_min_resync_period_secs() -> u64 {
    300
}

fn default_node_label_key() -> String {
    DEFAULT_NODE_LABEL_KEY.to_string()
}

fn default_not_ready_taint_key() -> String {
    DEFAULT_NOT_READY_TAINT_KEY.to_string()
}

impl ProvisionerConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut config: ProvisionerConfig = serde_yaml::from_str(raw)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Load and validate the configuration file at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    /// Fill derived defaults
    pub fn normalize(&mut self) {
        for mount in self.storage_class_map.values_mut() {
            if mount.mount_dir.is_empty() {
                mount.mount_dir = mount.host_dir.clone();
            }
            if mount.name_pattern.is_empty() {
                mount.name_pattern = default_name_pattern();
            }
        }
    }

    /// Reject configurations discovery cannot act on
    pub fn validate(&self) -> Result<()> {
        for (class, mount) in &self.storage_class_map {
            if mount.host_dir.is_empty() {
                return Err(Error::Configuration(format!(
                    "storage class {:?} is missing hostDir",
                    class
                )));
            }
            glob::Pattern::new(&mount.name_pattern).map_err(|e| {
                Error::Configuration(format!(
                    "storage class {:?} has invalid namePattern {:?}: {}",
                    class, mount.name_pattern, e
                ))
            })?;
        }
        if self.node_label_key.is_empty() {
            return Err(Error::Configuration("nodeLabelKey must not be empty".into()));
        }
        Ok(())
    }

    pub fn min_resync_period(&self) -> Duration {
        Duration::from_secs(self.min_resync_period_secs)
    }
}

// =============================================================================
// Node Cleanup Configuration
// =============================================================================

/// Configuration of the cluster-wide cleanup controller
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCleanupConfig {
    /// StorageClasses whose volumes may be cleaned up
    pub storage_class_names: Vec<String>,
    /// Label identifying the node in PV node affinity
    pub node_label_key: String,
    /// Wait between a node deletion and deleting its claims
    pub pvc_deletion_delay: Duration,
    /// Period of the stale volume scan
    pub stale_pv_discovery_interval: Duration,
    /// Number of cleanup workers
    pub worker_threads: usize,
    /// Namespaces scanned for pods stuck on a missing claim
    pub pending_pod_namespaces: Vec<String>,
    /// StorageClass name to glob matching the claim names it generates
    pub claim_name_patterns: BTreeMap<String, String>,
}

impl Default for NodeCleanupConfig {
    fn default() -> Self {
        Self {
            storage_class_names: Vec::new(),
            node_label_key: DEFAULT_NODE_LABEL_KEY.to_string(),
            pvc_deletion_delay: Duration::from_secs(60),
            stale_pv_discovery_interval: Duration::from_secs(10),
            worker_threads: 10,
            pending_pod_namespaces: Vec::new(),
            claim_name_patterns: BTreeMap::new(),
        }
    }
}

impl NodeCleanupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.storage_class_names.is_empty() {
            return Err(Error::Configuration(
                "at least one storage class name is required".into(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(Error::Configuration("worker threads must be positive".into()));
        }
        for (class, pattern) in &self.claim_name_patterns {
            glob::Pattern::new(pattern).map_err(|e| {
                Error::Configuration(format!(
                    "invalid claim name pattern {:?} for {}: {}",
                    pattern, class, e
                ))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    const SAMPLE: &str = r#"
storageClassMap:
  local-fs:
    hostDir: /mnt/disks
    mountDir: /mnt/disks
  local-block:
    hostDir: /dev/disk/by-id
    volumeMode: Block
    namePattern: "nvme*"
nodeLabelsForPV:
  - topology.kubernetes.io/zone
labelsForPV:
  team: storage
setPVOwnerRef: true
"#;

    #[test]
    fn test_parse_sample() {
        let config = ProvisionerConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.storage_class_map.len(), 2);

        let fs = &config.storage_class_map["local-fs"];
        assert_eq!(fs.volume_mode, VolumeMode::Filesystem);
        assert_eq!(fs.name_pattern, "*");

        let block = &config.storage_class_map["local-block"];
        assert_eq!(block.volume_mode, VolumeMode::Block);
        assert_eq!(block.mount_dir, "/dev/disk/by-id");
        assert_eq!(block.name_pattern, "nvme*");

        assert_eq!(config.node_labels_for_pv, vec!["topology.kubernetes.io/zone"]);
        assert_eq!(config.labels_for_pv["team"], "storage");
        assert!(config.set_pv_owner_ref);
        assert!(!config.use_node_name_only);
        assert_eq!(config.node_label_key, DEFAULT_NODE_LABEL_KEY);
        assert_eq!(config.min_resync_period(), Duration::from_secs(300));
    }

    #[test]
    fn test_invalid_volume_mode_rejected() {
        let raw = "storageClassMap:\n  sc:\n    hostDir: /mnt\n    volumeMode: Raw\n";
        assert!(ProvisionerConfig::from_yaml(raw).is_err());
    }

    #[test]
    fn test_missing_host_dir_rejected() {
        let raw = "storageClassMap:\n  sc:\n    hostDir: \"\"\n";
        assert_matches!(
            ProvisionerConfig::from_yaml(raw),
            Err(Error::Configuration(_))
        );
    }

    #[test]
    fn test_invalid_name_pattern_rejected() {
        let raw = "storageClassMap:\n  sc:\n    hostDir: /mnt\n    namePattern: \"[\"\n";
        assert_matches!(
            ProvisionerConfig::from_yaml(raw),
            Err(Error::Configuration(_))
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = ProvisionerConfig::load(file.path()).unwrap();
        assert_eq!(config.storage_class_map.len(), 2);

        assert_matches!(
            ProvisionerConfig::load("/nonexistent/provisioner.yaml"),
            Err(Error::Configuration(_))
        );
    }

    #[test]
    fn test_node_cleanup_defaults() {
        let config = NodeCleanupConfig::default();
        assert_eq!(config.worker_threads, 10);
        assert_eq!(config.pvc_deletion_delay, Duration::from_secs(60));
        assert_eq!(config.stale_pv_discovery_interval, Duration::from_secs(10));
        // No storage classes configured
        assert!(config.validate().is_err());

        let config = NodeCleanupConfig {
            storage_class_names: vec!["local".into()],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
