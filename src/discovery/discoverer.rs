//! Discoverer - turns host directory entries into PersistentVolumes

use super::Readiness;
use crate::cache::VolumeCache;
use crate::config::{MountConfig, ProvisionerConfig};
use crate::domain::{
    CleanupTrackerRef, ClusterApiRef, EventType, MountTable, MounterRef, ReclaimPolicy,
    VolumeMode, VolumeUtilRef,
};
use crate::error::{ignore_not_found, Error, Result};
use crate::metrics::Metrics;
use crate::volume::{
    self, create_local_pv_spec, generate_pv_name, node_affinity_for, provisioner_name,
    round_down_capacity_pretty, LocalPvConfig,
};
use k8s_openapi::api::core::v1::{Node, ObjectReference, PersistentVolume, VolumeNodeAffinity};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Event reason for a cached block volume whose path turned into a filesystem
pub const EVENT_VOLUME_MODE_MISMATCH: &str = "VolumeModeMismatch";

/// Collaborators the discoverer works through
#[derive(Clone)]
pub struct DiscoveryContext {
    pub cache: Arc<VolumeCache>,
    pub api: ClusterApiRef,
    pub volume_util: VolumeUtilRef,
    pub mounter: MounterRef,
    pub cleanup: CleanupTrackerRef,
    pub metrics: Arc<Metrics>,
}

/// Per-StorageClass settings resolved once per pass
struct ClassSettings<'a> {
    name: &'a str,
    mount: &'a MountConfig,
    reclaim_policy: ReclaimPolicy,
    mount_options: Vec<String>,
}

/// Outcome for a single directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Created {
        name: String,
        mode: VolumeMode,
        capacity: u64,
    },
    /// A volume with this name is already published
    Exists(String),
    /// Skipped this pass; the reason was logged
    Skipped(String),
}

/// Capacity created during one pass, per volume mode
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct CapacityTotals {
    block: u64,
    filesystem: u64,
}

impl CapacityTotals {
    fn add(&mut self, outcomes: &[EntryOutcome]) {
        for outcome in outcomes {
            if let EntryOutcome::Created { mode, capacity, .. } = outcome {
                let total = match mode {
                    VolumeMode::Block => &mut self.block,
                    VolumeMode::Filesystem => &mut self.filesystem,
                };
                *total = total.saturating_add(*capacity);
            }
        }
    }

    fn publish(&self, metrics: &Metrics) {
        for (mode, total) in [(VolumeMode::Block, self.block), (VolumeMode::Filesystem, self.filesystem)] {
            metrics
                .capacity_bytes
                .with_label_values(&[mode.as_str()])
                .set(i64::try_from(total).unwrap_or(i64::MAX));
        }
    }
}

// =============================================================================
// Discoverer
// =============================================================================

/// Publishes local volumes found on this node
pub struct Discoverer {
    config: ProvisionerConfig,
    node_name: String,
    provisioner_name: String,
    labels: BTreeMap<String, String>,
    node_affinity: VolumeNodeAffinity,
    owner_reference: Option<OwnerReference>,
    ctx: DiscoveryContext,
    readiness: Arc<Readiness>,
}

impl Discoverer {
    /// Build a discoverer for `node`.
    ///
    /// Fails when the node lacks a name, the UID needed for an owner
    /// reference, or the label used for volume node affinity.
    pub fn new(config: ProvisionerConfig, node: &Node, ctx: DiscoveryContext) -> Result<Self> {
        let node_name = node
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::NodeIdentity("node has no name".into()))?;
        let node_uid = node.metadata.uid.clone().unwrap_or_default();
        let node_labels = node.metadata.labels.clone().unwrap_or_default();

        let mut labels = BTreeMap::new();
        for key in &config.node_labels_for_pv {
            match node_labels.get(key) {
                Some(value) => {
                    labels.insert(key.clone(), value.clone());
                }
                None => debug!("Node {} has no label {}, not copying it", node_name, key),
            }
        }
        labels.extend(config.labels_for_pv.clone());

        let affinity_value = node_labels.get(&config.node_label_key).ok_or_else(|| {
            Error::Configuration(format!(
                "node {} does not have expected label {}",
                node_name, config.node_label_key
            ))
        })?;
        let node_affinity = node_affinity_for(&config.node_label_key, affinity_value);

        let owner_reference = if config.set_pv_owner_ref {
            if node_uid.is_empty() {
                return Err(Error::NodeIdentity(format!(
                    "node {} has no UID for the owner reference",
                    node_name
                )));
            }
            Some(OwnerReference {
                api_version: "v1".into(),
                kind: "Node".into(),
                name: node_name.clone(),
                uid: node_uid.clone(),
                ..Default::default()
            })
        } else {
            None
        };

        let provisioner_name = provisioner_name(&node_name, &node_uid, config.use_node_name_only);

        Ok(Self {
            config,
            node_name,
            provisioner_name,
            labels,
            node_affinity,
            owner_reference,
            ctx,
            readiness: Readiness::new(),
        })
    }

    /// Identity written into the provisioned-by annotation
    pub fn provisioner_name(&self) -> &str {
        &self.provisioner_name
    }

    pub fn readiness(&self) -> Arc<Readiness> {
        self.readiness.clone()
    }

    /// Run one pass over every configured StorageClass.
    ///
    /// Returns the StorageClasses whose scan failed; readiness is set to
    /// whether that list is empty. The capacity gauge is reset to what this
    /// pass created.
    pub async fn discover_local_volumes(&self) -> Vec<Error> {
        let mut failures = Vec::new();
        let mut totals = CapacityTotals::default();
        for (class, mount) in &self.config.storage_class_map {
            if let Err(e) = self.scan_class(class, mount, &mut totals).await {
                error!("Discovery for StorageClass {} failed: {}", class, e);
                failures.push(e);
            }
        }
        totals.publish(&self.ctx.metrics);
        self.readiness.set(failures.is_empty());
        failures
    }

    /// Scan the directory of one StorageClass
    pub async fn discover_volumes_at_path(&self, class: &str, mount: &MountConfig) -> Result<Vec<EntryOutcome>> {
        self.scan_class(class, mount, &mut CapacityTotals::default()).await
    }

    async fn scan_class(
        &self,
        class: &str,
        mount: &MountConfig,
        totals: &mut CapacityTotals,
    ) -> Result<Vec<EntryOutcome>> {
        debug!("Discovering volumes at {} for StorageClass {}", mount.mount_dir, class);
        let settings = self.class_settings(class, mount).await?;

        let mut entries = self.ctx.volume_util.read_dir(Path::new(&mount.mount_dir))?;
        entries.sort();

        let mount_table = self.ctx.mounter.mount_table()?;
        let pattern = glob::Pattern::new(&mount.name_pattern)?;

        let mut outcomes = Vec::new();
        let mut errors = Vec::new();
        for entry in entries {
            if !pattern.matches(&entry) {
                debug!("Skipping {} not matching pattern {}", entry, mount.name_pattern);
                continue;
            }
            match self.discover_entry(&settings, &entry, &mount_table).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!("Error discovering {} for StorageClass {}: {}", entry, class, e);
                    errors.push(e.to_string());
                }
            }
        }

        totals.add(&outcomes);
        if errors.is_empty() {
            Ok(outcomes)
        } else {
            Err(Error::DiscoveryFailed {
                storage_class: class.to_string(),
                errors,
            })
        }
    }

    async fn class_settings<'a>(&self, class: &'a str, mount: &'a MountConfig) -> Result<ClassSettings<'a>> {
        let storage_class = self
            .ctx
            .api
            .get_storage_class(class)
            .await?
            .ok_or_else(|| Error::StorageClassNotFound {
                name: class.to_string(),
            })?;

        let reclaim_policy = match storage_class.reclaim_policy.as_deref() {
            None => ReclaimPolicy::Delete,
            Some(policy) => policy.parse().map_err(|_| Error::UnsupportedReclaimPolicy {
                policy: policy.to_string(),
                storage_class: class.to_string(),
            })?,
        };

        Ok(ClassSettings {
            name: class,
            mount,
            reclaim_policy,
            mount_options: storage_class.mount_options.unwrap_or_default(),
        })
    }

    async fn discover_entry(
        &self,
        settings: &ClassSettings<'_>,
        entry: &str,
        mount_table: &MountTable,
    ) -> Result<EntryOutcome> {
        let started = Instant::now();
        let mount = settings.mount;
        let file_path = Path::new(&mount.mount_dir).join(entry);
        let file_path_str = file_path.to_string_lossy().to_string();
        let host_path = Path::new(&mount.host_dir)
            .join(entry)
            .to_string_lossy()
            .to_string();

        let mode = self.ctx.volume_util.volume_mode(&file_path)?;
        let pv_name = generate_pv_name(entry, &self.node_name, settings.name);
        let use_job = mode == VolumeMode::Block && self.config.use_job_for_cleaning;

        let mut reclaimed = false;
        if let Some(existing) = self.ctx.cache.get(&pv_name) {
            if volume::volume_mode(&existing) == VolumeMode::Block && mode == VolumeMode::Filesystem {
                let message = format!(
                    "incorrect volume mode: volume {} is Block but {} is a filesystem",
                    pv_name, file_path_str
                );
                error!("{}", message);
                self.warn_event(&existing, EVENT_VOLUME_MODE_MISMATCH, &message).await;
                return Err(Error::VolumeModeMismatch {
                    volume: pv_name,
                    path: file_path_str,
                });
            }
            if !volume::is_released_with_delete(&existing) {
                return Ok(EntryOutcome::Exists(pv_name));
            }
            if self.ctx.cleanup.in_progress(&pv_name, use_job) {
                info!("Volume {} is still being cleaned, not recreating it yet", pv_name);
                return Ok(EntryOutcome::Skipped(pv_name));
            }
            info!(
                "Volume {} is Released with Delete policy and its device was found again, recreating it",
                pv_name
            );
            ignore_not_found(self.ctx.api.delete_volume(&pv_name).await)?;
            reclaimed = true;
        }

        let conflicts: Vec<String> = self
            .ctx
            .cache
            .find_by_path(&host_path)
            .into_iter()
            .filter(|name| name != &pv_name)
            .collect();
        if let Some(existing) = conflicts.first() {
            let conflict = Error::PathConflict {
                volume: pv_name.clone(),
                path: host_path.clone(),
                existing: existing.clone(),
            };
            error!("Skipping {}: {}", entry, conflict);
            return Ok(EntryOutcome::Skipped(pv_name));
        }

        if self.ctx.cleanup.in_progress(&pv_name, use_job) {
            info!("Volume {} is still being cleaned, skipping", pv_name);
            return Ok(EntryOutcome::Skipped(pv_name));
        }
        if let Err(e) = self.ctx.cleanup.remove_status(&pv_name, use_job) {
            error!("Failed to clear cleanup status of {}: {}", pv_name, e);
            return Ok(EntryOutcome::Skipped(pv_name));
        }

        let capacity = match mode {
            VolumeMode::Block => {
                if mount.volume_mode == VolumeMode::Block && !settings.mount_options.is_empty() {
                    warn!(
                        "Path {} will be used to create block volume, mount options {:?} will not take effect",
                        file_path_str, settings.mount_options
                    );
                }
                self.ctx.volume_util.block_capacity(&file_path)?
            }
            VolumeMode::Filesystem => {
                if mount.volume_mode == VolumeMode::Block {
                    return Err(Error::VolumeModeMismatch {
                        volume: pv_name,
                        path: file_path_str,
                    });
                }
                if !mount_table.is_mount_point(&file_path_str) {
                    return Err(Error::NotMountPoint { path: file_path_str });
                }
                self.ctx.volume_util.fs_capacity(&file_path)?
            }
        };

        let pv = create_local_pv_spec(&LocalPvConfig {
            name: pv_name.clone(),
            host_path: host_path.clone(),
            capacity_bytes: round_down_capacity_pretty(capacity),
            storage_class: settings.name.to_string(),
            reclaim_policy: settings.reclaim_policy,
            provisioner_name: self.provisioner_name.clone(),
            volume_mode: mount.volume_mode,
            mount_options: settings.mount_options.clone(),
            fs_type: mount.fs_type.clone(),
            labels: self.labels.clone(),
            node_affinity: Some(self.node_affinity.clone()),
            owner_reference: self.owner_reference.clone(),
        });

        match self.ctx.api.create_volume(&pv).await {
            Ok(_) => {}
            // The old object lingers until its finalizers run; a later pass creates it
            Err(e) if reclaimed && e.is_already_exists() => {
                info!("Volume {} is still being deleted, recreating it on a later pass", pv_name);
                return Ok(EntryOutcome::Skipped(pv_name));
            }
            Err(e) => return Err(e),
        }
        info!("Created volume {} for {} ({} bytes)", pv_name, host_path, capacity);

        let mode_label = mount.volume_mode.as_str();
        let metrics = &self.ctx.metrics;
        metrics.discovery_total.with_label_values(&[mode_label]).inc();
        metrics
            .discovery_duration_seconds
            .with_label_values(&[mode_label])
            .observe(started.elapsed().as_secs_f64());

        Ok(EntryOutcome::Created {
            name: pv_name,
            mode: mount.volume_mode,
            capacity,
        })
    }

    async fn warn_event(&self, pv: &PersistentVolume, reason: &str, message: &str) {
        let target = ObjectReference {
            api_version: Some("v1".into()),
            kind: Some("PersistentVolume".into()),
            name: pv.metadata.name.clone(),
            uid: pv.metadata.uid.clone(),
            ..Default::default()
        };
        if let Err(e) = self
            .ctx
            .api
            .record_event(&target, EventType::Warning, reason, message)
            .await
        {
            warn!("Failed to record event on {}: {}", volume::volume_name(pv), e);
        }
    }
}
