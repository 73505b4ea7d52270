//! Polling deleter for volumes pinned to deleted nodes

use super::{deleted_node_of, PendingPodReaper};
use crate::domain::{ClusterApiRef, ReclaimPolicy, VolumePhase};
use crate::error::{ignore_not_found, Result};
use crate::metrics::Metrics;
use crate::volume::{self, is_local_pv_with_storage_class};
use k8s_openapi::api::core::v1::PersistentVolume;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one polling pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletePassSummary {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

/// Deletes stale local volumes in the configured StorageClasses
pub struct StaleVolumeDeleter {
    api: ClusterApiRef,
    storage_class_names: Vec<String>,
    node_label_key: String,
    metrics: Arc<Metrics>,
    reaper: Option<PendingPodReaper>,
}

impl StaleVolumeDeleter {
    pub fn new(
        api: ClusterApiRef,
        storage_class_names: Vec<String>,
        node_label_key: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            api,
            storage_class_names,
            node_label_key: node_label_key.into(),
            metrics,
            reaper: None,
        }
    }

    /// Run the pending-pod reaper after every pass
    pub fn with_pending_pod_reaper(mut self, reaper: PendingPodReaper) -> Self {
        self.reaper = Some(reaper);
        self
    }

    /// Poll until `shutdown` fires, sleeping `interval` between passes
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        info!("Starting stale volume deleter, interval {:?}", interval);
        loop {
            self.delete_volumes().await;
            if let Some(reaper) = &self.reaper {
                reaper.reap().await;
            }
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Stale volume deleter stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Scan every volume once and delete the stale ones
    pub async fn delete_volumes(&self) -> DeletePassSummary {
        let mut summary = DeletePassSummary::default();
        let volumes = match self.api.list_volumes().await {
            Ok(volumes) => volumes,
            Err(e) => {
                error!("Error listing volumes: {}", e);
                return summary;
            }
        };

        for pv in volumes {
            let name = volume::volume_name(&pv).to_string();
            match self.delete_if_stale(&pv).await {
                Ok(true) => summary.deleted.push(name),
                Ok(false) => {}
                Err(e) => {
                    self.metrics
                        .pv_delete_failed_total
                        .with_label_values(&[volume::phase(&pv).as_str(), volume::reclaim_policy_str(&pv)])
                        .inc();
                    error!("Error deleting volume {}: {}", name, e);
                    summary.failed.push(name);
                }
            }
        }
        summary
    }

    async fn delete_if_stale(&self, pv: &PersistentVolume) -> Result<bool> {
        if !is_local_pv_with_storage_class(pv, &self.storage_class_names) {
            return Ok(false);
        }
        let name = volume::volume_name(pv);

        let node_name = match deleted_node_of(self.api.as_ref(), pv, &self.node_label_key).await {
            Ok(Some(node_name)) => node_name,
            Ok(None) => return Ok(false),
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                warn!("Not considering volume {} for deletion: {}", name, e);
                return Ok(false);
            }
        };

        if !reclaimable(pv) {
            debug!(
                "Volume {} references deleted node {} but is {}, leaving it",
                name,
                node_name,
                volume::phase(pv)
            );
            return Ok(false);
        }

        info!("Deleting volume {} with affinity to deleted node {}", name, node_name);
        let result = self.api.delete_volume(name).await;
        if matches!(&result, Err(e) if e.is_not_found()) {
            warn!("Volume {} no longer exists", name);
        }
        ignore_not_found(result)?;
        Ok(true)
    }
}

/// Only unbound volumes, or released ones that are meant to be deleted
fn reclaimable(pv: &PersistentVolume) -> bool {
    match volume::phase(pv) {
        VolumePhase::Available => true,
        VolumePhase::Released => volume::reclaim_policy(pv) == Some(ReclaimPolicy::Delete),
        _ => false,
    }
}
