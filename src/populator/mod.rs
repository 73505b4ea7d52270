//! Cache Populator
//!
//! Applies PersistentVolume watch events to the [`VolumeCache`]. Volumes
//! enter the cache only when their provisioned-by annotation names this
//! agent; once cached they are refreshed on every update and dropped on
//! delete. Handlers only mutate the cache and never call the API server.

use crate::cache::VolumeCache;
use crate::error::Result;
use crate::volume;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::PersistentVolume;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Events
// =============================================================================

/// A deletion as delivered by the watch
#[derive(Debug, Clone)]
pub enum DeletedVolume {
    /// The final state of the deleted object
    Final(PersistentVolume),
    /// The delete itself was missed; only the last known state is available
    Tombstone {
        name: String,
        last_known: Option<PersistentVolume>,
    },
}

impl DeletedVolume {
    pub fn name(&self) -> &str {
        match self {
            DeletedVolume::Final(pv) => volume::volume_name(pv),
            DeletedVolume::Tombstone { name, .. } => name,
        }
    }
}

/// Change notification for a PersistentVolume
#[derive(Debug, Clone)]
pub enum VolumeEvent {
    Added(PersistentVolume),
    Updated(PersistentVolume),
    Deleted(DeletedVolume),
    /// The watch relisted; this is the complete current set
    Resynced(Vec<PersistentVolume>),
}

// =============================================================================
// Populator
// =============================================================================

/// Keeps the volume cache in line with the API server
pub struct Populator {
    cache: Arc<VolumeCache>,
    provisioner_name: String,
    use_node_name_only: bool,
    synced: watch::Sender<bool>,
}

impl Populator {
    pub fn new(
        cache: Arc<VolumeCache>,
        provisioner_name: impl Into<String>,
        use_node_name_only: bool,
    ) -> Arc<Self> {
        let (synced, _) = watch::channel(false);
        Arc::new(Self {
            cache,
            provisioner_name: provisioner_name.into(),
            use_node_name_only,
            synced,
        })
    }

    /// Whether this agent created `pv`
    pub fn owns(&self, pv: &PersistentVolume) -> bool {
        match volume::provisioned_by(pv) {
            Some(creator) if creator == self.provisioner_name => true,
            Some(creator) => self.use_node_name_only && creator.starts_with(&self.provisioner_name),
            None => false,
        }
    }

    /// Apply one watch event
    pub fn handle(&self, event: VolumeEvent) {
        match event {
            VolumeEvent::Added(pv) | VolumeEvent::Updated(pv) => self.on_upsert(pv),
            VolumeEvent::Deleted(deleted) => self.on_delete(deleted),
            VolumeEvent::Resynced(volumes) => self.on_resync(volumes),
        }
    }

    fn on_upsert(&self, pv: PersistentVolume) {
        let name = volume::volume_name(&pv).to_string();
        if self.cache.contains(&name) {
            debug!("Updating volume {} in cache", name);
            self.cache.update(pv);
        } else if self.owns(&pv) {
            info!("Adding volume {} to cache", name);
            self.cache.add(pv);
        }
    }

    // Cache removal only; releasing the backing device belongs to the deleters.
    fn on_delete(&self, deleted: DeletedVolume) {
        let name = deleted.name();
        if matches!(deleted, DeletedVolume::Tombstone { .. }) {
            debug!("Volume {} deleted while the watch was disconnected", name);
        }
        if self.cache.delete(name).is_some() {
            info!("Removed volume {} from cache", name);
        }
    }

    fn on_resync(&self, volumes: Vec<PersistentVolume>) {
        let current: HashSet<&str> = volumes.iter().map(volume::volume_name).collect();
        for name in self.cache.names() {
            if !current.contains(name.as_str()) {
                let last_known = self.cache.get(&name);
                self.on_delete(DeletedVolume::Tombstone { name, last_known });
            }
        }
        for pv in volumes {
            self.on_upsert(pv);
        }
        self.synced.send_replace(true);
    }

    /// Whether the first full listing has been applied
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait for the first full listing
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Consume a watch stream until it ends or `shutdown` fires
    pub async fn run<S>(self: Arc<Self>, events: S, shutdown: CancellationToken)
    where
        S: Stream<Item = Result<VolumeEvent>> + Send,
    {
        futures::pin_mut!(events);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Populator shutting down");
                    return;
                }
                next = events.next() => match next {
                    Some(Ok(event)) => self.handle(event),
                    Some(Err(e)) => warn!("Volume watch error: {}", e),
                    None => {
                        warn!("Volume watch stream ended");
                        return;
                    }
                },
            }
        }
    }
}
