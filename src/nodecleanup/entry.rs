//! Cleanup queue payloads

use crate::volume;
use k8s_openapi::api::core::v1::{Node, PersistentVolume};

/// A volume pinned to a node that was observed deleted.
///
/// Never persisted; a scan at startup or on the next node deletion
/// regenerates lost entries.
#[derive(Debug, Clone)]
pub struct CleanupEntry {
    pub node_name: String,
    /// Snapshot of the volume when the entry was scheduled
    pub volume: PersistentVolume,
}

impl CleanupEntry {
    pub fn new(node_name: impl Into<String>, volume: PersistentVolume) -> Self {
        Self {
            node_name: node_name.into(),
            volume,
        }
    }

    pub fn volume_name(&self) -> &str {
        volume::volume_name(&self.volume)
    }
}

/// Queue item carrying its own retry count
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub entry: CleanupEntry,
    pub attempt: u32,
}

impl QueueItem {
    pub fn new(entry: CleanupEntry) -> Self {
        Self { entry, attempt: 0 }
    }

    /// The same entry, one retry further along
    pub fn retry(self) -> Self {
        Self {
            entry: self.entry,
            attempt: self.attempt.saturating_add(1),
        }
    }
}

/// Node change notification consumed by the cleanup controller
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Applied(Node),
    Deleted(Node),
    /// The watch relisted; this is the complete current set
    Resynced(Vec<Node>),
}
