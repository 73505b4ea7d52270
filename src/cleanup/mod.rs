//! Cleanup Status Boundary
//!
//! Discovery must not republish a device while the wipe of its previous
//! volume is still running. Wiping is done outside this process (by the
//! deleter of whatever owns the device), so this agent has no wipe state
//! of its own to consult.
//!
//! [`DetachedCleanupTracker`] is the tracker used when no cleaner is attached:
//! nothing is ever in progress and there is no status to clear. A cleaner
//! running in-process or through Jobs plugs in through the
//! [`CleanupTracker`] port instead.

use crate::domain::CleanupTracker;
use crate::error::Result;
use std::sync::Arc;

/// Tracker for a node whose devices are wiped by an external cleaner
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedCleanupTracker;

impl DetachedCleanupTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl CleanupTracker for DetachedCleanupTracker {
    fn in_progress(&self, _volume_name: &str, _use_job: bool) -> bool {
        false
    }

    fn remove_status(&self, _volume_name: &str, _use_job: bool) -> Result<bool> {
        Ok(false)
    }
}
