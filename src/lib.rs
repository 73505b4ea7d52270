//! Local Volume Provisioner
//!
//! Publishes node-local disks as Kubernetes PersistentVolumes and retires
//! those volumes, and the claims bound to them, when their node goes away.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── per-node agent ────────────────────────┐
//! │                                                                 │
//! │   host dirs ──► Discoverer ──create──►┐                         │
//! │                    ▲                   │                        │
//! │                    │ get / findByPath  │                        │
//! │              ┌─────┴──────┐            ▼                        │
//! │              │ VolumeCache│◄── Populator ◄── PV watch ◄── API   │
//! │              └────────────┘                                     │
//! └─────────────────────────────────────────────────────────────────┘
//!
//! ┌──────────────────── cluster-wide node cleanup ──────────────────┐
//! │                                                                 │
//! │   Node watch ──► CleanupController ──► DelayingQueue ──► workers│
//! │                                          (delete claims)        │
//! │   timer ──► StaleVolumeDeleter ──► PendingPodReaper             │
//! │              (delete volumes)       (delete stuck pods)         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`]: in-memory index of the volumes this agent owns
//! - [`populator`]: applies volume watch events to the cache
//! - [`discovery`]: scans host directories and creates volumes
//! - [`deleter`]: polling cleanup of volumes on deleted nodes
//! - [`nodecleanup`]: delayed claim cleanup after node deletion
//! - [`volume`]: naming, capacity, construction and affinity helpers
//! - [`adapters`]: Kubernetes and Linux implementations of the ports
//! - [`domain`]: collaborator traits and core enums
//! - [`error`]: Error types and handling

pub mod adapters;
pub mod cache;
pub mod cleanup;
pub mod config;
pub mod deleter;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod node;
pub mod nodecleanup;
pub mod populator;
pub mod provisioner;
pub mod volume;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use adapters::{KubeClusterApi, LinuxVolumeUtil, ProcMounter};

pub use cache::VolumeCache;

pub use cleanup::DetachedCleanupTracker;

pub use config::{MountConfig, NodeCleanupConfig, ProvisionerConfig};

pub use deleter::{PendingPodReaper, StaleVolumeDeleter};

pub use discovery::{Discoverer, DiscoveryContext, Readiness};

pub use domain::ports::{
    CleanupTracker, ClusterApi, EventType, MountTable, Mounter, ReclaimPolicy, VolumeMode,
    VolumePhase, VolumeUtil,
};

pub use error::{Error, ErrorAction, Result};

pub use metrics::Metrics;

pub use nodecleanup::{CleanupController, DelayingQueue, NodeEvent};

pub use populator::{DeletedVolume, Populator, VolumeEvent};

pub use provisioner::Provisioner;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
