//! Error types for the Local Volume Provisioner
//!
//! Provides structured error types for every component: discovery, the
//! cache populator, the stale volume deleters and the node cleanup
//! controller, plus the Kubernetes and host-probing boundaries.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the provisioner
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("StorageClass not found: {name}")]
    StorageClassNotFound { name: String },

    #[error("Unsupported reclaim policy {policy:?} for StorageClass {storage_class}")]
    UnsupportedReclaimPolicy { policy: String, storage_class: String },

    #[error("Node identity unavailable: {0}")]
    NodeIdentity(String),

    // =========================================================================
    // Volume Errors
    // =========================================================================
    #[error("Malformed node affinity on volume {volume}: {reason}")]
    MalformedAffinity { volume: String, reason: String },

    #[error("Path {path} for volume {volume} is already claimed by {existing}")]
    PathConflict {
        volume: String,
        path: String,
        existing: String,
    },

    #[error("Volume {volume} requires block mode but {path} is a filesystem")]
    VolumeModeMismatch { volume: String, path: String },

    #[error("Path {path} is not a mount point")]
    NotMountPoint { path: String },

    #[error("Discovery failed for StorageClass {storage_class}: {}", .errors.join("; "))]
    DiscoveryFailed {
        storage_class: String,
        errors: Vec<String>,
    },

    // =========================================================================
    // Host Probing Errors
    // =========================================================================
    #[error("Host probe failed for {path}: {reason}")]
    HostProbe { path: String, reason: String },

    #[error("Invalid name pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    // =========================================================================
    // Cleanup Errors
    // =========================================================================
    #[error("Cleanup status error for volume {volume}: {reason}")]
    CleanupStatus { volume: String, reason: String },

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Already gone counts as done
            e if e.is_not_found() => ErrorAction::NoRequeue,

            // Transient errors - retry with backoff
            Error::Kube(_) | Error::Io(_) | Error::Internal(_) => ErrorAction::RequeueWithBackoff,

            // Object still being created by someone else - short wait
            Error::ResourceExists { .. } => ErrorAction::RequeueAfter(Duration::from_secs(5)),

            // Configuration, shape and path errors - the next pass retries naturally
            Error::Configuration(_)
            | Error::StorageClassNotFound { .. }
            | Error::UnsupportedReclaimPolicy { .. }
            | Error::NodeIdentity(_)
            | Error::MalformedAffinity { .. }
            | Error::PathConflict { .. }
            | Error::VolumeModeMismatch { .. }
            | Error::NotMountPoint { .. }
            | Error::Pattern(_)
            | Error::YamlParse(_)
            | Error::JsonParse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Kube(_) | Error::Io(_)) && !self.is_not_found()
    }

    /// Check if this error means the target object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Check if this error means the target object already exists
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::ResourceExists { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }
}

/// Treat a not-found error as success
pub fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Result type alias for the provisioner
pub type Result<T> = std::result::Result<T, Error>;
