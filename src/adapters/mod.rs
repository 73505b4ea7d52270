//! Adapters
//!
//! Implementations of the domain ports against real systems:
//!
//! - [`kube_cluster`]: the Kubernetes API server via kube-rs
//! - [`host`]: Linux filesystem, block device and mount table probing

pub mod host;
pub mod kube_cluster;

pub use host::*;
pub use kube_cluster::*;
