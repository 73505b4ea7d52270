//! Local Volume Discovery
//!
//! Scans the configured directories of each StorageClass and creates a
//! PersistentVolume for every new device or mount point found there.
//!
//! # Pass
//!
//! ```text
//! for each StorageClass:
//!     reclaim policy + mount options  <- StorageClass object
//!     entries                         <- read_dir(mountDir), filtered by namePattern
//!     mount table                     <- one snapshot per pass
//!     for each entry:
//!         classify -> name -> cache check -> path check -> cleanup check
//!         -> capacity -> create PV
//! readiness = no StorageClass failed
//! ```

pub mod discoverer;
pub mod readiness;

pub use discoverer::*;
pub use readiness::*;
