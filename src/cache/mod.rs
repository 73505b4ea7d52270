//! Volume Cache
//!
//! In-memory mirror of the PersistentVolumes owned by this agent, indexed by
//! name and by host path.
//!
//! ```text
//! ┌──────────────┐  watch events   ┌─────────────┐   get / find_by_path   ┌────────────┐
//! │  API server  │ ──────────────▶ │  Populator  │ ─────▶ VolumeCache ◀── │ Discoverer │
//! └──────────────┘                 └─────────────┘                        └────────────┘
//! ```
//!
//! Only the populator mutates the cache. There is no eviction; entries leave
//! the cache when the API server reports the volume deleted.

pub mod volume_cache;

pub use volume_cache::*;
