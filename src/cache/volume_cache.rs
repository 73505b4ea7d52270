//! Name- and path-indexed volume store

use crate::volume;
use k8s_openapi::api::core::v1::PersistentVolume;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Debug, Default)]
struct CacheState {
    /// Volume name -> last observed object
    volumes: HashMap<String, PersistentVolume>,
    /// Host path -> names of volumes publishing it
    paths: HashMap<String, BTreeSet<String>>,
}

impl CacheState {
    fn unindex(&mut self, name: &str, pv: &PersistentVolume) {
        if let Some(path) = volume::local_path(pv) {
            if let Some(names) = self.paths.get_mut(path) {
                names.remove(name);
                if names.is_empty() {
                    self.paths.remove(path);
                }
            }
        }
    }

    fn upsert(&mut self, pv: PersistentVolume) {
        let name = volume::volume_name(&pv).to_string();
        if let Some(previous) = self.volumes.remove(&name) {
            self.unindex(&name, &previous);
        }
        if let Some(path) = volume::local_path(&pv) {
            self.paths
                .entry(path.to_string())
                .or_default()
                .insert(name.clone());
        }
        self.volumes.insert(name, pv);
    }
}

/// Thread-safe cache of locally owned volumes
#[derive(Debug, Default)]
pub struct VolumeCache {
    state: RwLock<CacheState>,
}

impl VolumeCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get a copy of a cached volume
    pub fn get(&self, name: &str) -> Option<PersistentVolume> {
        self.state.read().volumes.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.read().volumes.contains_key(name)
    }

    /// Insert a volume observed for the first time
    pub fn add(&self, pv: PersistentVolume) {
        self.state.write().upsert(pv);
    }

    /// Replace a cached volume with a newer observation
    pub fn update(&self, pv: PersistentVolume) {
        self.state.write().upsert(pv);
    }

    /// Remove a volume, returning the last cached copy
    pub fn delete(&self, name: &str) -> Option<PersistentVolume> {
        let mut state = self.state.write();
        let removed = state.volumes.remove(name)?;
        state.unindex(name, &removed);
        Some(removed)
    }

    /// Names of the cached volumes publishing `host_path`
    pub fn find_by_path(&self, host_path: &str) -> Vec<String> {
        self.state
            .read()
            .paths
            .get(host_path)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of every cached volume
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().volumes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.state.read().volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().volumes.is_empty()
    }
}
