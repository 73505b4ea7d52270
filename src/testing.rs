//! In-memory fakes and object builders for unit tests

use crate::domain::{
    CleanupTracker, ClusterApi, EventType, MountTable, Mounter, VolumeMode, VolumeUtil,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    LocalVolumeSource, Node, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PersistentVolumeSpec,
    PersistentVolumeStatus, Pod, PodSpec, PodStatus, Taint, Volume,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ErrorResponse;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

pub const NODE_LABEL_KEY: &str = "kubernetes.io/hostname";

// =============================================================================
// Object Builders
// =============================================================================

pub fn api_error(code: u16) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message: "injected failure".into(),
        reason: "Test".into(),
        code,
    }))
}

/// Minimal local volume with a name and host path
pub fn local_pv(name: &str, path: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            local: Some(LocalVolumeSource {
                path: path.to_string(),
                fs_type: None,
            }),
            ..Default::default()
        }),
        status: None,
    }
}

/// Local volume pinned to a node, in a StorageClass, with phase and policy
pub fn node_pv(
    name: &str,
    node: &str,
    storage_class: &str,
    phase: &str,
    reclaim_policy: &str,
) -> PersistentVolume {
    let mut pv = local_pv(name, &format!("/mnt/disks/{}", name));
    if let Some(spec) = pv.spec.as_mut() {
        spec.storage_class_name = Some(storage_class.to_string());
        spec.persistent_volume_reclaim_policy = Some(reclaim_policy.to_string());
        spec.node_affinity = Some(crate::volume::node_affinity_for(NODE_LABEL_KEY, node));
    }
    pv.status = Some(PersistentVolumeStatus {
        phase: Some(phase.to_string()),
        ..Default::default()
    });
    pv
}

/// Attach a claim reference to a volume
pub fn with_claim_ref(mut pv: PersistentVolume, namespace: &str, name: &str, uid: &str) -> PersistentVolume {
    if let Some(spec) = pv.spec.as_mut() {
        spec.claim_ref = Some(ObjectReference {
            kind: Some("PersistentVolumeClaim".into()),
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            uid: Some(uid.to_string()),
            ..Default::default()
        });
    }
    pv
}

pub fn node(name: &str, uid: &str, labels: &[(&str, &str)]) -> Node {
    let mut all_labels: BTreeMap<String, String> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    all_labels
        .entry(NODE_LABEL_KEY.to_string())
        .or_insert_with(|| name.to_string());
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(uid.to_string()),
            labels: Some(all_labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn claim(namespace: &str, name: &str, uid: &str, volume_name: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            uid: Some(uid.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            volume_name: Some(volume_name.to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn pod(namespace: &str, name: &str, phase: &str, claim_names: &[&str]) -> Pod {
    let volumes = claim_names
        .iter()
        .enumerate()
        .map(|(i, claim_name)| Volume {
            name: format!("vol-{}", i),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim_name.to_string(),
                read_only: None,
            }),
            ..Default::default()
        })
        .collect();
    Pod {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            volumes: Some(volumes),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

pub fn storage_class(name: &str, reclaim_policy: Option<&str>, mount_options: &[&str]) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        provisioner: "kubernetes.io/no-provisioner".into(),
        reclaim_policy: reclaim_policy.map(String::from),
        mount_options: (!mount_options.is_empty())
            .then(|| mount_options.iter().map(|o| o.to_string()).collect()),
        ..Default::default()
    }
}

// =============================================================================
// Fake Cluster API
// =============================================================================

/// Mutating call observed by the fake API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CreateVolume(String),
    DeleteVolume(String),
    DeleteClaim { namespace: String, name: String },
    DeletePod { namespace: String, name: String },
    SetNodeTaints(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub target: String,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
struct FakeState {
    volumes: BTreeMap<String, PersistentVolume>,
    claims: BTreeMap<(String, String), PersistentVolumeClaim>,
    nodes: BTreeMap<String, Node>,
    storage_classes: BTreeMap<String, StorageClass>,
    pods: BTreeMap<(String, String), Pod>,
    actions: Vec<Action>,
    events: Vec<RecordedEvent>,
    failing: HashSet<&'static str>,
    fail_budget: BTreeMap<&'static str, usize>,
    fail_codes: BTreeMap<&'static str, u16>,
    hold_deletes: bool,
    held_deletes: Vec<String>,
}

impl FakeState {
    /// Consume an injected failure for `method`, if any
    fn check(&mut self, method: &'static str) -> Result<()> {
        let code = self.fail_codes.get(method).copied().unwrap_or(500);
        if self.failing.contains(method) {
            return Err(api_error(code));
        }
        if let Some(remaining) = self.fail_budget.get_mut(method) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(api_error(code));
            }
        }
        Ok(())
    }
}

/// In-memory stand-in for the Kubernetes API
#[derive(Default)]
pub struct FakeClusterApi {
    state: Mutex<FakeState>,
}

impl FakeClusterApi {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub fn add_volume(&self, pv: PersistentVolume) {
        let name = crate::volume::volume_name(&pv).to_string();
        self.state.lock().volumes.insert(name, pv);
    }

    pub fn add_claim(&self, pvc: PersistentVolumeClaim) {
        let key = (
            pvc.metadata.namespace.clone().unwrap_or_default(),
            pvc.metadata.name.clone().unwrap_or_default(),
        );
        self.state.lock().claims.insert(key, pvc);
    }

    pub fn add_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.state.lock().nodes.insert(name, node);
    }

    pub fn remove_node(&self, name: &str) -> Option<Node> {
        self.state.lock().nodes.remove(name)
    }

    pub fn add_storage_class(&self, class: StorageClass) {
        let name = class.metadata.name.clone().unwrap_or_default();
        self.state.lock().storage_classes.insert(name, class);
    }

    pub fn add_pod(&self, pod: Pod) {
        let key = (
            pod.metadata.namespace.clone().unwrap_or_default(),
            pod.metadata.name.clone().unwrap_or_default(),
        );
        self.state.lock().pods.insert(key, pod);
    }

    /// Make every call to `method` fail with a server error
    pub fn fail(&self, method: &'static str) {
        self.state.lock().failing.insert(method);
    }

    /// Make the next `times` calls to `method` fail with a server error
    pub fn fail_times(&self, method: &'static str, times: usize) {
        self.state.lock().fail_budget.insert(method, times);
    }

    /// Keep deleted volumes around, as finalizers would, until
    /// [`Self::finish_volume_deletes`]
    pub fn hold_volume_deletes(&self) {
        self.state.lock().hold_deletes = true;
    }

    pub fn finish_volume_deletes(&self) {
        let mut state = self.state.lock();
        state.hold_deletes = false;
        for name in std::mem::take(&mut state.held_deletes) {
            state.volumes.remove(&name);
        }
    }

    /// Make the next `times` calls to `method` fail with status `code`
    pub fn fail_times_with(&self, method: &'static str, times: usize, code: u16) {
        let mut state = self.state.lock();
        state.fail_budget.insert(method, times);
        state.fail_codes.insert(method, code);
    }

    pub fn actions(&self) -> Vec<Action> {
        self.state.lock().actions.clone()
    }

    pub fn created_volumes(&self) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter_map(|a| match a {
                Action::CreateVolume(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn deleted_volumes(&self) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter_map(|a| match a {
                Action::DeleteVolume(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn deleted_claims(&self) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter_map(|a| match a {
                Action::DeleteClaim { namespace, name } => Some(format!("{}/{}", namespace, name)),
                _ => None,
            })
            .collect()
    }

    pub fn deleted_pods(&self) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter_map(|a| match a {
                Action::DeletePod { namespace, name } => Some(format!("{}/{}", namespace, name)),
                _ => None,
            })
            .collect()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state.lock().events.clone()
    }

    pub fn volume(&self, name: &str) -> Option<PersistentVolume> {
        self.state.lock().volumes.get(name).cloned()
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.state.lock().nodes.get(name).cloned()
    }

    pub fn clear_actions(&self) {
        self.state.lock().actions.clear();
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn list_volumes(&self) -> Result<Vec<PersistentVolume>> {
        let mut state = self.state.lock();
        state.check("list_volumes")?;
        Ok(state.volumes.values().cloned().collect())
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        let mut state = self.state.lock();
        state.check("get_volume")?;
        Ok(state.volumes.get(name).cloned())
    }

    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume> {
        let mut state = self.state.lock();
        state.check("create_volume")?;
        let name = crate::volume::volume_name(volume).to_string();
        if state.volumes.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: "PersistentVolume".into(),
                name,
            });
        }
        let mut created = volume.clone();
        created.status = Some(PersistentVolumeStatus {
            phase: Some("Available".into()),
            ..Default::default()
        });
        state.volumes.insert(name.clone(), created.clone());
        state.actions.push(Action::CreateVolume(name));
        Ok(created)
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check("delete_volume")?;
        state.actions.push(Action::DeleteVolume(name.to_string()));
        if state.hold_deletes && state.volumes.contains_key(name) {
            state.held_deletes.push(name.to_string());
            return Ok(());
        }
        match state.volumes.remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::ResourceNotFound {
                kind: "PersistentVolume".into(),
                name: name.to_string(),
            }),
        }
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        let mut state = self.state.lock();
        state.check("get_claim")?;
        Ok(state
            .claims
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn delete_claim(&self, namespace: &str, name: &str, uid: Option<&str>) -> Result<()> {
        let mut state = self.state.lock();
        state.check("delete_claim")?;
        let key = (namespace.to_string(), name.to_string());
        let existing = state.claims.get(&key).map(|pvc| pvc.metadata.uid.clone());
        let current_uid = match existing {
            Some(uid) => uid,
            None => {
                state.actions.push(Action::DeleteClaim {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                });
                return Err(Error::ResourceNotFound {
                    kind: "PersistentVolumeClaim".into(),
                    name: format!("{}/{}", namespace, name),
                });
            }
        };
        if let Some(expected) = uid {
            if current_uid.as_deref() != Some(expected) {
                return Err(api_error(409));
            }
        }
        state.claims.remove(&key);
        state.actions.push(Action::DeleteClaim {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let mut state = self.state.lock();
        state.check("get_node")?;
        Ok(state.nodes.get(name).cloned())
    }

    async fn node_exists(&self, label_key: &str, value: &str) -> Result<bool> {
        let mut state = self.state.lock();
        state.check("node_exists")?;
        Ok(state.nodes.values().any(|node| {
            node.metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(label_key))
                .map_or(false, |v| v == value)
        }))
    }

    async fn set_node_taints(&self, name: &str, taints: Vec<Taint>) -> Result<()> {
        let mut state = self.state.lock();
        state.check("set_node_taints")?;
        let node = state.nodes.get_mut(name).ok_or_else(|| Error::ResourceNotFound {
            kind: "Node".into(),
            name: name.to_string(),
        })?;
        node.spec.get_or_insert_with(Default::default).taints = Some(taints);
        state.actions.push(Action::SetNodeTaints(name.to_string()));
        Ok(())
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        let mut state = self.state.lock();
        state.check("get_storage_class")?;
        Ok(state.storage_classes.get(name).cloned())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let mut state = self.state.lock();
        state.check("list_pods")?;
        Ok(state
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check("delete_pod")?;
        state.actions.push(Action::DeletePod {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        match state.pods.remove(&(namespace.to_string(), name.to_string())) {
            Some(_) => Ok(()),
            None => Err(Error::ResourceNotFound {
                kind: "Pod".into(),
                name: format!("{}/{}", namespace, name),
            }),
        }
    }

    async fn record_event(
        &self,
        target: &ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.check("record_event")?;
        let target = match &target.namespace {
            Some(ns) => format!("{}/{}", ns, target.name.clone().unwrap_or_default()),
            None => target.name.clone().unwrap_or_default(),
        };
        state.events.push(RecordedEvent {
            target,
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}

// =============================================================================
// Fake Host Probing
// =============================================================================

/// Directory entry served by [`FakeVolumeUtil`]
#[derive(Debug, Clone)]
pub struct FakeEntry {
    pub name: String,
    pub mode: Option<VolumeMode>,
    pub capacity: u64,
}

impl FakeEntry {
    pub fn fs(name: &str, capacity: u64) -> Self {
        Self {
            name: name.to_string(),
            mode: Some(VolumeMode::Filesystem),
            capacity,
        }
    }

    pub fn block(name: &str, capacity: u64) -> Self {
        Self {
            name: name.to_string(),
            mode: Some(VolumeMode::Block),
            capacity,
        }
    }

    /// Entry whose type cannot be determined
    pub fn broken(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mode: None,
            capacity: 0,
        }
    }
}

#[derive(Default)]
pub struct FakeVolumeUtil {
    dirs: Mutex<BTreeMap<String, Vec<FakeEntry>>>,
}

impl FakeVolumeUtil {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub fn add_dir(&self, dir: &str, entries: Vec<FakeEntry>) {
        self.dirs.lock().insert(dir.to_string(), entries);
    }

    pub fn set_mode(&self, dir: &str, name: &str, mode: VolumeMode) {
        if let Some(entry) = self
            .dirs
            .lock()
            .get_mut(dir)
            .and_then(|entries| entries.iter_mut().find(|e| e.name == name))
        {
            entry.mode = Some(mode);
        }
    }

    fn entry(&self, path: &Path) -> Result<FakeEntry> {
        let parent = path.parent().map(|p| p.to_string_lossy().to_string()).unwrap_or_default();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.dirs
            .lock()
            .get(&parent)
            .and_then(|entries| entries.iter().find(|e| e.name == name).cloned())
            .ok_or_else(|| Error::HostProbe {
                path: path.display().to_string(),
                reason: "no such entry".into(),
            })
    }
}

impl VolumeUtil for FakeVolumeUtil {
    fn read_dir(&self, path: &Path) -> Result<Vec<String>> {
        let key = path.to_string_lossy().to_string();
        self.dirs
            .lock()
            .get(&key)
            .map(|entries| entries.iter().map(|e| e.name.clone()).collect())
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} does not exist", key),
                ))
            })
    }

    fn volume_mode(&self, path: &Path) -> Result<VolumeMode> {
        self.entry(path)?.mode.ok_or_else(|| Error::HostProbe {
            path: path.display().to_string(),
            reason: "neither a directory nor a block device".into(),
        })
    }

    fn fs_capacity(&self, path: &Path) -> Result<u64> {
        Ok(self.entry(path)?.capacity)
    }

    fn block_capacity(&self, path: &Path) -> Result<u64> {
        Ok(self.entry(path)?.capacity)
    }
}

/// Mount table backed by a fixed set of paths
#[derive(Default)]
pub struct FakeMounter {
    mount_points: Mutex<BTreeSet<String>>,
}

impl FakeMounter {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub fn mount(&self, path: &str) {
        self.mount_points.lock().insert(path.to_string());
    }
}

impl Mounter for FakeMounter {
    fn mount_table(&self) -> Result<MountTable> {
        Ok(MountTable::new(self.mount_points.lock().iter().cloned()))
    }
}

// =============================================================================
// Fake Cleanup Tracker
// =============================================================================

#[derive(Default)]
pub struct FakeCleanupTracker {
    in_progress: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    removed: Mutex<Vec<(String, bool)>>,
}

impl FakeCleanupTracker {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub fn start(&self, name: &str) {
        self.in_progress.lock().insert(name.to_string());
    }

    pub fn fail_remove(&self, name: &str) {
        self.failing.lock().insert(name.to_string());
    }

    pub fn removed(&self) -> Vec<(String, bool)> {
        self.removed.lock().clone()
    }
}

impl CleanupTracker for FakeCleanupTracker {
    fn in_progress(&self, volume_name: &str, _use_job: bool) -> bool {
        self.in_progress.lock().contains(volume_name)
    }

    fn remove_status(&self, volume_name: &str, use_job: bool) -> Result<bool> {
        if self.failing.lock().contains(volume_name) {
            return Err(Error::CleanupStatus {
                volume: volume_name.to_string(),
                reason: "injected failure".into(),
            });
        }
        self.removed.lock().push((volume_name.to_string(), use_job));
        Ok(false)
    }
}
