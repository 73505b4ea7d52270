//! Kubernetes Cluster Adapter
//!
//! Implements [`ClusterApi`] on top of a kube-rs [`Client`] and turns
//! kube-runtime watch streams into the populator's and cleanup
//! controller's event types.

use crate::domain::{ClusterApi, EventType};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::nodecleanup::NodeEvent;
use crate::populator::{DeletedVolume, VolumeEvent};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{
    Node, ObjectReference, PersistentVolume, PersistentVolumeClaim, Pod, Taint,
};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions};
use kube::runtime::events::{Event, EventType as KubeEventType, Recorder, Reporter};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

// Method labels of the API request metrics
const METHOD_LIST: &str = "list";
const METHOD_GET: &str = "get";
const METHOD_CREATE: &str = "create";
const METHOD_DELETE: &str = "delete";
const METHOD_PATCH: &str = "patch";

/// [`ClusterApi`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
    reporter: Reporter,
    metrics: Arc<Metrics>,
}

impl KubeClusterApi {
    /// `component` identifies this process as the source of recorded events
    pub fn new(client: Client, component: impl Into<String>, instance: Option<String>, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: component.into(),
                instance,
            },
            metrics,
        }
    }

    /// Time a request and count it in the API metrics. A not-found answer
    /// is not counted as a failure.
    async fn observed<T, F>(&self, method: &str, request: F) -> std::result::Result<T, kube::Error>
    where
        F: Future<Output = std::result::Result<T, kube::Error>>,
    {
        let started = Instant::now();
        let result = request.await;
        let ok = match &result {
            Ok(_) => true,
            Err(kube::Error::Api(resp)) => resp.code == 404,
            Err(_) => false,
        };
        self.metrics.observe_request(method, started, ok);
        result
    }

    /// PersistentVolume changes, with relists delivered as full snapshots
    pub fn volume_events(&self) -> impl Stream<Item = Result<VolumeEvent>> + Send + 'static {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        watcher(api, watcher::Config::default())
            .default_backoff()
            .map(|event| match event {
                Ok(watcher::Event::Applied(pv)) => Ok(VolumeEvent::Updated(pv)),
                Ok(watcher::Event::Deleted(pv)) => Ok(VolumeEvent::Deleted(DeletedVolume::Final(pv))),
                Ok(watcher::Event::Restarted(pvs)) => Ok(VolumeEvent::Resynced(pvs)),
                Err(e) => Err(Error::Internal(format!("volume watch failed: {}", e))),
            })
    }

    /// Node changes, with relists delivered as full snapshots
    pub fn node_events(&self) -> impl Stream<Item = Result<NodeEvent>> + Send + 'static {
        let api: Api<Node> = Api::all(self.client.clone());
        watcher(api, watcher::Config::default())
            .default_backoff()
            .map(|event| match event {
                Ok(watcher::Event::Applied(node)) => Ok(NodeEvent::Applied(node)),
                Ok(watcher::Event::Deleted(node)) => Ok(NodeEvent::Deleted(node)),
                Ok(watcher::Event::Restarted(nodes)) => Ok(NodeEvent::Resynced(nodes)),
                Err(e) => Err(Error::Internal(format!("node watch failed: {}", e))),
            })
    }
}

/// Map an API error for `kind/name` onto the crate's error kinds
fn map_api_error(kind: &str, name: &str, err: kube::Error) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => Error::ResourceNotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        _ => Error::Kube(err),
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_volumes(&self) -> Result<Vec<PersistentVolume>> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let list = self
            .observed(METHOD_LIST, api.list(&ListParams::default()))
            .await?;
        Ok(list.items)
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(self.observed(METHOD_GET, api.get_opt(name)).await?)
    }

    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let name = crate::volume::volume_name(volume);
        self.observed(METHOD_CREATE, api.create(&PostParams::default(), volume))
            .await
            .map_err(|e| match &e {
                kube::Error::Api(resp) if resp.code == 409 => Error::ResourceExists {
                    kind: "PersistentVolume".into(),
                    name: name.to_string(),
                },
                _ => Error::Kube(e),
            })
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        self.observed(METHOD_DELETE, api.delete(name, &DeleteParams::default()))
            .await
            .map_err(|e| map_api_error("PersistentVolume", name, e))?;
        Ok(())
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(self.observed(METHOD_GET, api.get_opt(name)).await?)
    }

    async fn delete_claim(&self, namespace: &str, name: &str, uid: Option<&str>) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            preconditions: uid.map(|uid| Preconditions {
                uid: Some(uid.to_string()),
                resource_version: None,
            }),
            ..Default::default()
        };
        self.observed(METHOD_DELETE, api.delete(name, &params))
            .await
            .map_err(|e| map_api_error("PersistentVolumeClaim", &format!("{}/{}", namespace, name), e))?;
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(self.observed(METHOD_GET, api.get_opt(name)).await?)
    }

    async fn node_exists(&self, label_key: &str, value: &str) -> Result<bool> {
        let api: Api<Node> = Api::all(self.client.clone());
        let params = ListParams::default()
            .labels(&format!("{}={}", label_key, value))
            .limit(1);
        let list = self.observed(METHOD_LIST, api.list(&params)).await?;
        Ok(!list.items.is_empty())
    }

    async fn set_node_taints(&self, name: &str, taints: Vec<Taint>) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "spec": { "taints": taints } });
        self.observed(
            METHOD_PATCH,
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
        .map_err(|e| map_api_error("Node", name, e))?;
        Ok(())
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(self.observed(METHOD_GET, api.get_opt(name)).await?)
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = self
            .observed(METHOD_LIST, api.list(&ListParams::default()))
            .await?;
        Ok(list.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        self.observed(METHOD_DELETE, api.delete(name, &DeleteParams::default()))
            .await
            .map_err(|e| map_api_error("Pod", &format!("{}/{}", namespace, name), e))?;
        Ok(())
    }

    async fn record_event(
        &self,
        target: &ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        debug!(
            "Recording {:?} event {} on {:?}: {}",
            event_type, reason, target.name, message
        );
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), target.clone());
        recorder
            .publish(Event {
                type_: match event_type {
                    EventType::Normal => KubeEventType::Normal,
                    EventType::Warning => KubeEventType::Warning,
                },
                reason: reason.to_string(),
                note: Some(message.to_string()),
                action: reason.to_string(),
                secondary: None,
            })
            .await?;
        Ok(())
    }
}
