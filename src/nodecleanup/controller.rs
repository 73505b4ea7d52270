//! Node-deletion cleanup controller

use super::{BucketLimiter, CleanupEntry, DelayingQueue, ItemBackoff, NodeEvent, QueueItem};
use crate::config::NodeCleanupConfig;
use crate::domain::{ClusterApiRef, EventType};
use crate::error::{ignore_not_found, ErrorAction, Result};
use crate::metrics::Metrics;
use crate::volume::{self, is_local_pv_with_storage_class, node_attached_to_local_pv};
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Event reason on a claim whose volume's node was deleted
pub const EVENT_REFERENCED_NODE_DELETED: &str = "ReferencedNodeDeleted";

/// How a dequeued entry was resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing to do any more
    Cancelled(String),
    /// The claim was deleted
    ClaimDeleted { namespace: String, name: String },
}

/// Deletes claims bound to local volumes of deleted nodes, after a grace
/// delay and a re-check of the cluster state.
pub struct CleanupController {
    api: ClusterApiRef,
    config: NodeCleanupConfig,
    queue: DelayingQueue<QueueItem>,
    backoff: ItemBackoff,
    bucket: BucketLimiter,
    metrics: Arc<Metrics>,
}

impl CleanupController {
    pub fn new(api: ClusterApiRef, config: NodeCleanupConfig, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            api,
            config,
            queue: DelayingQueue::new(),
            backoff: ItemBackoff::default(),
            bucket: BucketLimiter::default(),
            metrics,
        })
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Schedule cleanup for every eligible bound volume whose node is gone.
    /// Returns the number of entries queued.
    ///
    /// A volume whose node cannot be looked up is scheduled anyway; the
    /// worker re-checks the node before deleting anything.
    pub async fn start_cleanup_timers_if_needed(&self) -> Result<usize> {
        let volumes = self.api.list_volumes().await?;
        let mut scheduled = 0;
        for pv in volumes {
            if !is_local_pv_with_storage_class(&pv, &self.config.storage_class_names) {
                continue;
            }
            let Some(claim_ref) = pv.spec.as_ref().and_then(|s| s.claim_ref.clone()) else {
                continue;
            };
            let name = volume::volume_name(&pv).to_string();

            let node_name = match node_attached_to_local_pv(&pv, &self.config.node_label_key) {
                Ok(node_name) => node_name,
                Err(e) => {
                    warn!("Not scheduling cleanup for volume {}: {}", name, e);
                    continue;
                }
            };

            match self.api.node_exists(&self.config.node_label_key, &node_name).await {
                Ok(true) => continue,
                Ok(false) => {
                    let message = format!(
                        "PVC is tied to a deleted Node. PVC will be cleaned up in {:?} if the Node doesn't come back",
                        self.config.pvc_deletion_delay
                    );
                    if let Err(e) = self
                        .api
                        .record_event(&claim_ref, EventType::Warning, EVENT_REFERENCED_NODE_DELETED, &message)
                        .await
                    {
                        warn!("Failed to record event for volume {}: {}", name, e);
                    }
                    info!(
                        "Volume {} references deleted node {}, scheduling claim cleanup in {:?}",
                        name, node_name, self.config.pvc_deletion_delay
                    );
                }
                Err(e) => {
                    warn!(
                        "Cannot check node {} of volume {}, scheduling a re-check in {:?}: {}",
                        node_name, name, self.config.pvc_deletion_delay, e
                    );
                }
            }

            self.queue.add_after(
                QueueItem::new(CleanupEntry::new(node_name, pv)),
                self.config.pvc_deletion_delay,
            );
            scheduled += 1;
        }
        Ok(scheduled)
    }

    /// Scan until one pass succeeds, backing off between failed passes.
    /// Gives up only when `shutdown` fires.
    async fn scan(&self, trigger: &str, shutdown: &CancellationToken) {
        let mut attempt = 0;
        loop {
            match self.start_cleanup_timers_if_needed().await {
                Ok(0) => debug!("No volumes to clean up after {}", trigger),
                Ok(n) => info!("Scheduled cleanup of {} volumes after {}", n, trigger),
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    error!(
                        "Error scanning volumes after {} (attempt {}), retrying in {:?}: {}",
                        trigger,
                        attempt + 1,
                        delay,
                        e
                    );
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            }
            return;
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Re-check an entry against the current cluster state and delete its
    /// claim if it is still orphaned.
    pub async fn sync(&self, entry: &CleanupEntry) -> Result<SyncOutcome> {
        let name = entry.volume_name();
        let Some(pv) = self.api.get_volume(name).await? else {
            return Ok(SyncOutcome::Cancelled(format!("volume {} no longer exists", name)));
        };

        let node_name = match node_attached_to_local_pv(&pv, &self.config.node_label_key) {
            Ok(node_name) => node_name,
            Err(e) => return Ok(SyncOutcome::Cancelled(e.to_string())),
        };
        if self.api.node_exists(&self.config.node_label_key, &node_name).await? {
            return Ok(SyncOutcome::Cancelled(format!("node {} exists again", node_name)));
        }

        let Some(claim_ref) = pv.spec.as_ref().and_then(|s| s.claim_ref.as_ref()) else {
            return Ok(SyncOutcome::Cancelled(format!("volume {} has no claim", name)));
        };
        let namespace = claim_ref.namespace.clone().unwrap_or_default();
        let claim_name = claim_ref.name.clone().unwrap_or_default();

        let Some(claim) = self.api.get_claim(&namespace, &claim_name).await? else {
            return Ok(SyncOutcome::Cancelled(format!("claim {}/{} no longer exists", namespace, claim_name)));
        };
        let bound_volume = claim.spec.as_ref().and_then(|s| s.volume_name.as_deref());
        if bound_volume != Some(name) {
            return Ok(SyncOutcome::Cancelled(format!(
                "claim {}/{} is bound to {:?}, not {}",
                namespace, claim_name, bound_volume, name
            )));
        }
        if claim.metadata.uid != claim_ref.uid {
            return Ok(SyncOutcome::Cancelled(format!(
                "claim {}/{} was recreated",
                namespace, claim_name
            )));
        }

        self.delete_claim(&pv, claim_ref, claim.metadata.uid.as_deref())
            .await?;
        Ok(SyncOutcome::ClaimDeleted {
            namespace,
            name: claim_name,
        })
    }

    async fn delete_claim(&self, pv: &PersistentVolume, claim_ref: &ObjectReference, uid: Option<&str>) -> Result<()> {
        let namespace = claim_ref.namespace.as_deref().unwrap_or_default();
        let name = claim_ref.name.as_deref().unwrap_or_default();
        info!(
            "Deleting claim {}/{} of volume {} on deleted node",
            namespace,
            name,
            volume::volume_name(pv)
        );

        let result = self.api.delete_claim(namespace, name, uid).await;
        if matches!(&result, Err(e) if e.is_not_found()) {
            warn!("Claim {}/{} no longer exists", namespace, name);
        }
        match ignore_not_found(result) {
            Ok(()) => {
                self.metrics.pvc_delete_total.inc();
                Ok(())
            }
            Err(e) => {
                self.metrics.pvc_delete_failed_total.inc();
                Err(e)
            }
        }
    }

    /// Delay before retrying `item`: the longer of its own backoff and the
    /// overall retry budget
    fn retry_delay(&self, item: &QueueItem) -> Duration {
        self.backoff.delay(item.attempt).max(self.bucket.reserve())
    }

    /// Sync one item, requeueing it on failure as the error asks
    pub async fn process_item(&self, item: QueueItem) {
        match self.sync(&item.entry).await {
            Ok(SyncOutcome::Cancelled(reason)) => {
                info!("Cleanup of volume {} cancelled: {}", item.entry.volume_name(), reason);
            }
            Ok(SyncOutcome::ClaimDeleted { namespace, name }) => {
                info!(
                    "Cleaned up claim {}/{} of volume {}",
                    namespace,
                    name,
                    item.entry.volume_name()
                );
            }
            Err(e) => {
                let delay = match e.action() {
                    ErrorAction::NoRequeue => {
                        warn!("Dropping cleanup of volume {}: {}", item.entry.volume_name(), e);
                        return;
                    }
                    ErrorAction::RequeueAfter(delay) => delay,
                    ErrorAction::RequeueWithBackoff => self.retry_delay(&item),
                };
                error!(
                    "Cleanup of volume {} failed (attempt {}), retrying in {:?}: {}",
                    item.entry.volume_name(),
                    item.attempt + 1,
                    delay,
                    e
                );
                self.queue.add_after(item.retry(), delay);
            }
        }
    }

    // =========================================================================
    // Run Loop
    // =========================================================================

    /// Run the dispatcher and workers and react to node events until
    /// `shutdown` fires.
    ///
    /// A single dispatcher drains the queue into a bounded channel that the
    /// workers share. A scan runs at startup, on every node deletion and on
    /// every watch relist. On shutdown the queue stops handing out work, the
    /// channel closes and the workers are joined after their current item.
    pub async fn run<S>(self: Arc<Self>, node_events: S, shutdown: CancellationToken)
    where
        S: Stream<Item = Result<NodeEvent>> + Send,
    {
        let workers = self.config.worker_threads.max(1);
        info!("Starting node cleanup controller with {} workers", workers);

        let (tx, rx) = mpsc::channel::<QueueItem>(workers);
        let dispatcher = tokio::spawn({
            let controller = self.clone();
            async move {
                while let Some(item) = controller.queue.get().await {
                    if tx.send(item).await.is_err() {
                        break;
                    }
                }
                debug!("Cleanup dispatcher stopped");
            }
        });

        let rx = Arc::new(Mutex::new(rx));
        let mut handles: Vec<_> = (0..workers)
            .map(|id| {
                let controller = self.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        match next {
                            Some(item) => controller.process_item(item).await,
                            None => break,
                        }
                    }
                    debug!("Cleanup worker {} stopped", id);
                })
            })
            .collect();
        handles.push(dispatcher);

        self.scan("startup", &shutdown).await;

        futures::pin_mut!(node_events);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = node_events.next() => match next {
                    Some(Ok(NodeEvent::Deleted(node))) => {
                        let node_name = node.metadata.name.unwrap_or_default();
                        self.scan(&format!("deletion of node {}", node_name), &shutdown).await;
                    }
                    Some(Ok(NodeEvent::Resynced(_))) => self.scan("node relist", &shutdown).await,
                    Some(Ok(NodeEvent::Applied(_))) => {}
                    Some(Err(e)) => warn!("Node watch error: {}", e),
                    None => {
                        warn!("Node watch stream ended");
                        break;
                    }
                },
            }
        }

        info!("Shutting down node cleanup controller");
        self.queue.shut_down();
        for handle in futures::future::join_all(handles).await {
            if let Err(e) = handle {
                error!("Cleanup task panicked: {}", e);
            }
        }
    }
}
