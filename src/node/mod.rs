//! Node Helpers
//!
//! Startup lookup of the agent's own Node and removal of the taint that
//! keeps workloads off a node until its local volumes are published.

use crate::domain::{ClusterApi, ClusterApiRef};
use crate::error::{Error, Result};
use backoff::ExponentialBackoffBuilder;
use k8s_openapi::api::core::v1::Node;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

/// Attempts made to fetch the Node at startup
pub const GET_NODE_ATTEMPTS: u32 = 3;

/// Pause between startup Node fetches
pub const GET_NODE_INTERVAL: Duration = Duration::from_secs(1);

/// Attempts made to remove the not-ready taint
pub const REMOVE_TAINT_ATTEMPTS: u32 = 3;

/// Base pause between taint removal attempts
pub const REMOVE_TAINT_RETRY_PERIOD: Duration = Duration::from_secs(5);

/// Run `operation` up to `attempts` times, pausing per `policy` in between
async fn retry_bounded<T, F, Fut>(
    policy: backoff::ExponentialBackoff,
    attempts: u32,
    what: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let tried = AtomicU32::new(0);
    let tried = &tried;
    backoff::future::retry(policy, move || {
        let fut = operation();
        async move {
            let attempt = tried.fetch_add(1, Ordering::SeqCst) + 1;
            fut.await.map_err(|e| {
                if attempt >= attempts {
                    backoff::Error::permanent(e)
                } else {
                    warn!("{} failed (attempt {}/{}): {}", what, attempt, attempts, e);
                    backoff::Error::transient(e)
                }
            })
        }
    })
    .await
}

/// Fetch a Node, retrying a few times before giving up
pub async fn fetch_node_with_retry(
    api: &dyn ClusterApi,
    name: &str,
    attempts: u32,
    interval: Duration,
) -> Result<Node> {
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(interval)
        .with_multiplier(1.0)
        .with_randomization_factor(0.0)
        .with_max_elapsed_time(None)
        .build();

    retry_bounded(policy, attempts, "Fetching node", move || async move {
        api.get_node(name).await?.ok_or_else(|| Error::ResourceNotFound {
            kind: "Node".into(),
            name: name.to_string(),
        })
    })
    .await
    .map_err(|e| Error::NodeIdentity(format!("could not get node {}: {}", name, e)))
}

// =============================================================================
// Taint Remover
// =============================================================================

/// Removes the provisioner-not-ready taint from this agent's Node once
pub struct TaintRemover {
    api: ClusterApiRef,
    node_name: String,
    taint_key: String,
    removed: AtomicBool,
}

impl TaintRemover {
    pub fn new(api: ClusterApiRef, node_name: impl Into<String>, taint_key: impl Into<String>) -> Self {
        Self {
            api,
            node_name: node_name.into(),
            taint_key: taint_key.into(),
            removed: AtomicBool::new(false),
        }
    }

    pub fn should_remove(&self) -> bool {
        !self.removed.load(Ordering::Acquire)
    }

    /// Drop the taint from the Node if it is still present
    pub async fn remove_taint(&self) -> Result<()> {
        if !self.should_remove() {
            return Ok(());
        }

        let node = self
            .api
            .get_node(&self.node_name)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "Node".into(),
                name: self.node_name.clone(),
            })?;

        let taints = node.spec.and_then(|s| s.taints).unwrap_or_default();
        let (matching, remaining): (Vec<_>, Vec<_>) =
            taints.into_iter().partition(|t| t.key == self.taint_key);

        if matching.is_empty() {
            info!("Taint {} not found on node {}", self.taint_key, self.node_name);
        } else {
            self.api.set_node_taints(&self.node_name, remaining).await?;
            info!("Removed taint {} from node {}", self.taint_key, self.node_name);
        }
        self.removed.store(true, Ordering::Release);
        Ok(())
    }

    /// Remove the taint, retrying with randomized backoff
    pub async fn remove_with_backoff(&self) {
        if !self.should_remove() {
            return;
        }
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(REMOVE_TAINT_RETRY_PERIOD)
            .with_randomization_factor(0.5)
            .with_multiplier(1.0)
            .with_max_elapsed_time(None)
            .build();

        if let Err(e) = retry_bounded(policy, REMOVE_TAINT_ATTEMPTS, "Removing node taint", move || {
            self.remove_taint()
        })
        .await
        {
            error!(
                "Failed to remove taint {} from node {} after {} attempts: {}",
                self.taint_key, self.node_name, REMOVE_TAINT_ATTEMPTS, e
            );
        }
    }
}
