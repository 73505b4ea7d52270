//! Pending-pod reaper

use crate::domain::ClusterApiRef;
use crate::error::{ignore_not_found, Result};
use crate::metrics::Metrics;
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const POD_PENDING: &str = "Pending";

/// Deletes Pending pods that wait on a managed claim which no longer exists
pub struct PendingPodReaper {
    api: ClusterApiRef,
    namespaces: Vec<String>,
    claim_patterns: Vec<glob::Pattern>,
    metrics: Arc<Metrics>,
}

impl PendingPodReaper {
    /// `claim_name_patterns` maps each managed StorageClass to a glob over
    /// the claim names its workloads generate.
    pub fn new(
        api: ClusterApiRef,
        namespaces: Vec<String>,
        claim_name_patterns: &BTreeMap<String, String>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let claim_patterns = claim_name_patterns
            .values()
            .map(|p| glob::Pattern::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            api,
            namespaces,
            claim_patterns,
            metrics,
        })
    }

    /// Scan the configured namespaces once. Returns the deleted pods as
    /// `namespace/name`.
    pub async fn reap(&self) -> Vec<String> {
        let mut deleted = Vec::new();
        for namespace in &self.namespaces {
            let pods = match self.api.list_pods(namespace).await {
                Ok(pods) => pods,
                Err(e) => {
                    error!("Error listing pods in namespace {}: {}", namespace, e);
                    continue;
                }
            };
            for pod in pods.iter().filter(|p| is_pending(p)) {
                let name = pod.metadata.name.as_deref().unwrap_or_default();
                match self.reap_pod(namespace, pod).await {
                    Ok(true) => deleted.push(format!("{}/{}", namespace, name)),
                    Ok(false) => {}
                    Err(e) => error!("Error reaping pod {}/{}: {}", namespace, name, e),
                }
            }
        }
        deleted
    }

    async fn reap_pod(&self, namespace: &str, pod: &Pod) -> Result<bool> {
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        let Some(claim) = self.missing_managed_claim(namespace, pod).await? else {
            return Ok(false);
        };

        info!(
            "Deleting pending pod {}/{} waiting on missing claim {}",
            namespace, name, claim
        );
        let result = self.api.delete_pod(namespace, name).await;
        if matches!(&result, Err(e) if e.is_not_found()) {
            warn!("Pod {}/{} no longer exists", namespace, name);
        }
        ignore_not_found(result)?;
        self.metrics.pending_pod_delete_total.inc();
        Ok(true)
    }

    /// First claim the pod references that is managed here and absent
    async fn missing_managed_claim(&self, namespace: &str, pod: &Pod) -> Result<Option<String>> {
        let claims = pod
            .spec
            .iter()
            .flat_map(|s| s.volumes.iter().flatten())
            .filter_map(|v| v.persistent_volume_claim.as_ref())
            .map(|c| c.claim_name.as_str());

        for claim in claims {
            if !self.claim_patterns.iter().any(|p| p.matches(claim)) {
                continue;
            }
            if self.api.get_claim(namespace, claim).await?.is_none() {
                return Ok(Some(claim.to_string()));
            }
            debug!("Claim {}/{} still exists", namespace, claim);
        }
        Ok(None)
    }
}

fn is_pending(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some(POD_PENDING)
}
