//! Per-Node Provisioner Agent
//!
//! Wires the cache, populator and discoverer together and drives them:
//!
//! 1. the populator consumes the volume watch in the background
//! 2. discovery waits for the first full listing of volumes
//! 3. discovery then runs every `discovery_period`, one pass at a time
//! 4. after the first clean pass the not-ready taint is removed
//!
//! The cache is also relisted every resync period, spread per node between
//! one and two times the configured minimum.

use crate::config::ProvisionerConfig;
use crate::discovery::{Discoverer, DiscoveryContext, Readiness};
use crate::domain::ClusterApiRef;
use crate::error::Result;
use crate::node::TaintRemover;
use crate::populator::{Populator, VolumeEvent};
use crate::volume::fnv1a32;
use futures::Stream;
use k8s_openapi::api::core::v1::Node;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// The discovery agent of one node
pub struct Provisioner {
    api: ClusterApiRef,
    discoverer: Discoverer,
    populator: Arc<Populator>,
    taint_remover: Option<TaintRemover>,
    discovery_period: Duration,
    resync_period: Duration,
}

impl Provisioner {
    pub fn new(
        config: ProvisionerConfig,
        node: &Node,
        ctx: DiscoveryContext,
        discovery_period: Duration,
    ) -> Result<Self> {
        let api = ctx.api.clone();
        let cache = ctx.cache.clone();
        let use_node_name_only = config.use_node_name_only;
        let min_resync = config.min_resync_period();
        let taint = config
            .remove_node_not_ready_taint
            .then(|| config.provisioner_not_ready_node_taint_key.clone());

        let discoverer = Discoverer::new(config, node, ctx)?;
        let node_name = node.metadata.name.clone().unwrap_or_default();
        let populator = Populator::new(
            cache,
            discoverer.provisioner_name().to_string(),
            use_node_name_only,
        );
        let taint_remover = taint.map(|key| TaintRemover::new(api.clone(), node_name.clone(), key));

        Ok(Self {
            api,
            discoverer,
            populator,
            taint_remover,
            discovery_period,
            resync_period: spread_resync_period(min_resync, &node_name),
        })
    }

    pub fn readiness(&self) -> Arc<Readiness> {
        self.discoverer.readiness()
    }

    /// One discovery pass; removes the not-ready taint after the first
    /// pass without failures. Returns whether the pass was clean.
    pub async fn run_pass(&self) -> bool {
        let failures = self.discoverer.discover_local_volumes().await;
        if !failures.is_empty() {
            return false;
        }
        if let Some(remover) = &self.taint_remover {
            remover.remove_with_backoff().await;
        }
        true
    }

    /// Feed a full relist of volumes to the populator
    pub async fn resync(&self) -> Result<()> {
        let volumes = self.api.list_volumes().await?;
        debug!("Resyncing cache with {} volumes", volumes.len());
        self.populator.handle(VolumeEvent::Resynced(volumes));
        Ok(())
    }

    /// Run until `shutdown` fires
    pub async fn run<S>(self: Arc<Self>, volume_events: S, shutdown: CancellationToken)
    where
        S: Stream<Item = Result<VolumeEvent>> + Send + 'static,
    {
        info!(
            "Starting provisioner {}, discovery every {:?}, resync every {:?}",
            self.discoverer.provisioner_name(),
            self.discovery_period,
            self.resync_period
        );
        let populator = tokio::spawn(self.populator.clone().run(volume_events, shutdown.clone()));

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = self.populator.wait_synced() => {
                info!("Volume cache synced");
                let mut next_resync = Instant::now() + self.resync_period;
                loop {
                    self.run_pass().await;
                    if Instant::now() >= next_resync {
                        if let Err(e) = self.resync().await {
                            error!("Error resyncing volume cache: {}", e);
                        }
                        next_resync = Instant::now() + self.resync_period;
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.discovery_period) => {}
                    }
                }
            }
        }

        if let Err(e) = populator.await {
            error!("Populator task failed: {}", e);
        }
        info!("Provisioner stopped");
    }
}

/// A period in `[min, 2 * min)` chosen from the node name, so agents on
/// different nodes do not relist at the same moment
fn spread_resync_period(min: Duration, node_name: &str) -> Duration {
    let fraction = f64::from(fnv1a32(&[node_name]) % 1000) / 1000.0;
    min.mul_f64(1.0 + fraction)
}
