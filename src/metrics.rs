//! Prometheus Metrics
//!
//! Each process owns one [`Metrics`] value holding its own registry, so
//! the provisioner and the node cleanup controller expose separate metric
//! families and tests never collide on a global registry.

use crate::error::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Instant;

/// Subsystem of the per-node agent metrics
pub const PROVISIONER_SUBSYSTEM: &str = "local_volume_provisioner";

/// Subsystem of the node cleanup controller metrics
pub const NODE_CLEANUP_SUBSYSTEM: &str = "local_volume_node_cleanup";

/// Metric families of the provisioner and cleanup controller
pub struct Metrics {
    registry: Registry,

    // Discovery
    pub discovery_total: IntCounterVec,
    pub discovery_duration_seconds: HistogramVec,
    pub capacity_bytes: IntGaugeVec,

    // API server traffic
    pub apiserver_requests_total: IntCounterVec,
    pub apiserver_requests_failed_total: IntCounterVec,
    pub apiserver_request_duration_seconds: HistogramVec,

    // Node cleanup
    pub pv_delete_failed_total: IntCounterVec,
    pub pvc_delete_total: IntCounter,
    pub pvc_delete_failed_total: IntCounter,
    pub pending_pod_delete_total: IntCounter,
}

impl Metrics {
    /// Create and register every metric family
    pub fn new(subsystem: &str) -> Result<Arc<Self>> {
        let registry = Registry::new();

        let discovery_total = IntCounterVec::new(
            Opts::new(
                "persistentvolume_discovery_total",
                "Total number of persistent volumes discovered. Broken down by volume mode.",
            )
            .subsystem(subsystem),
            &["mode"],
        )?;
        let discovery_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "persistentvolume_discovery_duration_seconds",
                "Time taken to discover a persistent volume. Broken down by volume mode.",
            )
            .subsystem(subsystem),
            &["mode"],
        )?;
        let capacity_bytes = IntGaugeVec::new(
            Opts::new(
                "persistentvolume_capacity_bytes",
                "Total capacity of volumes created by the last discovery pass. Broken down by volume mode.",
            )
            .subsystem(subsystem),
            &["mode"],
        )?;
        let apiserver_requests_total = IntCounterVec::new(
            Opts::new(
                "apiserver_requests_total",
                "Total number of apiserver requests. Broken down by method.",
            )
            .subsystem(subsystem),
            &["method"],
        )?;
        let apiserver_requests_failed_total = IntCounterVec::new(
            Opts::new(
                "apiserver_requests_failed_total",
                "Total number of failed apiserver requests. Broken down by method.",
            )
            .subsystem(subsystem),
            &["method"],
        )?;
        let apiserver_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "apiserver_request_duration_seconds",
                "Latency of apiserver requests. Broken down by method.",
            )
            .subsystem(subsystem),
            &["method"],
        )?;
        let pv_delete_failed_total = IntCounterVec::new(
            Opts::new(
                "persistentvolume_delete_failed_total",
                "Total number of persistent volume delete failed attempts. Broken down by persistent volume status and reclaim policy.",
            )
            .subsystem(subsystem),
            &["status", "reclaim"],
        )?;
        let pvc_delete_total = IntCounter::with_opts(
            Opts::new(
                "persistentvolumeclaim_delete_total",
                "Total number of persistent volume claims deleted.",
            )
            .subsystem(subsystem),
        )?;
        let pvc_delete_failed_total = IntCounter::with_opts(
            Opts::new(
                "persistentvolumeclaim_delete_failed_total",
                "Total number of persistent volume claim delete failed attempts.",
            )
            .subsystem(subsystem),
        )?;
        let pending_pod_delete_total = IntCounter::with_opts(
            Opts::new(
                "pending_pod_delete_total",
                "Total number of pending pods deleted because their claim was missing.",
            )
            .subsystem(subsystem),
        )?;

        registry.register(Box::new(discovery_total.clone()))?;
        registry.register(Box::new(discovery_duration_seconds.clone()))?;
        registry.register(Box::new(capacity_bytes.clone()))?;
        registry.register(Box::new(apiserver_requests_total.clone()))?;
        registry.register(Box::new(apiserver_requests_failed_total.clone()))?;
        registry.register(Box::new(apiserver_request_duration_seconds.clone()))?;
        registry.register(Box::new(pv_delete_failed_total.clone()))?;
        registry.register(Box::new(pvc_delete_total.clone()))?;
        registry.register(Box::new(pvc_delete_failed_total.clone()))?;
        registry.register(Box::new(pending_pod_delete_total.clone()))?;

        Ok(Arc::new(Self {
            registry,
            discovery_total,
            discovery_duration_seconds,
            capacity_bytes,
            apiserver_requests_total,
            apiserver_requests_failed_total,
            apiserver_request_duration_seconds,
            pv_delete_failed_total,
            pvc_delete_total,
            pvc_delete_failed_total,
            pending_pod_delete_total,
        }))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record one API round trip
    pub fn observe_request(&self, method: &str, started: Instant, ok: bool) {
        self.apiserver_requests_total
            .with_label_values(&[method])
            .inc();
        self.apiserver_request_duration_seconds
            .with_label_values(&[method])
            .observe(started.elapsed().as_secs_f64());
        if !ok {
            self.apiserver_requests_failed_total
                .with_label_values(&[method])
                .inc();
        }
    }

    /// Render the registry in the Prometheus text format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}
