//! Local Volume Provisioner
//!
//! One binary, two roles:
//!
//! - `provisioner` runs on every node as a DaemonSet, publishing the
//!   disks under the configured host directories as PersistentVolumes.
//! - `node-cleanup` runs once per cluster and removes the claims and
//!   volumes left behind when a node is deleted.
//!
//! ```text
//! ┌──────────────────────────────┐        ┌──────────────────────────────┐
//! │   provisioner (per node)     │        │   node-cleanup (per cluster) │
//! │                              │        │                              │
//! │  PV watch ─► Populator       │        │  Node watch ─► Controller    │
//! │                 │            │        │                 │            │
//! │            VolumeCache       │        │          DelayingQueue       │
//! │                 │            │        │                 │            │
//! │  host dirs ─► Discoverer     │        │  timer ─► StaleVolumeDeleter │
//! └──────────────────────────────┘        └──────────────────────────────┘
//! ```

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use local_volume_provisioner::metrics::{NODE_CLEANUP_SUBSYSTEM, PROVISIONER_SUBSYSTEM};
use local_volume_provisioner::node::{fetch_node_with_retry, GET_NODE_ATTEMPTS, GET_NODE_INTERVAL};
use local_volume_provisioner::{
    CleanupController, DetachedCleanupTracker, DiscoveryContext, Error, KubeClusterApi,
    LinuxVolumeUtil, Metrics, NodeCleanupConfig, PendingPodReaper, ProcMounter, Provisioner, ProvisionerConfig, Readiness, Result, StaleVolumeDeleter, VolumeCache,
};

/// Component name recorded on events
const COMPONENT: &str = "local-volume-provisioner";

// =============================================================================
// CLI Arguments
// =============================================================================

/// Local Volume Provisioner - static PersistentVolumes for node-local disks
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Health server bind address
    #[arg(long, global = true, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, global = true, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover local volumes on this node and publish them
    Provisioner(ProvisionerArgs),
    /// Clean up claims and volumes of deleted nodes
    NodeCleanup(NodeCleanupArgs),
}

#[derive(ClapArgs, Debug)]
struct ProvisionerArgs {
    /// Provisioner configuration file
    #[arg(long, env = "PROVISIONER_CONFIG", default_value = "/etc/provisioner/config/config.yaml")]
    config: PathBuf,

    /// Name of the node this agent runs on
    #[arg(long, env = "MY_NODE_NAME")]
    node_name: Option<String>,

    /// Seconds between discovery passes
    #[arg(long, env = "DISCOVERY_PERIOD", default_value_t = 10)]
    discovery_period: u64,
}

#[derive(ClapArgs, Debug)]
struct NodeCleanupArgs {
    /// StorageClasses whose volumes may be cleaned up
    #[arg(long = "storageclass-names", env = "STORAGECLASS_NAMES", value_delimiter = ',', required = true)]
    storage_class_names: Vec<String>,

    /// Label identifying the node in PV node affinity
    #[arg(long, env = "NODE_LABEL_KEY", default_value = "kubernetes.io/hostname")]
    node_label_key: String,

    /// Seconds to wait after a node deletion before deleting its claims
    #[arg(long, env = "PVC_DELETION_DELAY", default_value_t = 60)]
    pvc_deletion_delay: u64,

    /// Seconds between stale volume scans
    #[arg(long, env = "STALE_PV_DISCOVERY_INTERVAL", default_value_t = 10)]
    stale_pv_discovery_interval: u64,

    /// Number of claim cleanup workers
    #[arg(long, env = "WORKER_THREADS", default_value_t = 10)]
    worker_threads: usize,

    /// Namespaces scanned for pods stuck on a missing claim
    #[arg(long, env = "PENDING_POD_NAMESPACES", value_delimiter = ',')]
    pending_pod_namespaces: Vec<String>,

    /// Claim name globs per StorageClass, as `class=glob`
    #[arg(long = "claim-name-pattern", env = "CLAIM_NAME_PATTERNS", value_delimiter = ',', value_parser = parse_claim_pattern)]
    claim_name_patterns: Vec<(String, String)>,
}

fn parse_claim_pattern(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(class, pattern)| (class.to_string(), pattern.to_string()))
        .ok_or_else(|| format!("expected class=glob, got {:?}", raw))
}

impl NodeCleanupArgs {
    fn into_config(self) -> NodeCleanupConfig {
        NodeCleanupConfig {
            storage_class_names: self.storage_class_names,
            node_label_key: self.node_label_key,
            pvc_deletion_delay: Duration::from_secs(self.pvc_deletion_delay),
            stale_pv_discovery_interval: Duration::from_secs(self.stale_pv_discovery_interval),
            worker_threads: self.worker_threads,
            pending_pod_namespaces: self.pending_pod_namespaces,
            claim_name_patterns: self.claim_name_patterns.into_iter().collect::<BTreeMap<_, _>>(),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!(
        "Starting {} v{}",
        local_volume_provisioner::NAME,
        local_volume_provisioner::VERSION
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    match args.command {
        Command::Provisioner(cmd) => {
            run_provisioner(cmd, &args.health_addr, &args.metrics_addr, shutdown).await
        }
        Command::NodeCleanup(cmd) => {
            run_node_cleanup(cmd, &args.health_addr, &args.metrics_addr, shutdown).await
        }
    }
}

async fn run_provisioner(
    cmd: ProvisionerArgs,
    health_addr: &str,
    metrics_addr: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    let node_name = cmd
        .node_name
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::NodeIdentity("MY_NODE_NAME is not set".into()))?;
    let config = ProvisionerConfig::load(&cmd.config)?;
    info!(
        "Loaded configuration for {} storage classes from {}",
        config.storage_class_map.len(),
        cmd.config.display()
    );

    let metrics = Metrics::new(PROVISIONER_SUBSYSTEM)?;
    let client = kube::Client::try_default().await?;
    let kube_api = KubeClusterApi::new(client, COMPONENT, Some(node_name.clone()), metrics.clone());
    let api = Arc::new(kube_api.clone());

    let node = fetch_node_with_retry(api.as_ref(), &node_name, GET_NODE_ATTEMPTS, GET_NODE_INTERVAL).await?;

    if config.use_job_for_cleaning {
        warn!("useJobForCleaning is set but no cleaner is attached to this agent; block devices are republished without waiting for a wipe");
    }

    let ctx = DiscoveryContext {
        cache: VolumeCache::new(),
        api,
        volume_util: Arc::new(LinuxVolumeUtil),
        mounter: Arc::new(ProcMounter::new()),
        cleanup: DetachedCleanupTracker::new(),
        metrics: metrics.clone(),
    };
    let provisioner = Arc::new(Provisioner::new(
        config,
        &node,
        ctx,
        Duration::from_secs(cmd.discovery_period),
    )?);

    spawn_servers(health_addr, metrics_addr, Some(provisioner.readiness()), metrics);

    provisioner.run(kube_api.volume_events(), shutdown).await;
    info!("Provisioner shutdown complete");
    Ok(())
}

async fn run_node_cleanup(
    cmd: NodeCleanupArgs,
    health_addr: &str,
    metrics_addr: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    let config = cmd.into_config();
    config.validate()?;

    let metrics = Metrics::new(NODE_CLEANUP_SUBSYSTEM)?;
    let client = kube::Client::try_default().await?;
    let kube_api = KubeClusterApi::new(client, COMPONENT, None, metrics.clone());
    let api = Arc::new(kube_api.clone());

    let mut deleter = StaleVolumeDeleter::new(
        api.clone(),
        config.storage_class_names.clone(),
        config.node_label_key.clone(),
        metrics.clone(),
    );
    if !config.pending_pod_namespaces.is_empty() {
        let reaper = PendingPodReaper::new(
            api.clone(),
            config.pending_pod_namespaces.clone(),
            &config.claim_name_patterns,
            metrics.clone(),
        )?;
        deleter = deleter.with_pending_pod_reaper(reaper);
    }
    let interval = config.stale_pv_discovery_interval;
    let controller = CleanupController::new(api, config, metrics.clone());

    spawn_servers(health_addr, metrics_addr, None, metrics);

    tokio::join!(
        controller.run(kube_api.node_events(), shutdown.clone()),
        deleter.run(interval, shutdown),
    );
    info!("Node cleanup shutdown complete");
    Ok(())
}

fn spawn_servers(
    health_addr: &str,
    metrics_addr: &str,
    readiness: Option<Arc<Readiness>>,
    metrics: Arc<Metrics>,
) {
    let health_addr = health_addr.to_string();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, readiness).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = metrics_addr.to_string();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!("Cannot listen for SIGTERM: {}", e);
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received interrupt, shutting down"),
        _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(directive("hyper=warn")?)
        .add_directive(directive("kube=info")?)
        .add_directive(directive("tower=warn")?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

fn directive(raw: &str) -> Result<Directive> {
    raw.parse()
        .map_err(|e| Error::Configuration(format!("Invalid log directive {}: {}", raw, e)))
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, readiness: Option<Arc<Readiness>>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let readiness = readiness.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let readiness = readiness.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" => text_response(StatusCode::OK, "ok"),
                        "/ready" => match readiness.as_ref().map(|r| r.check()) {
                            None | Some(Ok(())) => text_response(StatusCode::OK, "ok"),
                            Some(Err(e)) => {
                                text_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
                            }
                        },
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Internal(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: Arc<Metrics>) -> Result<()> {
    use hyper::header::CONTENT_TYPE;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok((content_type, body)) => {
                                let mut response = text_response(StatusCode::OK, body);
                                if let Ok(value) = content_type.parse() {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => {
                                text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                            }
                        },
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Internal(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
