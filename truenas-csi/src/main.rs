//! TrueNAS CSI Driver
//!
//! Serves the CSI gRPC services on a unix socket. The controller role talks
//! to the TrueNAS REST API; the node role mounts and logs in locally.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tokio::net::UnixListener;
use tokio::signal;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use truenas_client::{Appliance, ClientConfig, TrueNasClient};
use truenas_csi::connector::ConnectorStore;
use truenas_csi::csi::controller_server::ControllerServer;
use truenas_csi::csi::identity_server::IdentityServer;
use truenas_csi::csi::node_server::NodeServer;
use truenas_csi::identity::DRIVER_VERSION;
use truenas_csi::metrics;
use truenas_csi::platform::{IscsiAdm, IscsiSession, LinuxMounter, Mounter};
use truenas_csi::{
    BackendKind, ControllerService, DriverConfig, IdentityService, NodeService,
    NodeSessionManager, Provisioner,
};

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "truenas-csi")]
#[command(about = "TrueNAS NFS/iSCSI CSI Driver for Kubernetes")]
struct Args {
    /// Print the driver name and version, then exit
    #[arg(long)]
    version: bool,

    /// Backend served by this process (nfs or iscsi)
    #[arg(long = "type", value_name = "TYPE", required_unless_present = "version")]
    kind: Option<BackendKind>,

    /// CSI endpoint (unix socket URL); defaults per backend
    #[arg(long, env = "CSI_ENDPOINT")]
    endpoint: Option<String>,

    /// TrueNAS API base URL, ending with api/v2.0
    #[arg(long, env = "TRUENAS_URL")]
    url: Option<String>,

    /// TrueNAS API key (controller only)
    #[arg(long, env = "TRUENAS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Run in controller mode, otherwise as a node plugin
    #[arg(long, default_value = "false")]
    controller: bool,

    /// Node ID for this CSI node (defaults to the hostname)
    #[arg(long, env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// Parent dataset for NFS volumes
    #[arg(long, default_value = "")]
    nfs_storage_path: String,

    /// Parent dataset for iSCSI zvols
    #[arg(long, default_value = "")]
    iscsi_storage_path: String,

    /// TrueNAS iSCSI portal id targets are bound to
    #[arg(long, default_value = "1")]
    portal_id: i64,

    /// NFS server address handed to nodes; defaults to the API URL host
    #[arg(long)]
    nfs_server: Option<String>,

    /// Skip TLS certificate verification for the TrueNAS API
    #[arg(long, default_value = "false")]
    insecure_skip_tls_verify: bool,

    /// Directory for iSCSI connector files; defaults next to the socket
    #[arg(long)]
    iscsi_config_dir: Option<PathBuf>,

    /// iscsiadm binary (may be a chroot wrapper)
    #[arg(long, env = "ISCSIADM_PATH", default_value = "iscsiadm")]
    iscsiadm: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(
        long,
        default_value = "info",
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

/// Filesystem path of a `unix://` endpoint.
fn unix_socket_path(endpoint: &str) -> Result<PathBuf, String> {
    let parsed =
        url::Url::parse(endpoint).map_err(|e| format!("invalid endpoint '{}': {}", endpoint, e))?;
    if parsed.scheme() != "unix" {
        return Err(format!(
            "endpoint '{}' must use the unix scheme, got '{}'",
            endpoint,
            parsed.scheme()
        ));
    }
    let path = parsed.path();
    if path.is_empty() || path == "/" {
        return Err(format!("endpoint '{}' has no socket path", endpoint));
    }
    Ok(PathBuf::from(path))
}

fn nfs_host(args: &Args) -> String {
    args.nfs_server.clone().unwrap_or_else(|| {
        args.url
            .as_deref()
            .and_then(|u| url::Url::parse(u).ok())
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    })
}

async fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            info!(path = %path.display(), "Removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn build_controller(
    args: &Args,
    config: Arc<DriverConfig>,
) -> Result<ControllerService, Box<dyn std::error::Error>> {
    let url = args
        .url
        .as_deref()
        .ok_or("--url is required in controller mode")?;
    let token = args
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or("TRUENAS_TOKEN must be set in controller mode")?;

    if config.storage_path().is_empty() {
        return Err(format!("--{}-storage-path is required in controller mode", config.kind).into());
    }

    let mut client_config = ClientConfig::new(url, token);
    client_config.insecure_skip_tls_verify = args.insecure_skip_tls_verify;
    if client_config.insecure_skip_tls_verify {
        warn!("TLS certificate verification is disabled for the TrueNAS API");
    }
    let client = TrueNasClient::new(client_config)?;
    info!(url = %client.base_url(), "TrueNAS client configured");

    let appliance: Arc<dyn Appliance> = Arc::new(client);
    Ok(ControllerService::new(Provisioner::new(appliance, config)))
}

fn build_node(config: &DriverConfig, iscsiadm: PathBuf) -> NodeService {
    let mounter: Arc<dyn Mounter> = Arc::new(LinuxMounter::new());
    let iscsi: Arc<dyn IscsiSession> = Arc::new(IscsiAdm::new(iscsiadm));
    let store = ConnectorStore::new(config.iscsi_config_dir.clone());
    let sessions = NodeSessionManager::new(mounter, iscsi, store);
    NodeService::new(Arc::new(sessions), config.node_id.clone())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.version {
        match args.kind {
            Some(kind) => println!("{} - {}", kind.driver_name(), DRIVER_VERSION),
            None => println!("{} - {}", env!("CARGO_PKG_NAME"), DRIVER_VERSION),
        }
        return Ok(());
    }
    let kind = args.kind.ok_or("--type is required")?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))?;
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Initialize Prometheus metrics endpoint if configured
    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    let node_id = match &args.node_id {
        Some(id) => id.clone(),
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    let endpoint = args
        .endpoint
        .clone()
        .unwrap_or_else(|| kind.default_endpoint());
    let socket_path = unix_socket_path(&endpoint)?;
    let socket_dir = socket_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));

    let config = Arc::new(DriverConfig {
        kind,
        nfs_storage_path: args.nfs_storage_path.clone(),
        iscsi_storage_path: args.iscsi_storage_path.clone(),
        portal_id: args.portal_id,
        nfs_host: nfs_host(&args),
        iscsi_config_dir: args
            .iscsi_config_dir
            .clone()
            .unwrap_or_else(|| socket_dir.join("iscsi_config")),
        node_id,
    });

    info!(
        driver_name = %kind.driver_name(),
        version = %DRIVER_VERSION,
        endpoint = %endpoint,
        node_id = %config.node_id,
        controller_mode = %args.controller,
        "Starting TrueNAS CSI Driver"
    );

    let (controller, node) = if args.controller {
        (Some(build_controller(&args, config.clone())?), None)
    } else {
        (None, Some(build_node(&config, args.iscsiadm.clone())))
    };

    tokio::fs::create_dir_all(&socket_dir).await?;
    remove_stale_socket(&socket_path).await?;
    let listener = UnixListener::bind(&socket_path)?;
    let incoming = UnixListenerStream::new(listener);

    let ready = Arc::new(AtomicBool::new(false));
    let identity = IdentityService::new(kind, ready.clone());

    info!(path = %socket_path.display(), "gRPC server listening");
    ready.store(true, Ordering::SeqCst);

    let shutdown_ready = ready.clone();
    Server::builder()
        .add_service(IdentityServer::new(identity))
        .add_optional_service(controller.map(ControllerServer::new))
        .add_optional_service(node.map(NodeServer::new))
        .serve_with_incoming_shutdown(incoming, async move {
            shutdown_signal().await;
            shutdown_ready.store(false, Ordering::SeqCst);
            info!("Shutdown signal received, draining connections...");
        })
        .await?;

    if let Err(e) = remove_stale_socket(&socket_path).await {
        warn!(error = %e, "Failed to remove socket on exit");
    }
    info!("TrueNAS CSI Driver shutdown complete");
    Ok(())
}

async fn recv_or_pending(sig: Option<&mut signal::unix::Signal>) {
    match sig {
        Some(sig) => {
            sig.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Wait for SIGTERM, SIGINT or SIGHUP.
async fn shutdown_signal() {
    use signal::unix::{SignalKind, signal};

    // Install signal handlers, logging errors but continuing with available handlers
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGINT handler: {}", e);
            None
        }
    };

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGHUP handler: {}", e);
            None
        }
    };

    tokio::select! {
        _ = recv_or_pending(sigterm.as_mut()) => {
            info!("Received SIGTERM");
        }
        _ = recv_or_pending(sigint.as_mut()) => {
            info!("Received SIGINT");
        }
        _ = recv_or_pending(sighup.as_mut()) => {
            info!("Received SIGHUP, shutting down");
        }
    }
}
