//! Pattern Server Binary
//!
//! One node of the pattern-serving cluster: joins the membership, follows
//! the metadata version and answers the `ps` RPC service for the keys it owns.

use patternserve::api::{self, PatternService};
use patternserve::cluster::{NodeIdentity, PartitionScheme, Supervisor, SupervisorConfig};
use patternserve::config::{ComponentFactory, CoordinatorKind, Environment, ProjectSelection, ServerConfig};
use patternserve::metadata::CatalogSource;
use patternserve::telemetry::{Telemetry, TelemetryConfig};
use patternserve::{CloudProvider, Error};

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Pattern Server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Deployment environment (development, staging, production)
    #[arg(long = "env", env = "PS_ENV", default_value = "development")]
    environment: Environment,

    /// Address peers use to reach this node
    #[arg(long, env = "PS_IP", default_value = "127.0.0.1")]
    ip: String,

    /// RPC port
    #[arg(long, env = "PS_RPC_PORT", default_value = "8100")]
    rpc_port: u16,

    /// Status HTTP port
    #[arg(long, env = "PS_HTTP_PORT", default_value = "8101")]
    http_port: u16,

    /// Coordination backend (memory, object-store)
    #[arg(long, env = "PS_COORDINATOR", default_value = "memory")]
    coordinator: CoordinatorKind,

    /// Membership lease TTL in seconds
    #[arg(long, env = "PS_COORDINATOR_TTL_SECS", default_value = "10")]
    coordinator_ttl_secs: u64,

    /// Disk tier directory
    #[arg(long, env = "PS_DISK_DIR", default_value = "/tmp/patternserve")]
    disk_dir: PathBuf,

    /// Cloud provider (memory, local, aws, gcp)
    #[arg(long, env = "CLOUD_PROVIDER", default_value = "local")]
    cloud_provider: CloudProvider,

    /// Primary bucket (a directory for the local provider)
    #[arg(long, env = "STORAGE_BUCKET", default_value = "/tmp/patternserve-cloud")]
    bucket: String,

    /// Secondary bucket for the projects in --models-bucket-projects
    #[arg(long, env = "PS_MODELS_BUCKET")]
    models_bucket: Option<String>,

    /// Projects served from the models bucket ("*" or a comma list)
    #[arg(long, env = "PS_MODELS_BUCKET_PROJECTS")]
    models_bucket_projects: Option<ProjectSelection>,

    /// Projects to load metadata for ("*" or a comma list)
    #[arg(long, env = "PS_PROJECT_IDS", default_value = "*")]
    project_ids: ProjectSelection,

    /// Pattern chunks held in memory
    #[arg(long, env = "PS_CHUNK_CACHE_SIZE", default_value = "5")]
    chunk_cache_size: u64,

    /// Event info records held in memory
    #[arg(long, env = "PS_EVENT_INFO_CACHE_SIZE", default_value = "10")]
    event_info_cache_size: u64,

    /// Key partitioning (project, project-model)
    #[arg(long, env = "PS_PARTITION_SCHEME", default_value = "project")]
    partition_scheme: PartitionScheme,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, Error> {
        let config = ServerConfig {
            environment: self.environment,
            ip: self.ip,
            rpc_port: self.rpc_port,
            http_port: self.http_port,
            coordinator: self.coordinator,
            coordinator_ttl: Duration::from_secs(self.coordinator_ttl_secs),
            disk_dir: self.disk_dir,
            cloud_provider: self.cloud_provider,
            bucket: self.bucket,
            models_bucket: self.models_bucket.filter(|b| !b.trim().is_empty()),
            models_bucket_projects: self
                .models_bucket_projects
                .unwrap_or_else(ProjectSelection::none),
            project_ids: self.project_ids,
            chunk_cache_size: self.chunk_cache_size,
            event_info_cache_size: self.event_info_cache_size,
            partition_scheme: self.partition_scheme,
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let log_level = args.log_level.clone();
    let config = args.into_config()?;
    let identity = NodeIdentity::new(config.ip.clone(), config.rpc_port);

    let telemetry_config = TelemetryConfig::from_env(
        "patternserve",
        &identity.to_string(),
        config.environment.as_str(),
    )?;
    let _telemetry = Telemetry::init(telemetry_config, &log_level)?;

    info!(
        node = %identity,
        environment = %config.environment,
        coordinator = ?config.coordinator,
        cloud_provider = %config.cloud_provider,
        bucket = %config.bucket,
        partition_scheme = %config.partition_scheme,
        "Starting pattern server"
    );

    let cloud = ComponentFactory::create_cloud_routing(&config)?;
    let membership = ComponentFactory::create_membership(&config, &cloud)?;
    let catalog = CatalogSource::new(cloud.primary(), config.project_ids.clone());
    let store = Arc::new(ComponentFactory::create_pattern_store(&config, cloud)?);

    let supervisor_config = SupervisorConfig {
        lease_ttl: config.coordinator_ttl,
        scheme: config.partition_scheme,
        ..Default::default()
    };
    let supervisor = Supervisor::start(identity, membership, catalog, supervisor_config)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to join cluster");
            e
        })?;

    let state = supervisor.state();
    let service = Arc::new(PatternService::new(store.clone(), state.clone()));
    let rpc_router = api::build_rpc_router(service);
    let status_router = api::build_status_router(state, store);

    let rpc_addr = SocketAddr::from(([0, 0, 0, 0], config.rpc_port));
    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let rpc_listener = TcpListener::bind(rpc_addr).await?;
    let http_listener = TcpListener::bind(http_addr).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let rpc_shutdown = shutdown_rx.clone();
    let http_shutdown = shutdown_rx.clone();
    let supervisor_shutdown = shutdown_rx;

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = signal_tx.send(true);
    });

    info!(
        rpc_port = config.rpc_port,
        http_port = config.http_port,
        chunk_cache_size = config.chunk_cache_size,
        event_info_cache_size = config.event_info_cache_size,
        "Pattern server ready"
    );

    let rpc_server = async move {
        axum::serve(rpc_listener, rpc_router)
            .with_graceful_shutdown(wait_for_shutdown(rpc_shutdown))
            .await
            .map_err(|e| Error::Internal(format!("RPC server error: {e}")))
    };
    let http_server = async move {
        axum::serve(http_listener, status_router)
            .with_graceful_shutdown(wait_for_shutdown(http_shutdown))
            .await
            .map_err(|e| Error::Internal(format!("HTTP server error: {e}")))
    };
    let supervisor_loop = async move {
        let result = supervisor.run(supervisor_shutdown).await;
        if let Err(e) = &result {
            error!(error = %e, "Cluster supervisor stopped, shutting down");
            let _ = shutdown_tx.send(true);
        }
        result
    };
    tokio::try_join!(rpc_server, http_server, supervisor_loop)?;

    info!("Pattern server shutting down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    if *shutdown.borrow() {
        return;
    }
    let _ = shutdown.changed().await;
}
