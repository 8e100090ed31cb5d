//! hostdeck agent
//!
//! Runs on each GPU host and manages app lifecycle: allocates ports and GPU
//! memory, builds and starts apps, keeps the reverse proxy in sync and
//! supervises running workloads.
//!
//! ## Startup
//!
//! config -> state store -> allocator, proxy, runtime, reporter -> recovery
//! -> GPU refresh and heartbeat loops -> API
//!
//! On shutdown the agent stops serving and cancels its background tasks but
//! leaves workloads running so the next start can adopt them.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hostdeck_agent::api::create_router;
use hostdeck_agent::backoff::BackoffPolicy;
use hostdeck_agent::client::ControlPlaneClient;
use hostdeck_agent::config::Config;
use hostdeck_agent::heartbeat;
use hostdeck_agent::manager::{AppManager, ManagerSettings};
use hostdeck_agent::proxy::{CommandReloader, ProxyConfigurator, ProxySettings};
use hostdeck_agent::reporter::StatusReporter;
use hostdeck_agent::resources::{
    run_gpu_refresh_loop, BindProbe, CommandGpuProbe, GpuPool, PortPool, ResourcePool,
};
use hostdeck_agent::runtime::HostRuntime;
use hostdeck_agent::state::StateStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so the log level fallback is known
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        agent_id = %config.agent_id,
        listen_addr = %config.listen_addr,
        control_plane_url = %config.control_plane_url,
        data_dir = %config.data_dir.display(),
        candidate_ports = config.candidate_ports.len(),
        "Starting hostdeck agent"
    );

    tokio::fs::create_dir_all(config.logs_dir())
        .await
        .with_context(|| format!("Failed to create {}", config.logs_dir().display()))?;

    let store = StateStore::open(config.state_db_path())
        .with_context(|| format!("Failed to open {}", config.state_db_path().display()))?;

    // Allocator
    let gpus = Arc::new(GpuPool::new(Arc::new(CommandGpuProbe::new(
        &config.gpu_query_cmd,
    )?)));
    if let Err(e) = gpus.refresh().await {
        warn!(error = %e, "Initial GPU query failed, starting without GPUs");
    }
    let ports = PortPool::new(config.candidate_ports.clone(), Arc::new(BindProbe));
    let resources = Arc::new(ResourcePool::new(ports, Arc::clone(&gpus)));

    // Proxy
    let proxy = Arc::new(ProxyConfigurator::new(
        ProxySettings {
            routes_path: config.routes_path(),
            config_path: config.proxy_config_path(),
            link_path: Some(config.proxy_link_path.clone()),
            listen_port: config.proxy_listen_port,
        },
        Arc::new(CommandReloader::new(&config.proxy_reload_cmd)?),
    ));

    // Control plane
    let client = Arc::new(ControlPlaneClient::new(&config)?);
    let (reporter, reporter_handle) =
        StatusReporter::spawn(Arc::clone(&client), BackoffPolicy::default());

    let manager = AppManager::new(
        resources,
        proxy,
        Arc::new(HostRuntime::new(config.docker.clone())),
        store,
        reporter,
        ManagerSettings::from_config(&config),
    );

    // Recovery must finish before the API is served
    let report = manager.recover().await.context("Recovery failed")?;
    info!(
        adopted = report.adopted.len(),
        dropped = report.dropped.len(),
        interrupted = report.interrupted.len(),
        "Recovered app state"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gpu_handle = tokio::spawn(run_gpu_refresh_loop(
        Arc::clone(&gpus),
        config.gpu_refresh_interval,
        shutdown_rx.clone(),
    ));

    let heartbeat_handle = tokio::spawn(heartbeat::run_heartbeat_loop(
        Arc::clone(&client),
        Arc::clone(&manager),
        config.heartbeat_interval,
        shutdown_rx.clone(),
    ));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Agent API listening");

    let serve = axum::serve(listener, create_router(Arc::clone(&manager))).with_graceful_shutdown(
        async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
        },
    );
    if let Err(e) = serve.await {
        error!(error = %e, "API server error");
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);
    manager.shutdown();

    for (name, handle) in [("gpu refresh", gpu_handle), ("heartbeat", heartbeat_handle)] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Background task panicked");
        }
    }

    // The manager holds the last reporter; dropping it lets the worker drain
    drop(manager);
    if tokio::time::timeout(std::time::Duration::from_secs(2), reporter_handle)
        .await
        .is_err()
    {
        warn!("Status reporter did not drain before shutdown");
    }

    info!("Agent shutdown complete");
    Ok(())
}
