//! podpool controller
//!
//! Provisions build-agent pods under a per-pool admission ceiling and keeps
//! the scheduler's agent list converged with the pods that actually exist.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use podpool_controller::{
    api,
    config::{EnvSnapshot, Settings},
    state::AppState,
    AdmissionController, HttpSchedulerClient, InstanceRegistry, KubernetesPlatform, MockPlatform,
    Platform, Provisioner, Reconciler, ReconcilerConfig,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PlatformKind {
    /// Talk to the Kubernetes API.
    Kubernetes,
    /// Keep pods in memory. For local development only.
    Mock,
}

#[derive(Debug, Parser)]
#[command(name = "podpool-controller", version, about)]
struct Args {
    /// Settings file. Without one, settings are bootstrapped from the pod environment.
    #[arg(long, env = "PODPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Address for the HTTP API.
    #[arg(long, env = "PODPOOL_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    #[arg(long, value_enum, default_value_t = PlatformKind::Kubernetes)]
    platform: PlatformKind,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, env = "PODPOOL_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting podpool controller");

    let settings = Settings::load(args.config.as_deref(), &EnvSnapshot::capture())
        .context("failed to load settings")?;
    info!(
        server_url = %settings.server_url,
        cluster_url = %settings.cluster_url,
        namespace = %settings.namespace,
        platform = ?args.platform,
        "Configuration loaded"
    );

    let platform: Arc<dyn Platform> = match args.platform {
        PlatformKind::Kubernetes => Arc::new(
            KubernetesPlatform::new(&settings).context("failed to configure cluster client")?,
        ),
        PlatformKind::Mock => {
            warn!("Using in-memory platform, no pods will be created");
            Arc::new(MockPlatform::new())
        }
    };
    let scheduler =
        Arc::new(HttpSchedulerClient::new(&settings).context("failed to configure scheduler client")?);

    let registry = Arc::new(InstanceRegistry::new());
    let admission = Arc::new(AdmissionController::new(
        Arc::clone(&registry),
        settings.ceilings(),
    ));
    let provisioner = Arc::new(Provisioner::new(
        Arc::clone(&registry),
        Arc::clone(&admission),
        Arc::clone(&platform),
        settings.instance_prefix.clone(),
    ));
    let reconciler = Reconciler::new(
        scheduler,
        Arc::clone(&platform),
        Arc::clone(&registry),
        ReconcilerConfig {
            reconcile_interval: settings.reconcile_interval(),
            auto_register_timeout: settings.auto_register_timeout(),
        },
    );

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start admission loop in background
    let admission_handle = tokio::spawn({
        let admission = Arc::clone(&admission);
        let interval = settings.admission_interval();
        let shutdown_rx = shutdown_rx.clone();
        async move {
            admission.run(interval, shutdown_rx).await;
        }
    });

    // Start reconciliation loop in background
    let reconciler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    let state = AppState::new(registry, admission, provisioner);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(addr = %args.listen, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, admission_handle).await {
        warn!(error = %e, "Admission loop did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, reconciler_handle).await {
        warn!(error = %e, "Reconciler did not shut down in time");
    }

    info!("Controller shutdown complete");
    Ok(())
}
