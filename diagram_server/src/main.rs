//! Diagram Sync Server — keeps diagram metadata in sync with monitored repositories.
//!
//! Receives push webhooks, routes each to its repository's pipeline worker,
//! and exposes run status, target reload, and health endpoints. All
//! repository access goes through the GitHub REST API.

mod config;
mod metrics;
mod models;
mod routes;
mod services;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use diagram_pipeline::{DialectRegistry, Orchestrator};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::services::github_service::GitHubPlatform;
use crate::services::target_service;

#[derive(Parser)]
#[command(name = "diagram-sync", about = "Diagram metadata sync server")]
struct Cli {
    /// Server port
    #[arg(short, long, env = "DIAGRAM_PORT", default_value = "9090")]
    port: u16,

    /// JSON file listing the monitored repositories
    #[arg(long, env = "DIAGRAM_TARGETS_FILE", default_value = "targets.json")]
    targets: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();

    tracing::info!("Starting Diagram Sync Server...");

    let config = config::SyncConfig::from_env();
    let targets = target_service::load_targets(&cli.targets)?;
    tracing::info!(path = %cli.targets.display(), count = targets.len(), "Loaded repository targets");

    let platform = Arc::new(GitHubPlatform::new(&config.github_token)?);
    let registry = Arc::new(DialectRegistry::builtin());
    tracing::info!(dialects = ?registry.names().collect::<Vec<_>>(), "Registered diagram dialects");

    let orchestrator = Arc::new(Orchestrator::start(
        platform,
        registry,
        targets,
        config.pipeline_config(),
    )?);
    let targets_file = Arc::new(cli.targets);

    #[cfg(unix)]
    spawn_reload_on_hangup(orchestrator.clone(), targets_file.clone());

    // Initialize metrics
    metrics::init_metrics();

    let state = routes::SyncRouterState {
        config: Arc::new(config),
        orchestrator,
        targets_file,
    };
    let app = routes::sync_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)));

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!("Diagram Sync Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Shutdown complete");

    Ok(())
}

/// Re-read the target file on every SIGHUP.
#[cfg(unix)]
fn spawn_reload_on_hangup(orchestrator: Arc<Orchestrator>, targets_file: Arc<PathBuf>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("SIGHUP reload unavailable: {e}");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            tracing::info!("Received SIGHUP, reloading targets...");
            // Failures are logged inside; the previous target set stays active.
            let _ = target_service::reload(&orchestrator, &targets_file);
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
