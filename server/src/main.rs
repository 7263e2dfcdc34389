//! Remote Development Workspace Control Plane
//!
//! Serves the reconciliation protocol polled by cluster agents and a small
//! control API for creating workspaces and changing their desired state.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod domain;
mod error;
mod infra;
mod service;

pub use crate::config::Config;
pub use error::{Error, Result};

use infra::agent_repository::AgentRepository;
use infra::clock::SystemClock;
use infra::devfile_source::FsDevfileSource;
use infra::workspace_repository::WorkspaceRepository;
use service::agent::AgentService;
use service::reconcile::ReconcileService;
use service::workspace::WorkspaceService;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub workspace_service: Arc<WorkspaceService>,
    pub agent_service: Arc<AgentService>,
    pub reconcile_service: Arc<ReconcileService>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::load()?);

    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    let http_addr: SocketAddr = format!("{}:{}", config.http_host, config.http_port).parse()?;

    info!("Starting Workspace Control Plane");
    info!("HTTP listening on {}", http_addr);
    info!(
        partial = config.partial_reconciliation_interval_seconds,
        full = config.full_reconciliation_interval_seconds,
        "Reconciliation intervals"
    );

    // Initialize infrastructure
    let pool = infra::sqlite::init(&config.database_url).await?;
    let workspace_repository = Arc::new(WorkspaceRepository::new(pool.clone()));
    let agent_repository = Arc::new(AgentRepository::new(pool));
    let devfile_source = Arc::new(FsDevfileSource::new(&config.projects_dir));
    let clock = Arc::new(SystemClock);

    // Initialize services
    let workspace_service = Arc::new(WorkspaceService::new(
        workspace_repository.clone(),
        agent_repository.clone(),
        devfile_source,
        config.clone(),
        clock.clone(),
    ));
    let agent_service = Arc::new(AgentService::new(agent_repository, clock.clone()));
    let reconcile_service = Arc::new(ReconcileService::new(
        workspace_repository,
        config.clone(),
        clock,
    ));

    let state = AppState {
        workspace_service,
        agent_service,
        reconcile_service,
    };

    let app = api::http::create_router(state);
    let listener = tokio::net::TcpListener::bind(http_addr).await?;

    if let Err(e) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("HTTP server error: {}", e);
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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

    info!("Received shutdown signal");
}
