use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState};
use super::controller::PipelineController;
use super::db::{DbHandle, ScanDb};
use super::guard::LoopGuard;
use super::ledger::RunLedger;
use super::scheduler::Scheduler;
use crate::config::WatchmanConfig;
use crate::integrations::Collaborators;

/// Build the full application router with request tracing.
pub fn build_router(state: Arc<AppState>, dev_mode: bool) -> Router {
    let mut app = api::api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Open (creating if needed) the database file and run migrations.
pub fn open_database(path: &Path) -> Result<ScanDb> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    ScanDb::new(path).context("Failed to initialize scan database")
}

/// Wire ledger, guard, controller and scheduler around one database.
///
/// Runs left in flight by a previous process are failed first so their
/// commits can be scanned again.
pub fn build_state(
    config: &WatchmanConfig,
    db: ScanDb,
    collaborators: Collaborators,
) -> Result<Arc<AppState>> {
    let recovered = db.recover_interrupted()?;
    if recovered > 0 {
        tracing::warn!(count = recovered, "marked interrupted runs as failed");
    }

    let db = DbHandle::new(db);
    let ledger = RunLedger::new(db.clone());
    let source = Arc::clone(&collaborators.source);
    let controller =
        PipelineController::new(ledger.clone(), collaborators, config.controller_config());
    let guard = LoopGuard::new(config.guard_config(), db);
    let scheduler = Scheduler::start(config.scheduler_config(), guard, Arc::new(controller));

    Ok(Arc::new(AppState {
        ledger,
        scheduler: Arc::new(scheduler),
        source,
        webhook_secret: config.github.webhook_secret.clone(),
    }))
}

/// Start the watchman server and block until Ctrl+C, then drain the scheduler.
pub async fn start_server(config: WatchmanConfig) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let db = open_database(&config.server.db_path)?;
    let state = build_state(&config, db, config.collaborators())?;
    let scheduler = Arc::clone(&state.scheduler);
    let app = build_router(state, config.server.dev_mode);

    let host = if config.server.dev_mode {
        "0.0.0.0"
    } else {
        config.server.host.as_str()
    };
    let addr = format!("{}:{}", host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        db = %config.server.db_path.display(),
        "watchman listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("draining in-flight scans");
    scheduler.shutdown().await;
    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
