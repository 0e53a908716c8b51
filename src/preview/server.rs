use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::api::{self, AppState, SharedState};
use super::compute::{ComputePlatform, HttpComputeClient};
use super::db::{DbHandle, PreviewDb};
use super::gc::GarbageCollector;
use super::local::LocalPreviewManager;
use super::pipeline::PipelineExecutor;
use super::promotion::PromotionController;
use super::proxy::PreviewProxy;
use super::steps::ProcessRunner;
use super::workspace::WorkspaceStore;
use crate::config::AppConfig;

/// Open the database, creating its parent directory first.
pub fn open_db(config: &AppConfig) -> Result<DbHandle> {
    if let Some(parent) = config.server.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = PreviewDb::new(&config.server.db_path)
        .context("Failed to initialize preview database")?;
    Ok(DbHandle::new(db))
}

pub fn compute_client(config: &AppConfig) -> Result<Arc<dyn ComputePlatform>> {
    let client = HttpComputeClient::new(&config.compute, config.pipeline.max_error_chars)
        .context("Failed to build compute client")?;
    Ok(Arc::new(client))
}

/// Wire every component from the resolved configuration.
pub fn build_state(config: &AppConfig) -> Result<SharedState> {
    let db = open_db(config)?;
    let workspaces = WorkspaceStore::new(&config.workspace);
    let compute = compute_client(config)?;
    let executor = PipelineExecutor::new(
        db.clone(),
        workspaces.clone(),
        Arc::new(ProcessRunner),
        compute.clone(),
        config.pipeline.clone(),
    );

    let (local, proxy) = if config.server.local_preview {
        let local = Arc::new(LocalPreviewManager::new(config.local_preview.clone()));
        let proxy = PreviewProxy::new(local.clone()).context("Failed to build preview proxy")?;
        (Some(local), Some(proxy))
    } else {
        (None, None)
    };

    Ok(Arc::new(AppState {
        promotion: PromotionController::new(db.clone(), compute.clone()),
        db,
        workspaces,
        executor,
        compute,
        screenshots_dir: config.pipeline.screenshots_dir.clone(),
        local,
        proxy,
    }))
}

/// Build the full application router.
pub fn build_router(state: SharedState, cors: bool) -> Router {
    let local_mode = state.local.is_some();
    let mut app = api::api_router(local_mode)
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if cors {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Run the control service until Ctrl-C, with the garbage collector in the
/// background.
pub async fn start_server(config: AppConfig) -> Result<()> {
    let state = build_state(&config)?;

    let gc = if config.gc.enabled {
        let collector = Arc::new(GarbageCollector::new(
            state.db.clone(),
            state.workspaces.clone(),
            state.compute.clone(),
            config.gc.clone(),
        )
        .with_in_flight(state.executor.in_flight()));
        let shutdown = collector.shutdown_handle();
        let handle = tokio::spawn(async move { collector.run().await });
        Some((shutdown, handle))
    } else {
        info!("Garbage collector disabled");
        None
    };

    let app = build_router(state.clone(), config.server.cors);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(
        %local_addr,
        local_preview = config.server.local_preview,
        "Launchpad listening on http://{}",
        local_addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some((shutdown, handle)) = gc {
        shutdown.notify_one();
        if let Err(e) = handle.await {
            warn!(error = %e, "Garbage collector task ended abnormally");
        }
    }
    if let Some(local) = &state.local
        && local.stop().await
    {
        info!("Local preview stopped");
    }

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl-C handler, running until killed");
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}
