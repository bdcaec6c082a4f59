//! cronwarden -- Appliance-grade job scheduling for edge IoT fleets.
//!
//! This crate provides the core library for named schedule jobs, interval
//! and cron triggering, action invocation (REST, message bus, device
//! control), execution history, missed-run backfill, and record retention.

pub mod api;
pub mod config;
pub mod errors;
pub mod invoke;
pub mod manager;
pub mod model;
pub mod recovery;
pub mod retention;
pub mod service;
pub mod storage;
pub mod trigger;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::Config;
use crate::invoke::{Clients, FileTokenProvider, HttpCommandClient, HttpMessageBus};
use crate::manager::SchedulerManager;
use crate::service::Service;

/// Start the cronwarden daemon: API server, scheduler manager, startup
/// reconciliation, and retention purger.
pub async fn serve(config: Config) -> Result<()> {
    let startup_corr = uuid::Uuid::new_v4().to_string();

    // 1. Storage
    tracing::info!(db_path = %config.database, "Initializing database");
    if let Some(parent) = std::path::Path::new(&config.database).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let pool = storage::open_pool(&config.database)?;

    // 2. Collaborator clients
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let clients = Clients {
        http: http.clone(),
        bus: Arc::new(HttpMessageBus::new(http.clone(), &config.clients.message_bus_url)),
        command: Arc::new(HttpCommandClient::new(http, &config.clients.command_url)),
        secrets: Arc::new(FileTokenProvider::new(
            config.auth.jwt_token_path.as_ref().map(Into::into),
        )),
    };

    // 3. Scheduler manager + startup reconciliation (missed-run backfill)
    let manager = Arc::new(SchedulerManager::new(clients, pool.clone()));
    let reconciler = recovery::Reconciler::new();
    reconciler.run(&pool, &manager, &startup_corr).await?;

    // 4. Retention purger (background task)
    let purger = Arc::new(retention::RetentionPurger::new(
        pool.clone(),
        config.retention_interval(),
        config.retention.max_cap,
        config.retention.min_cap,
    ));
    let purge_handle = purger.start();

    // 5. API server
    let addr: std::net::SocketAddr = config.bind.parse()?;
    let state = api::state::AppState {
        service: Service::new(manager.clone(), pool),
    };
    let app = api::router(state);

    tracing::info!(%addr, "cronwarden listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 6. Graceful teardown: stop schedules first, then the purger.
    tracing::info!("shutting down");
    manager.shutdown(&startup_corr).await?;
    purger.shutdown();
    if let Some(handle) = purge_handle {
        let _ = handle.await;
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
    }
}
