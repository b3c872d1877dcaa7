//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the runtime from a validated configuration
//! - Start background tasks (metrics, config watcher, signals, reloads)
//! - Bind the listener and serve until shutdown
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Listener binds last (traffic only when ready)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::watcher::ConfigWatcher;
use crate::config::{ConfigError, RelayConfig};
use crate::http::{HttpServer, Runtime};
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::signals::{handle_signals, ReloadTarget};
use crate::net::listener::{Listener, ListenerError};
use crate::observability::metrics;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("server failed: {0}")]
    Serve(#[from] std::io::Error),
}

/// Run the relay until a termination signal arrives.
///
/// `config_path` enables hot reload (file watch and SIGHUP).
pub async fn run(config: RelayConfig, config_path: Option<PathBuf>) -> Result<(), StartupError> {
    let runtime = Runtime::build(&config)?;
    tracing::info!(
        routes = runtime.router.len(),
        upstreams = config.upstreams.len(),
        "Runtime built"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let server = HttpServer::new(runtime);
    let shutdown = Arc::new(Shutdown::new());

    // The watcher handle must stay alive for events to arrive.
    let mut _watcher = None;
    let mut reload = None;
    if let Some(path) = config_path {
        let (watcher, updates) = ConfigWatcher::new(&path);
        reload = Some(ReloadTarget {
            path: path.clone(),
            tx: watcher.sender(),
        });
        match watcher.run() {
            Ok(handle) => _watcher = Some(handle),
            Err(e) => tracing::warn!(error = %e, "Config watcher unavailable, SIGHUP reload only"),
        }
        tokio::spawn(apply_reloads(server.clone(), updates));
    }
    tokio::spawn(handle_signals(Arc::clone(&shutdown), reload));

    let listener = Listener::bind(&config.listener).await?;
    server.run(listener, shutdown.subscribe()).await?;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn apply_reloads(server: HttpServer, mut updates: mpsc::UnboundedReceiver<RelayConfig>) {
    while let Some(config) = updates.recv().await {
        if let Err(e) = server.reload(&config) {
            tracing::error!(error = %e, "Reloaded configuration rejected, keeping current runtime");
        }
    }
}
