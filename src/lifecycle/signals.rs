//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to internal events
//! - Trigger appropriate actions (shutdown, reload)
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - A second SIGTERM/SIGINT exits immediately
//! - SIGHUP triggers config reload, not shutdown

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::watcher::reload_into;
use crate::config::RelayConfig;
use crate::lifecycle::shutdown::Shutdown;

/// Where a SIGHUP reload goes.
#[derive(Debug, Clone)]
pub struct ReloadTarget {
    pub path: PathBuf,
    pub tx: mpsc::UnboundedSender<RelayConfig>,
}

/// Handle signals until the process exits.
pub async fn handle_signals(shutdown: Arc<Shutdown>, reload: Option<ReloadTarget>) {
    let mut stopping = false;
    loop {
        match next_signal().await {
            Signal::Terminate if stopping => {
                tracing::warn!("Second termination signal, exiting immediately");
                std::process::exit(1);
            }
            Signal::Terminate => {
                tracing::info!("Termination signal received, shutting down gracefully");
                stopping = true;
                shutdown.trigger();
            }
            Signal::Reload => match &reload {
                Some(target) => {
                    tracing::info!(path = %target.path.display(), "SIGHUP received, reloading configuration");
                    reload_into(&target.path, &target.tx);
                }
                None => tracing::info!("SIGHUP received, no configuration file to reload"),
            },
        }
    }
}

enum Signal {
    Terminate,
    Reload,
}

#[cfg(unix)]
async fn next_signal() -> Signal {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut term), Ok(mut hup)) = (signal(SignalKind::terminate()), signal(SignalKind::hangup())) else {
        tracing::error!("Cannot install signal handlers, only Ctrl-C is handled");
        let _ = tokio::signal::ctrl_c().await;
        return Signal::Terminate;
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => Signal::Terminate,
        _ = term.recv() => Signal::Terminate,
        _ = hup.recv() => Signal::Reload,
    }
}

#[cfg(not(unix))]
async fn next_signal() -> Signal {
    let _ = tokio::signal::ctrl_c().await;
    Signal::Terminate
}
