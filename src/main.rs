//! upstream-relay: reverse proxy with failover, buffering and caching.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ net::listener ──▶ http::server ──▶ routing::router
//!                                                        │
//!                                                        ▼
//!                               load_balancer ◀── upstream::UpstreamRequest
//!                                     │             connect → send → header
//!                                     ▼                  → relay → finalize
//!                               net::connector ─────────▶ Backend
//!
//!     Cross-cutting: config (reload), observability, resilience, cache, lifecycle
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use upstream_relay::config::load_config;
use upstream_relay::lifecycle::startup;
use upstream_relay::observability::logging;

#[derive(Parser, Debug)]
#[command(name = "upstream-relay", version, about = "Reverse proxy with upstream failover")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {e}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };
    if cli.check {
        println!("{}: configuration is valid", cli.config.display());
        return ExitCode::SUCCESS;
    }

    logging::init(&config.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        bind_address = %config.listener.bind_address,
        "upstream-relay starting"
    );

    match startup::run(config, Some(cli.config)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}
