//! # parley
//!
//! Broker server binary: loads settings, starts the broker and serves peers
//! over `WebSocket` until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use parley_broker::Broker;
use parley_core::logging::{LogFormat, init_subscriber};
use parley_core::settings::{BrokerSettings, load_settings, load_settings_from_path};
use parley_server::config::ServerConfig;
use parley_server::metrics::install_recorder;
use parley_server::server::ParleyServer;

/// parley broker server.
#[derive(Parser, Debug)]
#[command(name = "parley", about = "Requester/responder interaction broker")]
struct Cli {
    /// Settings file (default `~/.parley/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings if specified).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings if specified).
    #[arg(long)]
    port: Option<u16>,

    /// Tracing filter directive (overrides settings if specified).
    #[arg(long)]
    log_level: Option<String>,

    /// Serve `/metrics` and the detailed `/health` body.
    #[arg(long)]
    diagnostics: bool,
}

impl Cli {
    fn apply(&self, settings: &mut BrokerSettings) {
        if let Some(host) = &self.host {
            settings.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.log_level.clone_from(level);
        }
        if self.diagnostics {
            settings.diagnostics_enabled = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let mut settings = match &args.config {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => load_settings().context("Failed to load settings")?,
    };
    args.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    init_subscriber(&settings.log_level, LogFormat::from_env());

    let broker = Broker::new(settings.clone());
    let mut server = ParleyServer::new(ServerConfig::from_settings(&settings), broker);
    if settings.diagnostics_enabled {
        let handle = install_recorder().context("Failed to install metrics recorder")?;
        server = server.with_metrics(handle);
    }

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("parley listening on ws://{addr}/ws");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    if !server.shutdown().join(vec![handle]).await {
        tracing::warn!("Server task aborted before the drain finished");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
