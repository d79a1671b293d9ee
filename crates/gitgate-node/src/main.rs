//! Gitgate Node - git smart HTTP server.

use anyhow::Context;
use clap::Parser;
use gitgate_node::api::{create_router, AppState};
use gitgate_node::config::Config;
use gitgate_node::observability::{init_logging, LogFormat};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Gitgate Node - serve git repositories over smart HTTP
#[derive(Parser, Debug)]
#[command(name = "gitgate-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(long)]
    listen_addr: Option<SocketAddr>,

    /// Directory holding the served repositories
    #[arg(long)]
    project_root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,

    /// Reject every push
    #[arg(long)]
    read_only: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(addr) = self.listen_addr {
            config.listen_addr = addr;
        }
        if let Some(root) = self.project_root {
            config.project_root = root;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = LogFormat::parse(&format);
        }
        config.read_only |= self.read_only;

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;

    init_logging(&config.log_level, config.log_format);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Gitgate node");
    tracing::info!(
        listen_addr = %config.listen_addr,
        project_root = %config.project_root.display(),
        read_only = config.read_only,
        "Node configuration"
    );

    if !config.project_root.is_dir() {
        anyhow::bail!(
            "project root {} is not a directory",
            config.project_root.display()
        );
    }

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let app = create_router(AppState::new(config));

    tracing::info!("Node is ready. Press Ctrl+C to stop.");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Gitgate node stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
