//! Flock Node - request coalescing demo server.

use anyhow::Context;
use clap::Parser;
use flock_node::config::Config;
use flock_node::observability::{init_logging, LogFormat};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Flock Node - collapses concurrent identical HTTP requests
#[derive(Parser, Debug)]
#[command(name = "flock-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(long)]
    listen_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(addr) = args.listen_addr {
        config.server.listen_addr = addr;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    init_logging(
        &config.logging.level,
        LogFormat::parse(&config.logging.format),
    );

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Flock node");
    tracing::info!(
        listen_addr = %config.server.listen_addr,
        coalesce_header = %config.coalesce.header_name,
        follower_timeout_ms = config.coalesce.follower_timeout_ms,
        max_in_flight = config.coalesce.max_in_flight,
        greet_delay_ms = config.demo.greet_delay_ms,
        "Node configuration"
    );

    flock_node::server::serve(&config).await
}
