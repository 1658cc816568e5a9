//! Standalone stdio-to-TCP bridge, spawned by the proxy for .NET debuggers

use anyhow::{Context, Result};
use clap::Parser;
use dapx_cli::commands::bridge::{self, BridgeArgs};
use dapx_cli::{init_logging, signals};
use dapx_config::load_config_or_default;
use dapx_logging::LogConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dapx-bridge", version, about = "Expose a stdio debug adapter on TCP")]
struct Cli {
    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Also write logs to this file
    #[arg(long, env = "DAPX_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(flatten)]
    bridge: BridgeArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(LogConfig::bridge(cli.debug), cli.log_file.as_deref())?;

    let config = load_config_or_default(None).context("Failed to load configuration")?;
    let shutdown = signals::shutdown_hook()?;
    bridge::run(cli.bridge, config.bridge, shutdown).await
}
