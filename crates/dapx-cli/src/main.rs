//! dapx: debug adapter proxy

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dapx_cli::commands::{bridge, run};
use dapx_cli::{init_logging, signals};
use dapx_config::load_config_or_default;
use dapx_logging::{debug, LogConfig};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dapx", version, about = "Debug adapter proxy")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Configuration file (falls back to DAPX_CONFIG)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, global = true, env = "DAPX_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a proxy worker on stdin/stdout
    Run,
    /// Bridge a stdio debugger onto a TCP port
    Bridge(bridge::BridgeArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = match cli.command {
        Commands::Run => LogConfig::proxy(cli.debug),
        Commands::Bridge(_) => LogConfig::bridge(cli.debug),
    };
    let _guard = init_logging(log_config, cli.log_file.as_deref())?;

    let config =
        load_config_or_default(cli.config.as_deref()).context("Failed to load configuration")?;
    debug!("Loaded configuration: {:?}", config);
    let shutdown = signals::shutdown_hook()?;

    match cli.command {
        Commands::Run => run::run(config, shutdown).await,
        Commands::Bridge(args) => bridge::run(args, config.bridge, shutdown).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["dapx", "run", "--debug", "--config", "/etc/dapx.toml"])
            .unwrap();
        assert!(cli.debug);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/dapx.toml")));
        assert!(matches!(cli.command, Commands::Run));
    }

    #[test]
    fn test_bridge_subcommand() {
        let cli = Cli::try_parse_from([
            "dapx", "bridge", "--port", "4711", "--command", "netcoredbg", "--args",
            "--interpreter=vscode",
        ])
        .unwrap();
        match cli.command {
            Commands::Bridge(args) => {
                assert_eq!(args.port, 4711);
                assert_eq!(args.args, vec!["--interpreter=vscode"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["dapx"]).is_err());
    }
}
