//! Stdio-to-TCP bridge for debuggers that only speak DAP on stdio
//!
//! Listens on `host:port`, and for each client spawns the debugger and
//! relays framed messages between the socket and the debugger's stdio.
//! One client at a time; later connections are refused while a session
//! is active. When the client leaves, the debugger is terminated and the
//! bridge waits for the next client. A clean debugger exit stops the bridge.

mod relay;
mod session;

pub use session::SessionEnd;

use anyhow::{Context, Result};
use clap::Args;
use dapx_config::BridgeConfig;
use dapx_logging::{info, warn};
use dapx_proxy::client::{configure_tcp_keepalive, normalize_host};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Args, Debug, Clone)]
pub struct BridgeArgs {
    /// Address to listen on (defaults to the configured bridge host)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    pub port: u16,

    /// Debugger executable speaking DAP on stdio
    #[arg(long)]
    pub command: String,

    /// Extra environment for the debugger, KEY=VALUE (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Debugger arguments; consumes everything that follows
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// What to spawn for each client
#[derive(Debug, Clone)]
pub struct AdapterLaunch {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Wait between terminate and kill
    pub kill_grace: Duration,
}

impl AdapterLaunch {
    pub fn from_args(args: &BridgeArgs, config: &BridgeConfig) -> Self {
        Self {
            command: args.command.clone(),
            args: args.args.clone(),
            env: args.env.clone(),
            kill_grace: Duration::from_millis(config.kill_grace_ms),
        }
    }
}

fn parse_env_pair(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

pub async fn run(
    args: BridgeArgs,
    config: BridgeConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let host = args.host.clone().unwrap_or_else(|| config.host.clone());
    let addr = SocketAddr::from((normalize_host(&host), args.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind bridge listener on {}", addr))?;

    let launch = AdapterLaunch::from_args(&args, &config);
    info!(
        "Bridge listening on {} for '{}' {:?}",
        addr, launch.command, launch.args
    );
    serve(listener, &launch, shutdown).await
}

/// Accept clients one at a time until the debugger exits cleanly or
/// shutdown is requested.
pub async fn serve(
    listener: TcpListener,
    launch: &AdapterLaunch,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => {
                info!("Bridge shutting down");
                return Ok(());
            }
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept bridge client: {}", e);
                continue;
            }
        };
        info!("Bridge client connected from {}", peer);
        configure_tcp_keepalive(&stream);

        match session::run(stream, launch, &listener, shutdown.clone()).await? {
            SessionEnd::ClientClosed => {
                info!("Bridge client {} disconnected, waiting for the next one", peer);
            }
            SessionEnd::AdapterFailed => {
                warn!("Debugger failed, waiting for the next client");
            }
            SessionEnd::AdapterExited => {
                info!("Debugger exited, stopping bridge");
                return Ok(());
            }
            SessionEnd::Shutdown => {
                info!("Bridge shutting down");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        bridge: BridgeArgs,
    }

    #[test]
    fn test_parse_bridge_invocation() {
        let cli = TestCli::try_parse_from([
            "dapx-bridge",
            "--host",
            "localhost",
            "--port",
            "4711",
            "--env",
            "DOTNET_ROOT=/usr/share/dotnet",
            "--command",
            "/opt/vsdbg/vsdbg",
            "--args",
            "--interpreter=vscode",
            "--engineLogging",
        ])
        .unwrap();

        let args = cli.bridge;
        assert_eq!(args.host.as_deref(), Some("localhost"));
        assert_eq!(args.port, 4711);
        assert_eq!(args.command, "/opt/vsdbg/vsdbg");
        assert_eq!(args.args, vec!["--interpreter=vscode", "--engineLogging"]);
        assert_eq!(
            args.env,
            vec![("DOTNET_ROOT".to_string(), "/usr/share/dotnet".to_string())]
        );
    }

    #[test]
    fn test_env_pair_requires_key() {
        assert_eq!(
            parse_env_pair("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert_eq!(parse_env_pair("EMPTY=").unwrap().1, "");
        assert!(parse_env_pair("=value").is_err());
        assert!(parse_env_pair("novalue").is_err());
    }

    #[test]
    fn test_launch_uses_configured_grace() {
        let cli = TestCli::try_parse_from(["dapx-bridge", "--port", "1", "--command", "cat"])
            .unwrap();
        let config = BridgeConfig {
            kill_grace_ms: 250,
            ..BridgeConfig::default()
        };
        let launch = AdapterLaunch::from_args(&cli.bridge, &config);
        assert_eq!(launch.kill_grace, Duration::from_millis(250));
        assert!(launch.args.is_empty());
    }
}
