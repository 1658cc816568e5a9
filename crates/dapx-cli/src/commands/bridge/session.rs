//! One bridged client: spawn the debugger, relay until either side ends

use super::relay::relay;
use super::AdapterLaunch;
use anyhow::{Context, Result};
use dapx_logging::{debug, info, warn};
use dapx_proxy::process::terminate_process;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{ChildStderr, Command};
use tokio::sync::watch;

/// Adapter output still in flight when the process exits
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Client went away; the debugger was terminated
    ClientClosed,
    /// Debugger exited with code 0 or by signal
    AdapterExited,
    /// Debugger exited with a failure code
    AdapterFailed,
    Shutdown,
}

pub(super) async fn run(
    client: TcpStream,
    launch: &AdapterLaunch,
    listener: &TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> Result<SessionEnd> {
    let mut child = Command::new(&launch.command)
        .args(&launch.args)
        .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn debugger '{}'", launch.command))?;
    let pid = child.id().context("Debugger exited before it could be tracked")?;
    info!("Spawned debugger '{}' (PID {})", launch.command, pid);

    let stdin = child.stdin.take().context("Failed to capture debugger stdin")?;
    let stdout = child.stdout.take().context("Failed to capture debugger stdout")?;
    let stderr = child.stderr.take().context("Failed to capture debugger stderr")?;
    let stderr_task = tokio::spawn(log_stderr(stderr));

    let (client_read, client_write) = client.into_split();
    let mut to_adapter = tokio::spawn(relay(client_read, stdin, "client -> debugger"));
    let mut to_client = tokio::spawn(relay(stdout, client_write, "debugger -> client"));

    let end = loop {
        tokio::select! {
            // Client EOF closes the debugger's stdin, so it must win over
            // the exit that follows.
            biased;

            relayed = &mut to_adapter => {
                if let Ok(Err(e)) = relayed {
                    debug!("Relay to debugger ended: {}", e);
                    // A failed write may just mean the debugger is gone.
                    if let Ok(Some(status)) = child.try_wait() {
                        break classify_exit(Some(status));
                    }
                }
                info!("Bridge client closed the connection");
                terminate_process(pid, false, launch.kill_grace, child.wait()).await;
                break SessionEnd::ClientClosed;
            }
            status = child.wait() => {
                let end = classify_exit(status.ok());
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, &mut to_client).await;
                break end;
            }
            accepted = listener.accept() => {
                if let Ok((stream, peer)) = accepted {
                    warn!("Refusing connection from {}: a client is already attached", peer);
                    drop(stream);
                }
            }
            _ = shutdown.changed() => {
                terminate_process(pid, false, launch.kill_grace, child.wait()).await;
                break SessionEnd::Shutdown;
            }
        }
    };

    to_adapter.abort();
    to_client.abort();
    stderr_task.abort();
    Ok(end)
}

fn classify_exit(status: Option<ExitStatus>) -> SessionEnd {
    let Some(status) = status else {
        warn!("Lost track of debugger exit status");
        return SessionEnd::AdapterFailed;
    };
    if status.success() || status.code().is_none() {
        info!("Debugger exited ({})", status);
        SessionEnd::AdapterExited
    } else {
        warn!("Debugger exited with {}", status);
        SessionEnd::AdapterFailed
    }
}

async fn log_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            warn!("[debugger stderr] {}", line);
        }
    }
}
