//! Adapter process management
//!
//! Spawns debug adapter processes detached from the proxy's terminal
//! session and stops them with a terminate signal followed by a forced
//! kill. Process lifecycle noise (spawn errors after launch, exit codes,
//! failed signals) is logged here and never propagated.

use crate::error::{Error, Result};
use dapx_config::constants::ENV_DAPX_ADAPTER_CWD;
use dapx_config::{ProcessConfig, StdioMode};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Everything needed to launch one adapter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterSpawnConfig {
    pub command: String,
    pub args: Vec<String>,
    pub host: String,
    pub port: u16,
    pub log_dir: PathBuf,
    /// Working directory; falls back to `DAPX_ADAPTER_CWD`, then the proxy's own
    pub cwd: Option<PathBuf>,
    /// Added on top of the inherited environment
    pub env: HashMap<String, String>,
}

impl AdapterSpawnConfig {
    /// Command line as a single string, for logs and dry runs
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How an adapter process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    /// Signal name such as `SIGTERM`, if the process was killed by one
    pub fn signal_name(&self) -> Option<String> {
        let signal = self.signal?;
        #[cfg(unix)]
        {
            Some(
                nix::sys::signal::Signal::try_from(signal)
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_else(|_| signal.to_string()),
            )
        }
        #[cfg(not(unix))]
        {
            Some(signal.to_string())
        }
    }
}

/// Handle to a running adapter.
///
/// The [`Child`] itself is owned by a watcher task; this handle only sees
/// the pid and the exit notification.
#[derive(Debug, Clone)]
pub struct SpawnedAdapter {
    pid: u32,
    process_group: bool,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl SpawnedAdapter {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    pub fn exit(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// Wait for the process to exit.
    ///
    /// Returns `None` if the watcher went away without seeing an exit.
    pub async fn wait(&self) -> Option<ProcessExit> {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => *exit,
            Err(_) => None,
        };
        exit
    }

    /// Wait for exit for at most `timeout`; true if the process exited.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

/// Spawns and stops adapter processes
#[derive(Debug, Clone, Default)]
pub struct AdapterProcessManager {
    config: ProcessConfig,
}

impl AdapterProcessManager {
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Create the adapter log directory; failure is fatal for the session.
    pub async fn ensure_log_directory(&self, log_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(log_dir).await.map_err(|e| {
            error!("Failed to ensure adapter log directory {}: {}", log_dir.display(), e);
            Error::LogDirectory(e.to_string())
        })?;
        info!("Ensured adapter log directory exists: {}", log_dir.display());
        Ok(())
    }

    /// Launch the adapter described by `spawn`.
    pub async fn spawn(&self, spawn: &AdapterSpawnConfig) -> Result<SpawnedAdapter> {
        self.ensure_log_directory(&spawn.log_dir).await?;

        let cwd = spawn
            .cwd
            .clone()
            .or_else(|| std::env::var_os(ENV_DAPX_ADAPTER_CWD).map(PathBuf::from))
            .or_else(|| std::env::current_dir().ok());

        info!("Spawning adapter: {}", spawn.command_line());
        debug!(
            command = %spawn.command,
            args = ?spawn.args,
            cwd = ?cwd,
            env_vars = spawn.env.len(),
            "Adapter spawn configuration"
        );

        let mut cmd = Command::new(&spawn.command);
        cmd.args(&spawn.args)
            .envs(&spawn.env)
            .stdin(Stdio::null())
            .stdout(self.stdio())
            .stderr(self.stdio())
            .kill_on_drop(false);
        if let Some(cwd) = &cwd {
            cmd.current_dir(cwd);
        }
        self.detach(&mut cmd);

        let child = cmd.spawn().map_err(|e| {
            error!("Adapter process spawn error: {}", e);
            Error::Spawn(format!("{}: {}", spawn.command, e))
        })?;

        let Some(pid) = child.id() else {
            return Err(Error::Spawn(
                "Failed to spawn adapter process or get PID".to_string(),
            ));
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(watch_exit(child, pid, exit_tx));
        info!("Adapter process started with PID {}", pid);

        Ok(SpawnedAdapter {
            pid,
            process_group: self.config.detach,
            exit_rx,
        })
    }

    /// Terminate the adapter: graceful signal, grace period, forced kill.
    pub async fn shutdown(&self, adapter: &SpawnedAdapter) {
        if adapter.has_exited() {
            info!("Adapter process PID {} already exited", adapter.pid);
            return;
        }
        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        terminate_process(adapter.pid, adapter.process_group, grace, adapter.wait()).await;
    }

    fn stdio(&self) -> Stdio {
        match self.config.stdio {
            StdioMode::Inherit => Stdio::inherit(),
            StdioMode::Ignore => Stdio::null(),
        }
    }

    fn detach(&self, cmd: &mut Command) {
        if !self.config.detach {
            return;
        }
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }
        #[cfg(windows)]
        {
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        }
    }
}

async fn watch_exit(mut child: Child, pid: u32, exit_tx: watch::Sender<Option<ProcessExit>>) {
    match child.wait().await {
        Ok(status) => {
            let exit = ProcessExit::from_status(status);
            info!(
                "Adapter process {} exited. Code: {:?}, Signal: {:?}",
                pid,
                exit.code,
                exit.signal_name()
            );
            exit_tx.send_replace(Some(exit));
        }
        Err(e) => {
            error!("Failed waiting on adapter process {}: {}", pid, e);
        }
    }
}

/// Send a terminate signal, wait up to `grace` for `exited`, then force kill.
///
/// Shared by the adapter manager and the stdio bridge. Errors are logged.
pub async fn terminate_process<F>(pid: u32, process_group: bool, grace: Duration, exited: F)
where
    F: std::future::Future,
{
    info!("Sending terminate signal to adapter process PID {}", pid);
    if let Err(e) = signal_terminate(pid, process_group) {
        warn!("Failed to send terminate signal to PID {}: {}", pid, e);
    }

    if tokio::time::timeout(grace, exited).await.is_ok() {
        info!("Adapter process PID {} exited after terminate signal", pid);
        return;
    }

    warn!(
        "Adapter process PID {} did not exit within {}ms. Killing.",
        pid,
        grace.as_millis()
    );
    if let Err(e) = force_kill(pid, process_group).await {
        error!("Error during adapter process termination (PID {}): {}", pid, e);
    }
}

#[cfg(unix)]
fn signal_terminate(pid: u32, process_group: bool) -> std::io::Result<()> {
    send_signal(pid, process_group, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(unix)]
async fn force_kill(pid: u32, process_group: bool) -> std::io::Result<()> {
    send_signal(pid, process_group, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(unix)]
fn send_signal(pid: u32, process_group: bool, signal: nix::sys::signal::Signal) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| std::io::Error::other("PID out of range"))?;
    let target = Pid::from_raw(raw);
    let result = if process_group {
        // Group may already be gone while the leader is still a zombie
        killpg(target, signal).or_else(|_| kill(target, signal))
    } else {
        kill(target, signal)
    };

    match result {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(std::io::Error::from(e)),
    }
}

#[cfg(windows)]
fn signal_terminate(pid: u32, _process_group: bool) -> std::io::Result<()> {
    std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(|_| ())
}

#[cfg(windows)]
async fn force_kill(pid: u32, _process_group: bool) -> std::io::Result<()> {
    // Killing the pid alone leaves grandchildren running
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F", "/T"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("taskkill exited with {}", status)))
    }
}
