//! Process signal handling
//!
//! Created once in `main` and handed to the long-running commands.

use anyhow::Result;
use dapx_logging::info;
use tokio::sync::watch;

/// Spawn the signal listener; the receiver flips to `true` on SIGINT or
/// SIGTERM (Ctrl+C elsewhere).
pub fn shutdown_hook() -> Result<watch::Receiver<bool>> {
    let (tx, rx) = watch::channel(false);

    #[cfg(unix)]
    {
        use anyhow::Context;
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), shutting down"),
            }
            tx.send_replace(true);
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down");
                tx.send_replace(true);
            }
        });
    }

    Ok(rx)
}
