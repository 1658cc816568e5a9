//! dapx command line
//!
//! Two programs share this crate: `dapx` (proxy runner and bridge
//! subcommands) and the standalone `dapx-bridge` that .NET sessions spawn.

pub mod commands;
pub mod signals;

use anyhow::{Context, Result};
use dapx_logging::{LogConfig, Level, WorkerGuard};
use std::path::Path;

/// Install the global subscriber, optionally teeing into `log_file`.
///
/// With a file, stderr only sees warnings and above.
pub fn init_logging(config: LogConfig, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let config = match log_file {
        Some(path) => config.log_file(path).console_level(Level::WARN),
        None => config,
    };
    let target = config.log_file.clone();
    dapx_logging::init(config).with_context(|| match target {
        Some(path) => format!("Failed to open log file {}", path.display()),
        None => "Failed to initialize logging".to_string(),
    })
}
