//! Tracing setup shared by `dapx`, `dapx-bridge` and the test suites
//!
//! Stdout is reserved: the proxy runner writes control messages there and
//! the bridge relays nothing on it. Console logs therefore always go to
//! stderr. An optional log file gets the full filtered stream, and stderr
//! can be narrowed to a higher floor while the file is active.
//!
//! ```rust,ignore
//! use dapx_logging::{init, Level, LogConfig};
//!
//! let _guard = init(
//!     LogConfig::proxy(false)
//!         .log_file("/tmp/dapx/proxy-s1.log")
//!         .console_level(Level::WARN),
//! )?;
//! ```

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tracing::{Dispatch, Subscriber};
use tracing_appender::non_blocking::NonBlocking;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::time::{LocalTime, UtcTime};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub use tracing::{debug, error, info, instrument, span, trace, warn, Level};

pub use tracing;

pub use tracing_appender::non_blocking::WorkerGuard;

/// Program doing the logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// `dapx run`: one worker per debug session
    Proxy,
    /// stdio debugger exposed on TCP
    Bridge,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub role: Role,
    /// Force `debug` regardless of `RUST_LOG`
    pub debug: bool,
    /// Used when `RUST_LOG` is unset
    pub default_level: String,
    pub show_target: bool,
    pub utc: bool,
    pub log_file: Option<PathBuf>,
    /// Floor for stderr; the log file is not affected
    pub console_level: Option<Level>,
}

impl LogConfig {
    /// Module targets are shown so adapter, client and worker lines can be
    /// told apart in one session log.
    pub fn proxy(debug: bool) -> Self {
        Self {
            role: Role::Proxy,
            debug,
            default_level: "info".to_string(),
            show_target: true,
            utc: false,
            log_file: None,
            console_level: None,
        }
    }

    pub fn bridge(debug: bool) -> Self {
        Self {
            role: Role::Bridge,
            show_target: false,
            ..Self::proxy(debug)
        }
    }

    pub fn default_level(mut self, level: impl Into<String>) -> Self {
        self.default_level = level.into();
        self
    }

    pub fn utc(mut self) -> Self {
        self.utc = true;
        self
    }

    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn console_level(mut self, level: Level) -> Self {
        self.console_level = Some(level);
        self
    }

    fn filter(&self) -> EnvFilter {
        if self.debug {
            return EnvFilter::new("debug");
        }
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_level))
    }

    fn console_floor(&self) -> LevelFilter {
        self.console_level
            .map_or(LevelFilter::TRACE, LevelFilter::from_level)
    }
}

/// Build the dispatcher for `config` without installing it.
///
/// The guard, when present, flushes the log file on drop.
pub fn dispatch(config: &LogConfig) -> std::io::Result<(Dispatch, Option<WorkerGuard>)> {
    let (file, guard) = match &config.log_file {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(config.filter())
        .with(console_layer(config).with_filter(config.console_floor()))
        .with(file.map(|writer| file_layer(writer, config)));
    Ok((Dispatch::new(subscriber), guard))
}

/// Install the global subscriber. Hold the returned guard until exit.
///
/// `RUST_LOG` (e.g. `dapx_proxy::client=trace`) replaces the default
/// level unless `debug` is set. Fails if a subscriber is already installed.
pub fn init(config: LogConfig) -> std::io::Result<Option<WorkerGuard>> {
    let (dispatch, guard) = dispatch(&config)?;
    tracing::dispatcher::set_global_default(dispatch).map_err(std::io::Error::other)?;
    debug!(role = ?config.role, "Logging initialized");
    Ok(guard)
}

fn console_layer<S>(config: &LogConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = fmt::layer()
        .with_target(config.show_target)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal());
    if config.utc {
        layer.with_timer(UtcTime::rfc_3339()).boxed()
    } else {
        layer.with_timer(LocalTime::rfc_3339()).boxed()
    }
}

fn file_layer<S>(writer: NonBlocking, config: &LogConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = fmt::layer()
        .with_target(true)
        .with_writer(writer)
        .with_ansi(false);
    if config.utc {
        layer.with_timer(UtcTime::rfc_3339()).boxed()
    } else {
        layer.with_timer(LocalTime::rfc_3339()).boxed()
    }
}

// One file per run, never rotated
fn file_writer(path: &Path) -> std::io::Result<(NonBlocking, WorkerGuard)> {
    dapx_config::paths::ensure_parent_dir(path)?;
    let dir = path.parent().unwrap_or(Path::new("."));
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("dapx.log");
    Ok(tracing_appender::non_blocking(
        tracing_appender::rolling::never(dir, name),
    ))
}

/// Test logging into the captured test output. Idempotent.
pub fn init_test() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}
