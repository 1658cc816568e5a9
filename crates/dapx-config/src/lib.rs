//! Configuration types and loading for dapx
//!
//! This crate provides:
//! - Configuration structures for the proxy engine, adapter processes,
//!   child sessions and the stdio bridge
//! - Config file loading (TOML format)
//! - Environment variable lookups (`DAPX_CONFIG`, `DAPX_CONTAINER`)
//!
//! # Usage
//!
//! ```rust,ignore
//! use dapx_config::{load_config, ProxyConfig};
//! use std::path::Path;
//!
//! let config = load_config(Path::new("dapx.toml"))?;
//! println!("Connect attempts: {}", config.connection.max_connect_attempts);
//! ```

mod loader;

// Default constants for all configuration values
pub mod constants;

// Path utilities
pub mod paths;

mod proxy;

pub use loader::{load_config, load_config_from_str, load_config_or_default, ConfigError};
pub use proxy::{
    BridgeConfig, ChildSessionConfig, ConnectionConfig, ConnectionOverrides, ProcessConfig,
    ProxyConfig, StdioMode,
};

// Re-export commonly used constants for convenience
pub use constants::{
    DEFAULT_ADAPTER_HOST, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_TCP_KEEPALIVE_INTERVAL_SECS,
    DEFAULT_TCP_KEEPALIVE_RETRIES, DEFAULT_TCP_KEEPALIVE_TIME_SECS, LOCALHOST_IPV4,
};
