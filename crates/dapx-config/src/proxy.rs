//! Proxy engine configuration
//!
//! Connection retry timings, request timeouts, adapter process handling,
//! child-session handshake timings and bridge settings.

use crate::constants::{
    DEFAULT_ADAPTER_HOST, DEFAULT_BRIDGE_KILL_GRACE_MS, DEFAULT_CHILD_ATTACH_MAX_RETRIES,
    DEFAULT_CHILD_ATTACH_RETRY_INTERVAL_MS, DEFAULT_CHILD_ATTACH_TIMEOUT_MS,
    DEFAULT_CHILD_STOP_WAIT_MS, DEFAULT_CONNECT_RETRY_INTERVAL_MS, DEFAULT_DISCONNECT_TIMEOUT_MS,
    DEFAULT_EVENT_CHANNEL_CAPACITY, DEFAULT_INITIAL_CONNECT_DELAY_MS,
    DEFAULT_MAX_CONNECT_ATTEMPTS, DEFAULT_POST_ATTACH_INIT_WAIT_MS, DEFAULT_REQUEST_TIMEOUT_MS,
    DEFAULT_SHUTDOWN_GRACE_MS, DEFAULT_THREADS_REQUEST_TIMEOUT_MS, DEFAULT_VALIDATION_TIMEOUT_MS,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Top-level
// ============================================================================

/// Complete proxy configuration, one TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub child: ChildSessionConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl ProxyConfig {
    /// Connection settings for a policy, with its `[connection.overrides.<name>]` applied.
    pub fn connection_for(&self, policy_name: &str) -> ConnectionConfig {
        let mut resolved = self.connection.clone();
        if let Some(overrides) = self.connection.overrides.get(policy_name) {
            overrides.apply_to(&mut resolved);
        }
        resolved.overrides.clear();
        resolved
    }
}

// ============================================================================
// Connection Config
// ============================================================================

/// Adapter socket connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Delay before the first connect attempt
    #[serde(default = "default_initial_connect_delay_ms")]
    pub initial_connect_delay_ms: u64,
    /// Maximum connect attempts before giving up
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
    /// Fixed interval between connect attempts
    #[serde(default = "default_connect_retry_interval_ms")]
    pub connect_retry_interval_ms: u64,
    /// Timeout for the polite disconnect request
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
    /// Request timeout in milliseconds for DAP requests
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Capacity of event channels in the DAP client
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    /// Per-policy timing overrides keyed by policy name (e.g. `go`, `js-debug`)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub overrides: HashMap<String, ConnectionOverrides>,
}

fn default_initial_connect_delay_ms() -> u64 {
    DEFAULT_INITIAL_CONNECT_DELAY_MS
}

fn default_max_connect_attempts() -> u32 {
    DEFAULT_MAX_CONNECT_ATTEMPTS
}

fn default_connect_retry_interval_ms() -> u64 {
    DEFAULT_CONNECT_RETRY_INTERVAL_MS
}

fn default_disconnect_timeout_ms() -> u64 {
    DEFAULT_DISCONNECT_TIMEOUT_MS
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_event_channel_capacity() -> usize {
    DEFAULT_EVENT_CHANNEL_CAPACITY
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            initial_connect_delay_ms: default_initial_connect_delay_ms(),
            max_connect_attempts: default_max_connect_attempts(),
            connect_retry_interval_ms: default_connect_retry_interval_ms(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            event_channel_capacity: default_event_channel_capacity(),
            overrides: HashMap::new(),
        }
    }
}

/// Partial connection settings for slower-starting adapters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOverrides {
    #[serde(default)]
    pub initial_connect_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_connect_attempts: Option<u32>,
    #[serde(default)]
    pub connect_retry_interval_ms: Option<u64>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

impl ConnectionOverrides {
    fn apply_to(&self, config: &mut ConnectionConfig) {
        if let Some(v) = self.initial_connect_delay_ms {
            config.initial_connect_delay_ms = v;
        }
        if let Some(v) = self.max_connect_attempts {
            config.max_connect_attempts = v;
        }
        if let Some(v) = self.connect_retry_interval_ms {
            config.connect_retry_interval_ms = v;
        }
        if let Some(v) = self.request_timeout_ms {
            config.request_timeout_ms = v;
        }
    }
}

// ============================================================================
// Process Config
// ============================================================================

/// What a spawned adapter does with its standard streams
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdioMode {
    /// Share the proxy's stdout/stderr (stdin is always closed)
    Inherit,
    /// Discard all output
    #[default]
    Ignore,
}

/// Adapter process handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Wait between the terminate signal and the forced kill
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub stdio: StdioMode,
    /// Put the adapter in its own process group
    #[serde(default = "default_true")]
    pub detach: bool,
    /// Timeout for executable validation probes
    #[serde(default = "default_validation_timeout_ms")]
    pub validation_timeout_ms: u64,
}

fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}

fn default_validation_timeout_ms() -> u64 {
    DEFAULT_VALIDATION_TIMEOUT_MS
}

fn default_true() -> bool {
    true
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: default_shutdown_grace_ms(),
            stdio: StdioMode::default(),
            detach: default_true(),
            validation_timeout_ms: default_validation_timeout_ms(),
        }
    }
}

// ============================================================================
// Child Session Config
// ============================================================================

/// Timings for adopting child sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildSessionConfig {
    #[serde(default = "default_attach_max_retries")]
    pub attach_max_retries: u32,
    #[serde(default = "default_attach_retry_interval_ms")]
    pub attach_retry_interval_ms: u64,
    #[serde(default = "default_attach_timeout_ms")]
    pub attach_timeout_ms: u64,
    #[serde(default = "default_post_attach_init_wait_ms")]
    pub post_attach_init_wait_ms: u64,
    #[serde(default = "default_stop_wait_ms")]
    pub stop_wait_ms: u64,
    #[serde(default = "default_threads_timeout_ms")]
    pub threads_timeout_ms: u64,
}

fn default_attach_max_retries() -> u32 {
    DEFAULT_CHILD_ATTACH_MAX_RETRIES
}

fn default_attach_retry_interval_ms() -> u64 {
    DEFAULT_CHILD_ATTACH_RETRY_INTERVAL_MS
}

fn default_attach_timeout_ms() -> u64 {
    DEFAULT_CHILD_ATTACH_TIMEOUT_MS
}

fn default_post_attach_init_wait_ms() -> u64 {
    DEFAULT_POST_ATTACH_INIT_WAIT_MS
}

fn default_stop_wait_ms() -> u64 {
    DEFAULT_CHILD_STOP_WAIT_MS
}

fn default_threads_timeout_ms() -> u64 {
    DEFAULT_THREADS_REQUEST_TIMEOUT_MS
}

impl Default for ChildSessionConfig {
    fn default() -> Self {
        Self {
            attach_max_retries: default_attach_max_retries(),
            attach_retry_interval_ms: default_attach_retry_interval_ms(),
            attach_timeout_ms: default_attach_timeout_ms(),
            post_attach_init_wait_ms: default_post_attach_init_wait_ms(),
            stop_wait_ms: default_stop_wait_ms(),
            threads_timeout_ms: default_threads_timeout_ms(),
        }
    }
}

// ============================================================================
// Bridge Config
// ============================================================================

/// stdio-to-TCP bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_host")]
    pub host: String,
    /// Wait between SIGTERM and SIGKILL for the bridged adapter
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

fn default_bridge_host() -> String {
    DEFAULT_ADAPTER_HOST.to_string()
}

fn default_kill_grace_ms() -> u64 {
    DEFAULT_BRIDGE_KILL_GRACE_MS
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: default_bridge_host(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}
