//! Default constants for dapx configuration
//!
//! Single source of truth for default values. Everything that is
//! configurable through `ProxyConfig` has its default here.
//!
//! # Organization
//!
//! - Hosts
//! - Environment variables
//! - Connection: connect retry, disconnect and request timeouts
//! - Process: adapter shutdown
//! - Child sessions: adoption handshake timings
//! - Bridge
//! - TCP keepalive

// ============================================================================
// HOSTS
// ============================================================================

/// Default host for adapter sockets (localhost only)
pub const DEFAULT_ADAPTER_HOST: &str = "127.0.0.1";

/// Default host as IPv4 address (for direct socket connections)
pub const LOCALHOST_IPV4: std::net::Ipv4Addr = std::net::Ipv4Addr::new(127, 0, 0, 1);

// ============================================================================
// ENVIRONMENT VARIABLES
// ============================================================================

/// Config file path override
pub const ENV_DAPX_CONFIG: &str = "DAPX_CONFIG";

/// When "true", relative script paths are resolved under [`CONTAINER_WORKSPACE_ROOT`]
pub const ENV_DAPX_CONTAINER: &str = "DAPX_CONTAINER";

/// Fallback working directory for spawned adapters
pub const ENV_DAPX_ADAPTER_CWD: &str = "DAPX_ADAPTER_CWD";

/// Workspace mount point inside the container image
pub const CONTAINER_WORKSPACE_ROOT: &str = "/workspace";

// ============================================================================
// CONNECTION
// ============================================================================

/// Delay before the first connect attempt; the adapter needs time to bind
pub const DEFAULT_INITIAL_CONNECT_DELAY_MS: u64 = 500;

/// Connect attempts before session start fails
pub const DEFAULT_MAX_CONNECT_ATTEMPTS: u32 = 60;

/// Fixed interval between connect attempts
pub const DEFAULT_CONNECT_RETRY_INTERVAL_MS: u64 = 200;

/// Timeout for the polite `disconnect` request
pub const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 1_000;

/// Default timeout for DAP requests (30 seconds)
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Capacity of per-subscriber event channels in the DAP client
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// PROCESS
// ============================================================================

/// Grace period between the terminate signal and the forced kill
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 300;

/// Timeout for executable validation probes (`--version` and friends)
pub const DEFAULT_VALIDATION_TIMEOUT_MS: u64 = 10_000;

// ============================================================================
// CHILD SESSIONS
// ============================================================================

/// Attempts for the child start (attach) request
pub const DEFAULT_CHILD_ATTACH_MAX_RETRIES: u32 = 20;

/// Delay between child attach attempts
pub const DEFAULT_CHILD_ATTACH_RETRY_INTERVAL_MS: u64 = 200;

/// Per-request timeout for the child attach request
pub const DEFAULT_CHILD_ATTACH_TIMEOUT_MS: u64 = 20_000;

/// Wait for the child's `initialized` event when the policy gives no timeout
pub const DEFAULT_CHILD_INIT_TIMEOUT_MS: u64 = 12_000;

/// Wait for a second `initialized` event after the child attached
pub const DEFAULT_POST_ATTACH_INIT_WAIT_MS: u64 = 3_000;

/// Wait for the child's first `stopped` event before pausing it explicitly
pub const DEFAULT_CHILD_STOP_WAIT_MS: u64 = 15_000;

/// Timeout for the `threads` request issued while pausing a child
pub const DEFAULT_THREADS_REQUEST_TIMEOUT_MS: u64 = 5_000;

// ============================================================================
// BRIDGE
// ============================================================================

/// Grace period before the bridge force-kills its adapter child
pub const DEFAULT_BRIDGE_KILL_GRACE_MS: u64 = 3_000;

// ============================================================================
// TCP KEEPALIVE
// ============================================================================

/// TCP keepalive time in seconds (time before first probe)
pub const DEFAULT_TCP_KEEPALIVE_TIME_SECS: u64 = 10;

/// TCP keepalive interval in seconds (time between probes)
pub const DEFAULT_TCP_KEEPALIVE_INTERVAL_SECS: u64 = 10;

/// TCP keepalive retries (Linux/FreeBSD only)
pub const DEFAULT_TCP_KEEPALIVE_RETRIES: u32 = 3;
