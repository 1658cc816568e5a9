//! Error types for the proxy engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// DAP protocol state violations and message format expectations
    ///
    /// Use for: unexpected message types, frames that cannot be encoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON parsing and deserialization failures
    ///
    /// Automatically converted from `serde_json::Error` via `From` impl.
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// Control command schema violations, message names the offending field
    #[error("{0}")]
    Validation(String),

    /// Socket, channel and stream failures after a connection exists
    #[error("Adapter communication error: {0}")]
    Communication(String),

    /// Adapter initialization failures (missing or failed handshake response)
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Request timeout
    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    /// The adapter answered with `success: false`
    #[error("{message}")]
    RequestFailed { command: String, message: String },

    /// The adapter log directory could not be created
    #[error("Failed to create adapter log directory: {0}")]
    LogDirectory(String),

    /// The adapter process could not be started
    #[error("Failed to spawn adapter: {0}")]
    Spawn(String),

    /// Every connect attempt failed
    #[error("Failed to connect DAP client to {host}:{port} after {attempts} attempts: {last_error}")]
    ConnectExhausted {
        host: String,
        port: u16,
        attempts: u32,
        last_error: String,
    },

    /// The connection was shut down while the request was pending
    #[error("{0}")]
    Disconnected(String),

    /// Operation not allowed in the current session state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The adapter policy has no answer for this configuration
    #[error("Not supported: {0}")]
    NotSupported(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidMessage(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Communication(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::Protocol(format!("Invalid UTF-8: {}", err))
    }
}
