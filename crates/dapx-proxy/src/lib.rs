//! dapx proxy engine
//!
//! Sits between an orchestration client and a family of debug adapters
//! (debugpy, Delve, java-debug, CodeLLDB, js-debug, vsdbg) and exposes
//! them through one control protocol.
//!
//! # Architecture
//!
//! - [`framing`] and [`protocol`]: `Content-Length` framing and DAP types
//! - [`control`]: the caller's `init` / `dap` / `terminate` commands and
//!   the messages sent back
//! - [`process`]: adapter spawn and graceful-then-forced shutdown
//! - [`client`] and [`connection`]: the DAP socket, connect retry and the
//!   initialize / configurationDone handshake
//! - [`policy`]: per-adapter behaviour behind the [`AdapterPolicy`] trait
//! - [`child`]: child sessions for multi-session adapters
//! - [`worker`]: the session state machine tying it together

pub mod child;
pub mod client;
pub mod connection;
pub mod constants;
pub mod control;
pub mod error;
pub mod ext;
pub mod framing;
pub mod policy;
pub mod process;
pub mod protocol;
pub mod tracker;
pub mod worker;

pub use child::{ChildNotification, ChildSession, ChildSessionManager, ChildTarget};
pub use client::{ClientConfig, ClientEvent, DapClient, PendingResponse};
pub use connection::{
    build_launch_args, ConnectionManager, ConnectionState, DapConnector, DapEventHandler,
    LaunchOptions, TcpConnector,
};
pub use control::{parse_command, ProxyCommand, ProxyMessage};
pub use error::{Error, Result};
pub use ext::DebugResult;
pub use framing::{encode_message, FrameDecoder};
pub use policy::{AdapterPolicy, DefaultAdapterPolicy, PolicyRegistry};
pub use process::{AdapterProcessManager, AdapterSpawnConfig, SpawnedAdapter};
pub use protocol::*;
pub use tracker::{CallbackRequestTracker, RequestTracker};
pub use worker::{ChannelMessageSender, MessageSender, ProxyState, ProxyWorker};
