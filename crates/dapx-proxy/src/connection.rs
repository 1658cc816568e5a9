//! Connection Management
//!
//! Connect with bounded retry, the initialize handshake, request helpers
//! for launch/attach/breakpoints/configurationDone, event wiring and the
//! best-effort disconnect.

use crate::client::{ClientConfig, ClientEvent, DapClient, PendingResponse};
use crate::constants::{client, events, launch, requests};
use crate::error::{Error, Result};
use crate::policy::{AdapterPolicy, ChildSessionRequest};
use crate::protocol::{
    Capabilities, DisconnectArguments, Event, InitializeRequestArguments, Response,
    SetBreakpointsArguments, Source, SourceBreakpoint,
};
use async_trait::async_trait;
use dapx_config::ConnectionConfig;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Session connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Initialized,
    ConfigurationDone,
    Running,
    Disconnecting,
    Disconnected,
}

/// Opens one adapter connection
#[async_trait]
pub trait DapConnector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<DapClient>;
}

/// Plain TCP connector
#[derive(Debug, Clone)]
pub struct TcpConnector {
    client_config: ClientConfig,
    policy: Option<Arc<dyn AdapterPolicy>>,
}

impl TcpConnector {
    pub fn new(client_config: ClientConfig, policy: Option<Arc<dyn AdapterPolicy>>) -> Self {
        Self {
            client_config,
            policy,
        }
    }
}

#[async_trait]
impl DapConnector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<DapClient> {
        DapClient::connect(host, port, self.client_config, self.policy.clone()).await
    }
}

/// Hooks for adapter events.
///
/// Every hook defaults to a no-op. An `Err` is logged where it is
/// dispatched and never stops the event loop.
#[async_trait]
pub trait DapEventHandler: Send + Sync {
    async fn on_initialized(&self, _event: Event) -> Result<()> {
        Ok(())
    }
    async fn on_output(&self, _event: Event) -> Result<()> {
        Ok(())
    }
    async fn on_stopped(&self, _event: Event) -> Result<()> {
        Ok(())
    }
    async fn on_continued(&self, _event: Event) -> Result<()> {
        Ok(())
    }
    async fn on_thread(&self, _event: Event) -> Result<()> {
        Ok(())
    }
    async fn on_exited(&self, _event: Event) -> Result<()> {
        Ok(())
    }
    async fn on_terminated(&self, _event: Event) -> Result<()> {
        Ok(())
    }
    /// Events without a dedicated hook
    async fn on_other_event(&self, _event: Event) -> Result<()> {
        Ok(())
    }
    async fn on_child_session_requested(&self, _request: ChildSessionRequest) -> Result<()> {
        Ok(())
    }
    async fn on_error(&self, _message: String) -> Result<()> {
        Ok(())
    }
    async fn on_close(&self, _reason: String) -> Result<()> {
        Ok(())
    }
}

/// What goes into a `launch` request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchOptions {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stop_on_entry: Option<bool>,
    pub just_my_code: Option<bool>,
    /// Caller overrides; `program`, `args`, `stopOnEntry` and `justMyCode`
    /// from here win over the fields above
    pub launch_config: Option<Map<String, Value>>,
    pub adapter_type: Option<String>,
    pub runtime_executable: Option<String>,
}

/// Build `launch` arguments.
///
/// Caller-provided `launchConfig` keys are copied first; `program`,
/// `args`, `stopOnEntry` and `justMyCode` are only taken from it when they
/// have the right type. `noDebug` and `console` get defaults.
pub fn build_launch_args(options: &LaunchOptions) -> Value {
    let overrides = options.launch_config.clone().unwrap_or_default();
    let mut args = overrides.clone();

    let program = overrides
        .get("program")
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| options.program.display().to_string());
    args.insert("program".to_string(), Value::String(program));

    let program_args: Vec<Value> = match overrides.get("args").and_then(Value::as_array) {
        Some(list) => list.iter().filter(|a| a.is_string()).cloned().collect(),
        None => options.args.iter().cloned().map(Value::String).collect(),
    };
    args.insert("args".to_string(), Value::Array(program_args));

    let stop_on_entry = overrides
        .get("stopOnEntry")
        .and_then(Value::as_bool)
        .or(options.stop_on_entry);
    match stop_on_entry {
        Some(v) => args.insert("stopOnEntry".to_string(), Value::Bool(v)),
        None => args.remove("stopOnEntry"),
    };

    let just_my_code = overrides
        .get("justMyCode")
        .and_then(Value::as_bool)
        .or(options.just_my_code);
    match just_my_code {
        Some(v) => args.insert("justMyCode".to_string(), Value::Bool(v)),
        None => args.remove("justMyCode"),
    };

    args.entry("noDebug").or_insert(Value::Bool(false));
    args.entry("console")
        .or_insert_with(|| Value::String(launch::CONSOLE_INTERNAL.to_string()));
    if let Some(adapter_type) = &options.adapter_type {
        args.entry("type")
            .or_insert_with(|| Value::String(adapter_type.clone()));
    }
    if let Some(runtime) = &options.runtime_executable {
        args.entry("runtimeExecutable")
            .or_insert_with(|| Value::String(runtime.clone()));
    }

    Value::Object(args)
}

/// Drives one session connection through its lifecycle
pub struct ConnectionManager {
    config: ConnectionConfig,
    connector: Arc<dyn DapConnector>,
    state: Mutex<ConnectionState>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, connector: Arc<dyn DapConnector>) -> Self {
        Self {
            config,
            connector,
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    /// Manager over plain TCP
    pub fn tcp(config: ConnectionConfig, policy: Option<Arc<dyn AdapterPolicy>>) -> Self {
        let connector = TcpConnector::new(ClientConfig::from(&config), policy);
        Self::new(config, Arc::new(connector))
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn connector(&self) -> Arc<dyn DapConnector> {
        self.connector.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            debug!("Connection state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    /// Mark the session running (after configurationDone and launch)
    pub fn mark_running(&self) {
        self.set_state(ConnectionState::Running);
    }

    /// Connect after the initial delay, retrying at a fixed interval.
    ///
    /// Every failed attempt but the last is a warning; exhausting the
    /// attempts is [`Error::ConnectExhausted`] with the last cause.
    pub async fn connect_with_retry(&self, host: &str, port: u16) -> Result<Arc<DapClient>> {
        self.set_state(ConnectionState::Connecting);

        let max_attempts = self.config.max_connect_attempts.max(1);
        let retry_interval = Duration::from_millis(self.config.connect_retry_interval_ms);

        info!(
            "Waiting {}ms before first DAP connect attempt",
            self.config.initial_connect_delay_ms
        );
        tokio::time::sleep(Duration::from_millis(self.config.initial_connect_delay_ms)).await;

        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            info!(
                "Attempting DAP client connect (attempt {}/{}) to {}:{}",
                attempt, max_attempts, host, port
            );
            match self.connector.connect(host, port).await {
                Ok(client) => {
                    info!("DAP client connected to adapter at {}:{}", host, port);
                    self.set_state(ConnectionState::Connected);
                    return Ok(Arc::new(client));
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        warn!(
                            "DAP client connect attempt {} failed: {}. Retrying in {}ms...",
                            attempt,
                            last_error,
                            retry_interval.as_millis()
                        );
                        tokio::time::sleep(retry_interval).await;
                    }
                }
            }
        }

        error!(
            "Failed to connect DAP client after {} attempts: {}",
            max_attempts, last_error
        );
        self.set_state(ConnectionState::Disconnected);
        Err(Error::ConnectExhausted {
            host: host.to_string(),
            port,
            attempts: max_attempts,
            last_error,
        })
    }

    /// Send `initialize` and return the adapter's capabilities.
    pub async fn initialize_session(
        &self,
        client: &DapClient,
        session_id: &str,
        adapter_id: &str,
    ) -> Result<Capabilities> {
        let args = InitializeRequestArguments {
            client_id: Some(format!("{}-{}", client::CLIENT_ID_PREFIX, session_id)),
            client_name: Some(client::CLIENT_NAME.to_string()),
            adapter_id: adapter_id.to_string(),
            locale: Some(client::LOCALE.to_string()),
            lines_start_at1: Some(true),
            columns_start_at1: Some(true),
            path_format: Some(client::PATH_FORMAT.to_string()),
            supports_variable_type: Some(true),
            supports_run_in_terminal_request: Some(false),
            supports_start_debugging_request: Some(true),
        };

        info!("Sending 'initialize' request (adapterID {})", adapter_id);
        let response = client
            .send_request(requests::INITIALIZE, Some(serde_json::to_value(args)?))
            .await
            .map_err(|e| Error::InitializationFailed(e.to_string()))?;

        let capabilities = match response.body {
            Some(body) => serde_json::from_value(body).unwrap_or_else(|e| {
                debug!("Unparseable capabilities: {}", e);
                Capabilities::default()
            }),
            None => Capabilities::default(),
        };
        self.set_state(ConnectionState::Initialized);
        Ok(capabilities)
    }

    /// Write `launch` and hand back its pending response.
    ///
    /// Returns once the request is on the wire, so callers can order
    /// `configurationDone` after it without waiting for the answer.
    pub async fn send_launch_request(
        &self,
        client: &DapClient,
        args: Value,
    ) -> Result<PendingResponse> {
        info!("Sending 'launch' request");
        debug!("Launch arguments: {}", args);
        client
            .start_request(requests::LAUNCH, Some(args), client.config().request_timeout)
            .await
    }

    /// Replace the breakpoints of one file.
    pub async fn set_breakpoints(
        &self,
        client: &DapClient,
        file: &str,
        breakpoints: Vec<SourceBreakpoint>,
    ) -> Result<Response> {
        let args = SetBreakpointsArguments {
            source: Source::from_path(file),
            breakpoints: Some(breakpoints),
            source_modified: None,
        };
        client
            .send_request(requests::SET_BREAKPOINTS, Some(serde_json::to_value(args)?))
            .await
    }

    pub async fn send_configuration_done(&self, client: &DapClient) -> Result<()> {
        info!("Sending 'configurationDone'");
        client
            .send_request(
                requests::CONFIGURATION_DONE,
                Some(Value::Object(Map::new())),
            )
            .await?;
        self.set_state(ConnectionState::ConfigurationDone);
        Ok(())
    }

    /// Polite `disconnect` under the disconnect timeout, then close the socket.
    ///
    /// Always ends in [`ConnectionState::Disconnected`].
    pub async fn disconnect(&self, client: &DapClient, terminate_debuggee: bool) {
        self.set_state(ConnectionState::Disconnecting);
        let timeout = Duration::from_millis(self.config.disconnect_timeout_ms);
        let args = DisconnectArguments {
            restart: None,
            terminate_debuggee: Some(terminate_debuggee),
        };

        if !client.is_closed() {
            let request = async {
                let args = serde_json::to_value(args)?;
                client
                    .send_request_with_timeout(requests::DISCONNECT, Some(args), timeout)
                    .await
            };
            match tokio::time::timeout(timeout, request).await {
                Ok(Ok(_)) => debug!("Adapter acknowledged 'disconnect'"),
                Ok(Err(e)) => warn!("Error during DAP disconnect request: {}", e),
                Err(_) => warn!("DAP disconnect request timed out after {:?}", timeout),
            }
        }

        client.shutdown("Client disconnected").await;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Spawn a task dispatching the client's events to `handler`.
    ///
    /// The task ends after [`ClientEvent::Closed`] or when the client shuts
    /// down.
    pub async fn setup_event_handlers(
        &self,
        client: &DapClient,
        handler: Arc<dyn DapEventHandler>,
    ) -> JoinHandle<()> {
        let events = client.subscribe().await;
        tokio::spawn(dispatch_events(events, handler))
    }
}

async fn dispatch_events(
    mut events: tokio::sync::mpsc::Receiver<ClientEvent>,
    handler: Arc<dyn DapEventHandler>,
) {
    while let Some(event) = events.recv().await {
        let (hook, result) = match event {
            ClientEvent::Event(event) => {
                let name = event.event.clone();
                let result = match name.as_str() {
                    events::INITIALIZED => handler.on_initialized(event).await,
                    events::OUTPUT => handler.on_output(event).await,
                    events::STOPPED => handler.on_stopped(event).await,
                    events::CONTINUED => handler.on_continued(event).await,
                    events::THREAD => handler.on_thread(event).await,
                    events::EXITED => handler.on_exited(event).await,
                    events::TERMINATED => handler.on_terminated(event).await,
                    _ => handler.on_other_event(event).await,
                };
                (name, result)
            }
            ClientEvent::ChildSessionRequested(request) => (
                "childSessionRequested".to_string(),
                handler.on_child_session_requested(request).await,
            ),
            ClientEvent::Error(message) => ("error".to_string(), handler.on_error(message).await),
            ClientEvent::Closed(reason) => {
                if let Err(e) = handler.on_close(reason).await {
                    warn!("Handler for 'close' failed: {}", e);
                }
                break;
            }
        };
        if let Err(e) = result {
            warn!("Handler for '{}' failed: {}", hook, e);
        }
    }
    debug!("Event dispatch loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` attempts, then hands out in-memory clients
    struct FlakyConnector {
        failures: u32,
        attempts: AtomicU32,
    }

    impl FlakyConnector {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                attempts: AtomicU32::new(0),
            })
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DapConnector for FlakyConnector {
        async fn connect(&self, _host: &str, _port: u16) -> Result<DapClient> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.failures {
                return Err(Error::Communication("Connection refused (os error 111)".to_string()));
            }
            let (client_side, server_side) = tokio::io::duplex(1024);
            // Keep the peer alive for the rest of the test
            std::mem::forget(server_side);
            let (read, write) = tokio::io::split(client_side);
            Ok(DapClient::new(read, write))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_succeeds_on_last_attempt() {
        let connector = FlakyConnector::new(59);
        let manager = ConnectionManager::new(ConnectionConfig::default(), connector.clone());

        let client = manager.connect_with_retry("127.0.0.1", 5678).await.unwrap();
        assert!(!client.is_closed());
        assert_eq!(connector.attempts(), 60);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_exhausted_reports_attempts_and_cause() {
        let connector = FlakyConnector::new(u32::MAX);
        let manager = ConnectionManager::new(ConnectionConfig::default(), connector.clone());

        let start = tokio::time::Instant::now();
        let err = manager.connect_with_retry("127.0.0.1", 5678).await.unwrap_err();
        match &err {
            Error::ConnectExhausted {
                attempts,
                last_error,
                port,
                ..
            } => {
                assert_eq!(*attempts, 60);
                assert_eq!(*port, 5678);
                assert!(last_error.contains("Connection refused"));
            }
            other => panic!("Expected ConnectExhausted, got {:?}", other),
        }
        assert!(err.to_string().contains("60 attempts"));
        assert_eq!(connector.attempts(), 60);
        // 500ms initial delay plus 59 intervals of 200ms
        assert_eq!(start.elapsed(), Duration::from_millis(500 + 59 * 200));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_launch_args_defaults() {
        let args = build_launch_args(&LaunchOptions {
            program: PathBuf::from("/home/u/app.py"),
            args: vec!["--fast".to_string()],
            stop_on_entry: Some(true),
            ..Default::default()
        });
        assert_eq!(
            args,
            json!({
                "program": "/home/u/app.py",
                "args": ["--fast"],
                "stopOnEntry": true,
                "noDebug": false,
                "console": "internalConsole"
            })
        );
    }

    #[test]
    fn test_launch_config_overrides_win_when_well_typed() {
        let launch_config = json!({
            "program": "/other/main.py",
            "args": ["a", 1, "b"],
            "stopOnEntry": "yes",
            "justMyCode": false,
            "env": {"DEBUG": "1"},
            "console": "integratedTerminal"
        });
        let args = build_launch_args(&LaunchOptions {
            program: PathBuf::from("/home/u/app.py"),
            stop_on_entry: Some(false),
            just_my_code: Some(true),
            launch_config: launch_config.as_object().cloned(),
            adapter_type: Some("pwa-node".to_string()),
            runtime_executable: Some("/usr/bin/node".to_string()),
            ..Default::default()
        });

        assert_eq!(args["program"], "/other/main.py");
        assert_eq!(args["args"], json!(["a", "b"]));
        assert_eq!(args["stopOnEntry"], false);
        assert_eq!(args["justMyCode"], false);
        assert_eq!(args["env"]["DEBUG"], "1");
        assert_eq!(args["console"], "integratedTerminal");
        assert_eq!(args["type"], "pwa-node");
        assert_eq!(args["runtimeExecutable"], "/usr/bin/node");
    }

    #[test]
    fn test_empty_program_override_ignored() {
        let args = build_launch_args(&LaunchOptions {
            program: PathBuf::from("/app/main.go"),
            launch_config: json!({"program": ""}).as_object().cloned(),
            ..Default::default()
        });
        assert_eq!(args["program"], "/app/main.go");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_without_response_still_closes() {
        let (client_side, _server_side) = tokio::io::duplex(4096);
        let (read, write) = tokio::io::split(client_side);
        let client = DapClient::new(read, write);
        let manager = ConnectionManager::new(ConnectionConfig::default(), FlakyConnector::new(0));

        let start = tokio::time::Instant::now();
        manager.disconnect(&client, true).await;
        assert!(start.elapsed() <= Duration::from_millis(1_100));
        assert!(client.is_closed());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
