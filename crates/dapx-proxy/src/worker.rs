//! Proxy worker
//!
//! Drives one debug session from the caller's control commands: spawns the
//! adapter, connects, runs the policy's handshake, forwards `dap` requests
//! and adapter events, and tears everything down on `terminate`.
//!
//! Session state lives behind a short-lived mutex that is never held across
//! an await. Network work runs in spawned tasks so a slow adapter response
//! never blocks the next control command.

use crate::child::{ChildNotification, ChildSessionManager, ChildTarget};
use crate::client::DapClient;
use crate::connection::{build_launch_args, ConnectionManager, DapEventHandler, LaunchOptions};
use crate::constants::{events, requests};
use crate::control::{
    status, DapPayload, InitPayload, InitialBreakpoint, ProxyCommand, ProxyMessage,
    TerminatePayload, UNKNOWN_SESSION_ID,
};
use crate::error::{Error, Result};
use crate::ext::DebugResult;
use crate::policy::{
    AdapterPolicy, AdapterSpecificState, ChildSessionRequest, PolicyRegistry, QueuedCommand,
};
use crate::process::{AdapterProcessManager, SpawnedAdapter};
use crate::protocol::{Event, Response, SetBreakpointsArguments, SourceBreakpoint};
use crate::tracker::CallbackRequestTracker;
use async_trait::async_trait;
use dapx_config::paths::{is_container_mode, resolve_script_path};
use dapx_config::{ConnectionConfig, ProxyConfig};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Adapter events relayed to the caller
const FORWARDED_EVENTS: &[&str] = &[
    events::OUTPUT,
    events::STOPPED,
    events::CONTINUED,
    events::THREAD,
    events::EXITED,
    events::TERMINATED,
];

/// Child events relayed to the caller; a child ending is not the session ending
const CHILD_FORWARDED_EVENTS: &[&str] = &[
    events::OUTPUT,
    events::STOPPED,
    events::CONTINUED,
    events::THREAD,
];

// ============================================================
// OUTBOUND DELIVERY
// ============================================================

/// Delivers [`ProxyMessage`]s to the embedding caller
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: ProxyMessage);
}

/// [`MessageSender`] backed by a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelMessageSender {
    tx: mpsc::Sender<ProxyMessage>,
}

impl ChannelMessageSender {
    pub fn new(tx: mpsc::Sender<ProxyMessage>) -> Self {
        Self { tx }
    }

    /// Sender plus the receiving end the caller drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProxyMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl MessageSender for ChannelMessageSender {
    async fn send(&self, message: ProxyMessage) {
        if self.tx.send(message).await.is_err() {
            debug!("Proxy message receiver dropped");
        }
    }
}

// ============================================================
// STATE
// ============================================================

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Uninitialized,
    Initializing,
    Connected,
    ShuttingDown,
    Terminated,
}

impl ProxyState {
    /// Shutting down or already terminated
    pub fn is_stopping(self) -> bool {
        matches!(self, ProxyState::ShuttingDown | ProxyState::Terminated)
    }
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProxyState::Uninitialized => "uninitialized",
            ProxyState::Initializing => "initializing",
            ProxyState::Connected => "connected",
            ProxyState::ShuttingDown => "shutting_down",
            ProxyState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Everything owned by the running session
struct Session {
    id: String,
    policy: Arc<dyn AdapterPolicy>,
    connection: Arc<ConnectionManager>,
    tracker: Arc<CallbackRequestTracker>,
    client: Option<Arc<DapClient>>,
    children: Option<Arc<ChildSessionManager>>,
    adapter: Option<SpawnedAdapter>,
    adapter_state: AdapterSpecificState,
    queued: Vec<QueuedCommand>,
    initial_breakpoints: Vec<InitialBreakpoint>,
    launch_args: Value,
    /// `launch` waits for the `configurationDone` response
    launch_pending: bool,
    launch_started: bool,
    /// Flips once `launch` has been written to the adapter
    launch_written: watch::Sender<bool>,
    configured: bool,
    /// Feeds the dispatcher task that writes forwarded requests in order
    dispatch: Option<mpsc::UnboundedSender<QueuedCommand>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    fn handle(&self) -> Option<SessionHandle> {
        Some(SessionHandle {
            id: self.id.clone(),
            policy: self.policy.clone(),
            connection: self.connection.clone(),
            tracker: self.tracker.clone(),
            client: self.client.clone()?,
            children: self.children.clone(),
            launch_written: self.launch_written.subscribe(),
        })
    }

    /// Launch arguments, handed out once
    fn start_launch(&mut self) -> Option<Value> {
        if self.launch_started {
            return None;
        }
        self.launch_started = true;
        self.launch_pending = false;
        Some(self.launch_args.clone())
    }
}

/// Cloned references for work done outside the session lock
#[derive(Clone)]
struct SessionHandle {
    id: String,
    policy: Arc<dyn AdapterPolicy>,
    connection: Arc<ConnectionManager>,
    tracker: Arc<CallbackRequestTracker>,
    client: Arc<DapClient>,
    children: Option<Arc<ChildSessionManager>>,
    launch_written: watch::Receiver<bool>,
}

// ============================================================
// WORKER
// ============================================================

/// Runs one proxied debug session
#[derive(Clone)]
pub struct ProxyWorker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    config: ProxyConfig,
    registry: PolicyRegistry,
    sender: Arc<dyn MessageSender>,
    processes: AdapterProcessManager,
    state: watch::Sender<ProxyState>,
    session_id: Mutex<String>,
    session: Mutex<Option<Session>>,
}

impl fmt::Debug for ProxyWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyWorker")
            .field("session_id", &self.session_id())
            .field("state", &self.state())
            .finish()
    }
}

impl ProxyWorker {
    pub fn new(config: ProxyConfig, sender: Arc<dyn MessageSender>) -> Self {
        Self::with_registry(config, PolicyRegistry::new(), sender)
    }

    /// Worker choosing policies from `registry`
    pub fn with_registry(
        config: ProxyConfig,
        registry: PolicyRegistry,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        let (state, _) = watch::channel(ProxyState::Uninitialized);
        Self {
            inner: Arc::new(WorkerInner {
                processes: AdapterProcessManager::new(config.process.clone()),
                config,
                registry,
                sender,
                state,
                session_id: Mutex::new(UNKNOWN_SESSION_ID.to_string()),
                session: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ProxyState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ProxyState> {
        self.inner.state.subscribe()
    }

    pub fn session_id(&self) -> String {
        self.inner.session_id()
    }

    /// Commands held back by a queueing policy
    pub fn queued_command_count(&self) -> usize {
        self.inner.with_session(|s| s.queued.len()).unwrap_or(0)
    }

    /// Handle one validated control command.
    pub async fn handle_command(&self, command: ProxyCommand) {
        debug!("Received '{}' command", command.name());
        match command {
            ProxyCommand::Init(payload) => self.handle_init(*payload).await,
            ProxyCommand::Dap(payload) => self.inner.handle_dap(payload).await,
            ProxyCommand::Terminate(payload) => self.handle_terminate(payload).await,
        }
    }

    /// Report a caller-side problem (such as an unparseable command line).
    pub async fn report_error(&self, message: impl Into<String>) {
        let session_id = self.session_id();
        self.inner
            .send(ProxyMessage::error(session_id, message))
            .await;
    }

    /// Stop the session and everything it started. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }

    async fn handle_init(&self, payload: InitPayload) {
        let current = self.state();
        if current != ProxyState::Uninitialized {
            warn!("Ignoring 'init' in state {}", current);
            self.inner
                .send(ProxyMessage::error(
                    &payload.session_id,
                    format!("Invalid state for init: {}", current),
                ))
                .await;
            return;
        }

        self.inner.set_state(ProxyState::Initializing);
        self.inner.set_session_id(&payload.session_id);
        let session_id = payload.session_id.clone();

        if let Err(e) = self.inner.start_session(payload).await {
            if self.state().is_stopping() {
                debug!(session_id = %session_id, "Session start abandoned: {}", e);
                return;
            }
            error!(session_id = %session_id, "Session start failed: {}", e);
            self.inner
                .send(ProxyMessage::error(
                    &session_id,
                    format!("Failed to initialize session: {}", e),
                ))
                .await;
            self.inner.teardown().await;
            self.inner.set_state(ProxyState::Uninitialized);
        }
    }

    async fn handle_terminate(&self, payload: TerminatePayload) {
        info!(session_id = %payload.session_id, "Terminate requested");
        self.inner.shutdown().await;
        self.inner
            .send(ProxyMessage::status(&payload.session_id, status::TERMINATED))
            .await;
    }
}

impl WorkerInner {
    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.session().as_mut().map(f)
    }

    fn handle(&self) -> Option<SessionHandle> {
        self.with_session(|s| s.handle()).flatten()
    }

    fn session_id(&self) -> String {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_session_id(&self, id: &str) {
        *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) = id.to_string();
    }

    fn state(&self) -> ProxyState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ProxyState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Proxy state {} -> {}", previous, state);
        }
    }

    async fn send(&self, message: ProxyMessage) {
        trace!("Outbound: {:?}", message);
        self.sender.send(message).await;
    }

    // ------------------------------------------------------------------
    // Session start
    // ------------------------------------------------------------------

    async fn start_session(self: &Arc<Self>, payload: InitPayload) -> Result<()> {
        let policy = self.registry.select(&payload);
        info!(
            session_id = %payload.session_id,
            "Starting session with '{}' policy", policy.name()
        );

        let script = resolve_script_path(&payload.script_path, is_container_mode());
        if !script.exists() {
            return Err(Error::Validation(format!(
                "Script path not found: {}",
                script.display()
            )));
        }

        let spawn = policy.adapter_spawn_config(&payload)?;
        if payload.dry_run_spawn {
            let command = spawn.command_line();
            info!("Dry run, adapter command: {}", command);
            self.send(ProxyMessage::dry_run_complete(
                &payload.session_id,
                command,
                script.display().to_string(),
            ))
            .await;
            self.set_state(ProxyState::Terminated);
            return Ok(());
        }

        if payload.adapter_command.is_none() {
            let timeout = Duration::from_millis(self.config.process.validation_timeout_ms);
            if !policy
                .validate_executable(&payload.executable_path, timeout)
                .await
            {
                warn!(
                    "Executable '{}' did not pass {} validation; spawning anyway",
                    payload.executable_path,
                    policy.name()
                );
            }
        }

        let connection_config = self.config.connection_for(policy.name());
        let tracker = Arc::new(self.request_tracker(&payload.session_id, &connection_config));
        let connection = Arc::new(ConnectionManager::tcp(
            connection_config,
            Some(policy.clone()),
        ));
        let launch_args = build_launch_args(&launch_options(&payload, policy.as_ref(), &script));
        let init_behavior = policy.initialization_behavior();

        {
            let mut slot = self.session();
            if self.state().is_stopping() {
                return Err(shut_down_during_init());
            }
            *slot = Some(Session {
                id: payload.session_id.clone(),
                adapter_state: policy.create_initial_state(),
                policy: policy.clone(),
                connection: connection.clone(),
                tracker,
                client: None,
                children: None,
                adapter: None,
                queued: Vec::new(),
                initial_breakpoints: payload.initial_breakpoints.clone(),
                launch_args,
                launch_pending: !init_behavior.send_launch_before_config,
                launch_started: false,
                launch_written: watch::channel(false).0,
                configured: false,
                dispatch: None,
                tasks: Vec::new(),
            });
        }

        // From here on a concurrent shutdown may take the session; whatever
        // is created after that point is released here instead
        let adapter = self.processes.spawn(&spawn).await?;
        let exit_watch = self.watch_adapter_exit(&payload.session_id, adapter.clone());
        let mut exit_watch = Some(exit_watch);
        let stored = self.with_session(|s| {
            s.adapter = Some(adapter.clone());
            s.tasks.extend(exit_watch.take());
        });
        if stored.is_none() {
            exit_watch.into_iter().for_each(|task| task.abort());
            self.processes.shutdown(&adapter).await;
            return Err(shut_down_during_init());
        }

        let client = connection
            .connect_with_retry(&payload.adapter_host, payload.adapter_port)
            .await?;

        let children = policy.supports_reverse_start_debugging().then(|| {
            Arc::new(ChildSessionManager::new(
                policy.clone(),
                connection.connector(),
                self.config.child.clone(),
                ChildTarget {
                    parent_session_id: payload.session_id.clone(),
                    host: payload.adapter_host.clone(),
                    port: payload.adapter_port,
                },
            ))
        });
        let child_forwarder = children.as_ref().map(|children| {
            tokio::spawn(forward_child_notifications(
                Arc::downgrade(self),
                children.subscribe(),
            ))
        });

        let handler: Arc<dyn DapEventHandler> = Arc::new(WorkerEvents {
            worker: Arc::downgrade(self),
        });
        let event_loop = connection.setup_event_handlers(&client, handler).await;

        let mut tasks: Vec<JoinHandle<()>> = std::iter::once(event_loop).chain(child_forwarder).collect();
        let stored = self.with_session(|s| {
            s.client = Some(client.clone());
            s.children = children;
            s.tasks.append(&mut tasks);
        });
        if stored.is_none() {
            tasks.iter().for_each(JoinHandle::abort);
            connection.disconnect(&client, true).await;
            return Err(shut_down_during_init());
        }
        self.start_dispatcher();

        let adapter_id = policy.normalize_adapter_id(policy.adapter_id());
        connection
            .initialize_session(&client, &payload.session_id, &adapter_id)
            .await?;

        let launch = self
            .with_session(|s| {
                s.policy
                    .update_state_on_response(requests::INITIALIZE, true, &mut s.adapter_state);
                let handling = s.policy.should_queue_command(requests::LAUNCH, &s.adapter_state);
                s.launch_pending |= handling.should_defer;
                if s.launch_pending {
                    debug!("Deferring 'launch' until after 'configurationDone'");
                    None
                } else {
                    s.start_launch()
                }
            })
            .flatten();
        self.state.send_if_modified(|state| {
            if state.is_stopping() {
                false
            } else {
                *state = ProxyState::Connected;
                true
            }
        });

        if let (Some(args), Some(handle)) = (launch, self.handle()) {
            self.spawn_launch(&handle, args);
        }

        self.flush_queued();
        Ok(())
    }

    fn request_tracker(&self, session_id: &str, config: &ConnectionConfig) -> CallbackRequestTracker {
        let sender = self.sender.clone();
        let session_id = session_id.to_string();
        CallbackRequestTracker::new(
            move |request_id, command| {
                let message = ProxyMessage::response_err(
                    &session_id,
                    request_id,
                    format!("Request '{}' timed out", command),
                );
                let sender = sender.clone();
                tokio::spawn(async move { sender.send(message).await });
            },
            Duration::from_millis(config.request_timeout_ms),
        )
    }

    fn watch_adapter_exit(self: &Arc<Self>, session_id: &str, adapter: SpawnedAdapter) -> JoinHandle<()> {
        let worker = Arc::downgrade(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let Some(exit) = adapter.wait().await else {
                return;
            };
            let Some(worker) = worker.upgrade() else {
                return;
            };
            if worker.state().is_stopping() {
                return;
            }
            warn!(
                "Adapter exited unexpectedly (code {:?}, signal {:?})",
                exit.code,
                exit.signal_name()
            );
            worker
                .send(ProxyMessage::adapter_exited(
                    session_id,
                    exit.code,
                    exit.signal_name(),
                ))
                .await;
        })
    }

    /// Send `launch` without waiting for its response.
    ///
    /// Some adapters only answer `launch` after `configurationDone`, which
    /// in turn waits for `initialized`.
    fn spawn_launch(self: &Arc<Self>, handle: &SessionHandle, args: Value) {
        self.with_session(|s| {
            s.policy
                .update_state_on_command(requests::LAUNCH, Some(&args), &mut s.adapter_state)
        });
        let worker = self.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            let sent = handle.connection.send_launch_request(&handle.client, args).await;
            worker.with_session(|s| s.launch_written.send_replace(true));
            let response = match sent {
                Ok(pending) => pending.wait().await,
                Err(e) => Err(e),
            };
            match response {
                Ok(_) => debug!("Adapter accepted 'launch'"),
                Err(e) if worker.state().is_stopping() => {
                    debug!("'launch' abandoned during shutdown: {}", e)
                }
                Err(e) => {
                    error!("Launch request failed: {}", e);
                    worker
                        .send(ProxyMessage::error(
                            &handle.id,
                            format!("Launch request failed: {}", e),
                        ))
                        .await;
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Configuration after `initialized`
    // ------------------------------------------------------------------

    async fn configure(self: Arc<Self>, event: Event) {
        let first = self.with_session(|s| {
            s.policy.update_state_on_event(
                events::INITIALIZED,
                event.body.as_ref(),
                &mut s.adapter_state,
            );
            !std::mem::replace(&mut s.configured, true)
        });
        if first != Some(true) {
            debug!("Ignoring repeated 'initialized'");
            return;
        }
        let Some(handle) = self.handle() else {
            return;
        };

        let breakpoints = self
            .with_session(|s| std::mem::take(&mut s.initial_breakpoints))
            .unwrap_or_default();
        for (file, breakpoints) in group_breakpoints(breakpoints) {
            match handle
                .connection
                .set_breakpoints(&handle.client, &file, breakpoints.clone())
                .await
            {
                Ok(_) => debug!("Set {} initial breakpoints in {}", breakpoints.len(), file),
                Err(e) => warn!("Failed to set initial breakpoints in {}: {}", file, e),
            }
            if let Some(children) = &handle.children {
                children.store_breakpoints(&file, breakpoints).await;
            }
        }

        if let Some(children) = &handle.children {
            let behavior = handle.policy.dap_client_behavior();
            let launch_args = self
                .with_session(|s| s.launch_args.clone())
                .unwrap_or(Value::Null);
            let defer = behavior.defer_parent_config_done
                && launch_args
                    .as_object()
                    .is_some_and(|args| handle.policy.should_defer_parent_config_done(args));
            if defer {
                wait_for_child(children, behavior.child_init_timeout).await;
            }
        }

        let launch_first = handle.policy.initialization_behavior().defer_config_done
            && self.with_session(|s| !s.launch_pending).unwrap_or(false);
        if launch_first {
            let mut written = handle.launch_written.clone();
            let timeout = handle.client.config().request_timeout;
            if tokio::time::timeout(timeout, written.wait_for(|sent| *sent))
                .await
                .is_err()
            {
                warn!("'launch' not sent within {:?}; sending 'configurationDone' anyway", timeout);
            }
        }

        if let Err(e) = handle.connection.send_configuration_done(&handle.client).await {
            if !self.state().is_stopping() {
                error!("'configurationDone' failed: {}", e);
                self.send(ProxyMessage::error(
                    &handle.id,
                    format!("configurationDone failed: {}", e),
                ))
                .await;
            }
            return;
        }

        let pending_launch = self
            .with_session(|s| {
                s.policy
                    .update_state_on_command(requests::CONFIGURATION_DONE, None, &mut s.adapter_state);
                if s.launch_pending {
                    s.start_launch()
                } else {
                    None
                }
            })
            .flatten();
        if let Some(args) = pending_launch {
            self.spawn_launch(&handle, args);
        }

        self.flush_queued();
        handle.connection.mark_running();
        info!("Adapter configured and launched");
        self.send(ProxyMessage::status(
            &handle.id,
            status::ADAPTER_CONFIGURED_AND_LAUNCHED,
        ))
        .await;
    }

    // ------------------------------------------------------------------
    // Forwarded requests
    // ------------------------------------------------------------------

    async fn handle_dap(self: &Arc<Self>, payload: DapPayload) {
        let command = QueuedCommand::new(payload.request_id, payload.dap_command, payload.dap_args);
        let accepted = self
            .with_session(|s| {
                let Some(dispatch) = s.dispatch.clone() else {
                    return false;
                };
                if s.policy.requires_command_queueing() {
                    let handling =
                        s.policy.should_queue_command(&command.command, &s.adapter_state);
                    if handling.should_queue || handling.should_defer {
                        debug!(
                            "Queueing '{}': {}",
                            command.command,
                            handling.reason.as_deref().unwrap_or("adapter not ready")
                        );
                        s.queued.push(command.clone());
                        return true;
                    }
                }
                if dispatch.send(command.clone()).is_err() {
                    debug!("Dispatcher gone, dropping '{}'", command.command);
                }
                true
            })
            .unwrap_or(false);

        if !accepted {
            self.send(ProxyMessage::response_err(
                &payload.session_id,
                &command.request_id,
                "DAP client not connected",
            ))
            .await;
        }
    }

    /// Spawn the task that writes forwarded requests in arrival order.
    fn start_dispatcher(self: &Arc<Self>) {
        let Some(handle) = self.handle() else {
            return;
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedCommand>();
        let worker = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let Some(worker) = worker.upgrade() else {
                    return;
                };
                worker.execute(&handle, command).await;
            }
        });
        self.with_session(|s| {
            s.dispatch = Some(tx);
            s.tasks.push(task);
        });
    }

    async fn execute(self: &Arc<Self>, handle: &SessionHandle, command: QueuedCommand) {
        if command.command == requests::SET_BREAKPOINTS {
            if let Some(children) = &handle.children {
                let args = command
                    .arguments
                    .clone()
                    .and_then(|args| {
                        serde_json::from_value::<SetBreakpointsArguments>(args)
                            .debug_ok("Unparseable setBreakpoints arguments")
                    });
                if let Some(path) = args.as_ref().and_then(|a| a.source.path.clone()) {
                    let breakpoints = args.and_then(|a| a.breakpoints).unwrap_or_default();
                    children.store_breakpoints(&path, breakpoints).await;
                }
            }
        }

        let client = route(handle, &command.command);
        self.with_session(|s| {
            s.policy.update_state_on_command(
                &command.command,
                command.arguments.as_ref(),
                &mut s.adapter_state,
            )
        });

        handle.tracker.track(&command.request_id, &command.command, None);
        // Only the write is awaited here; the response is awaited in its own
        // task so a slow reply does not hold up the next request.
        let started = client
            .start_request(
                command.command.clone(),
                command.arguments.clone(),
                client.config().request_timeout,
            )
            .await;

        let worker = self.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            let result = match started {
                Ok(pending) => pending.wait().await,
                Err(e) => Err(e),
            };
            worker.finish(&handle, command, result).await;
        });
    }

    async fn finish(
        self: &Arc<Self>,
        handle: &SessionHandle,
        command: QueuedCommand,
        result: Result<Response>,
    ) {
        self.with_session(|s| {
            s.policy
                .update_state_on_response(&command.command, result.is_ok(), &mut s.adapter_state)
        });

        if !handle.tracker.complete(&command.request_id) {
            debug!(
                "Discarding late response for '{}' ({})",
                command.command, command.request_id
            );
            return;
        }

        let message = match result {
            Ok(response) => ProxyMessage::response_ok(&handle.id, &command.request_id, response),
            Err(e) => {
                debug!("'{}' failed: {}", command.command, e);
                ProxyMessage::response_err(&handle.id, &command.request_id, e.to_string())
            }
        };
        self.send(message).await;

        if handle.policy.requires_command_queueing() {
            self.flush_queued();
        }
    }

    /// Dispatch queued commands the policy now allows, in policy order.
    fn flush_queued(&self) {
        self.with_session(|s| {
            if s.queued.is_empty() {
                return;
            }
            let Some(dispatch) = s.dispatch.clone() else {
                return;
            };
            let (ready, waiting): (Vec<_>, Vec<_>) =
                std::mem::take(&mut s.queued).into_iter().partition(|c| {
                    let handling = s.policy.should_queue_command(&c.command, &s.adapter_state);
                    !handling.should_queue && !handling.should_defer
                });
            s.queued = waiting;
            if ready.is_empty() {
                return;
            }
            let ordered = s.policy.process_queued_commands(ready);
            info!("Flushing {} queued commands", ordered.len());
            for command in ordered {
                if dispatch.send(command).is_err() {
                    debug!("Dispatcher gone, dropping queued commands");
                    break;
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    async fn forward_event(&self, event: Event) {
        let session_id = self.session_id();
        self.send(ProxyMessage::event(session_id, event.event, event.body))
            .await;
    }

    fn spawn_shutdown(self: &Arc<Self>) {
        let worker = self.clone();
        tokio::spawn(async move { worker.shutdown().await });
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    async fn shutdown(&self) {
        let started = self.state.send_if_modified(|state| {
            if state.is_stopping() {
                false
            } else {
                *state = ProxyState::ShuttingDown;
                true
            }
        });
        if !started {
            return;
        }

        info!("Shutting down proxy worker");
        self.teardown().await;
        self.set_state(ProxyState::Terminated);
        info!("Proxy worker terminated");
    }

    /// Release everything the session started.
    async fn teardown(&self) {
        let Some(session) = self.session().take() else {
            return;
        };

        for task in &session.tasks {
            task.abort();
        }
        session.tracker.clear();
        if let Some(children) = &session.children {
            children.shutdown().await;
        }
        if let Some(client) = &session.client {
            session.connection.disconnect(client, true).await;
        }
        if let Some(adapter) = &session.adapter {
            self.processes.shutdown(adapter).await;
        }
    }
}

fn shut_down_during_init() -> Error {
    Error::InvalidState("proxy shut down during init".to_string())
}

/// Active child client for child-routed commands, else the parent
fn route(handle: &SessionHandle, command: &str) -> Arc<DapClient> {
    let child = handle
        .children
        .as_ref()
        .filter(|children| children.should_route_to_child(command))
        .and_then(|children| children.active_child());
    match child {
        Some(child) => {
            debug!("Routing '{}' to child {}", command, child.pending_id());
            child.client().clone()
        }
        None => handle.client.clone(),
    }
}

fn launch_options(payload: &InitPayload, policy: &dyn AdapterPolicy, script: &Path) -> LaunchOptions {
    let behavior = policy.initialization_behavior();
    LaunchOptions {
        program: script.to_path_buf(),
        args: payload.script_args.clone(),
        stop_on_entry: payload.stop_on_entry.or(behavior.default_stop_on_entry),
        just_my_code: payload.just_my_code,
        launch_config: payload.launch_config.clone(),
        adapter_type: Some(policy.normalize_adapter_id(policy.adapter_id())),
        runtime_executable: behavior
            .add_runtime_executable
            .then(|| policy.resolve_executable_path(Some(&payload.executable_path)))
            .flatten(),
    }
}

/// Initial breakpoints grouped per file, files in sorted order
fn group_breakpoints(breakpoints: Vec<InitialBreakpoint>) -> BTreeMap<String, Vec<SourceBreakpoint>> {
    let mut grouped: BTreeMap<String, Vec<SourceBreakpoint>> = BTreeMap::new();
    for bp in breakpoints {
        let source = match bp.condition {
            Some(condition) => SourceBreakpoint::at_line(bp.line).with_condition(condition),
            None => SourceBreakpoint::at_line(bp.line),
        };
        grouped.entry(bp.file).or_default().push(source);
    }
    grouped
}

async fn wait_for_child(children: &ChildSessionManager, timeout: Duration) {
    let mut notifications = children.subscribe();
    if children.has_active_children() {
        return;
    }
    info!("Waiting up to {:?} for a child session before 'configurationDone'", timeout);
    let created = tokio::time::timeout(timeout, async {
        while let Some(notification) = notifications.recv().await {
            if matches!(notification, ChildNotification::ChildCreated { .. }) {
                return true;
            }
        }
        false
    })
    .await;
    if !matches!(created, Ok(true)) {
        warn!("No child session within {:?}, continuing", timeout);
    }
}

async fn forward_child_notifications(
    worker: Weak<WorkerInner>,
    mut notifications: mpsc::Receiver<ChildNotification>,
) {
    while let Some(notification) = notifications.recv().await {
        let Some(worker) = worker.upgrade() else {
            break;
        };
        match notification {
            ChildNotification::ChildEvent { pending_id, event } => {
                if CHILD_FORWARDED_EVENTS.contains(&event.event.as_str()) {
                    trace!("Child {} event '{}'", pending_id, event.event);
                    worker.forward_event(event).await;
                }
            }
            ChildNotification::ChildCreated { pending_id } => {
                info!("Child session {} adopted", pending_id);
            }
            ChildNotification::ChildError { pending_id, message } => {
                if !worker.state().is_stopping() {
                    worker
                        .send(ProxyMessage::error(
                            worker.session_id(),
                            format!("Child session {} failed: {}", pending_id, message),
                        ))
                        .await;
                }
            }
            ChildNotification::ChildClosed { pending_id, reason } => {
                debug!("Child session {} closed: {}", pending_id, reason);
            }
        }
    }
}

// ============================================================
// EVENT HANDLER
// ============================================================

struct WorkerEvents {
    worker: Weak<WorkerInner>,
}

impl WorkerEvents {
    fn worker(&self) -> Result<Arc<WorkerInner>> {
        self.worker
            .upgrade()
            .ok_or_else(|| Error::InvalidState("Proxy worker dropped".to_string()))
    }

    async fn forward(&self, event: Event) -> Result<()> {
        let worker = self.worker()?;
        if FORWARDED_EVENTS.contains(&event.event.as_str()) {
            worker.forward_event(event).await;
        }
        Ok(())
    }
}

#[async_trait]
impl DapEventHandler for WorkerEvents {
    async fn on_initialized(&self, event: Event) -> Result<()> {
        let worker = self.worker()?;
        tokio::spawn(worker.configure(event));
        Ok(())
    }

    async fn on_output(&self, event: Event) -> Result<()> {
        self.forward(event).await
    }

    async fn on_stopped(&self, event: Event) -> Result<()> {
        self.forward(event).await
    }

    async fn on_continued(&self, event: Event) -> Result<()> {
        self.forward(event).await
    }

    async fn on_thread(&self, event: Event) -> Result<()> {
        self.forward(event).await
    }

    async fn on_exited(&self, event: Event) -> Result<()> {
        self.forward(event).await
    }

    async fn on_terminated(&self, event: Event) -> Result<()> {
        let worker = self.worker()?;
        info!("Adapter reported 'terminated'");
        worker.forward_event(event).await;
        worker.spawn_shutdown();
        Ok(())
    }

    async fn on_other_event(&self, event: Event) -> Result<()> {
        trace!("Unforwarded adapter event '{}'", event.event);
        Ok(())
    }

    async fn on_child_session_requested(&self, request: ChildSessionRequest) -> Result<()> {
        let worker = self.worker()?;
        let Some(children) = worker.with_session(|s| s.children.clone()).flatten() else {
            debug!("Child session requested without a child manager");
            return Ok(());
        };
        let adoption = tokio::spawn(async move {
            let pending_id = request.pending_id.clone();
            match children.create_child_session(request).await {
                Ok(Some(_)) => debug!("Child {} ready", pending_id),
                Ok(None) => debug!("Child {} already adopted", pending_id),
                Err(e) => warn!("Child {} adoption failed: {}", pending_id, e),
            }
        });
        let mut adoption = Some(adoption);
        worker.with_session(|s| s.tasks.extend(adoption.take()));
        if let Some(orphan) = adoption {
            orphan.abort();
        }
        Ok(())
    }

    async fn on_error(&self, message: String) -> Result<()> {
        let worker = self.worker()?;
        error!("DAP client error: {}", message);
        if !worker.state().is_stopping() {
            worker
                .send(ProxyMessage::error(
                    worker.session_id(),
                    format!("DAP client error: {}", message),
                ))
                .await;
        }
        Ok(())
    }

    async fn on_close(&self, reason: String) -> Result<()> {
        let worker = self.worker()?;
        if worker.state().is_stopping() {
            return Ok(());
        }
        info!("DAP connection closed: {}", reason);
        worker
            .send(ProxyMessage::status(
                worker.session_id(),
                status::DAP_CONNECTION_CLOSED,
            ))
            .await;
        worker.spawn_shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::parse_command;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct RecordingSender {
        messages: AsyncMutex<Vec<ProxyMessage>>,
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send(&self, message: ProxyMessage) {
            self.messages.lock().await.push(message);
        }
    }

    fn worker() -> (ProxyWorker, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::default());
        let worker = ProxyWorker::new(ProxyConfig::default(), sender.clone());
        (worker, sender)
    }

    fn init_command(script: &Path, dry_run: bool) -> ProxyCommand {
        let line = serde_json::json!({
            "cmd": "init",
            "sessionId": "s1",
            "executablePath": "/usr/bin/python3",
            "adapterHost": "127.0.0.1",
            "adapterPort": 5678,
            "logDir": std::env::temp_dir().join("dapx-worker-test"),
            "scriptPath": script,
            "dryRunSpawn": dry_run,
        });
        parse_command(&line.to_string()).unwrap()
    }

    #[test]
    fn test_group_breakpoints_by_file() {
        let grouped = group_breakpoints(vec![
            InitialBreakpoint {
                file: "/b.py".to_string(),
                line: 3,
                condition: None,
            },
            InitialBreakpoint {
                file: "/a.py".to_string(),
                line: 1,
                condition: Some("x > 1".to_string()),
            },
            InitialBreakpoint {
                file: "/b.py".to_string(),
                line: 9,
                condition: None,
            },
        ]);
        let files: Vec<&str> = grouped.keys().map(String::as_str).collect();
        assert_eq!(files, vec!["/a.py", "/b.py"]);
        assert_eq!(grouped["/b.py"].len(), 2);
        assert_eq!(grouped["/a.py"][0].condition.as_deref(), Some("x > 1"));
    }

    #[tokio::test]
    async fn test_dap_before_init_is_rejected() {
        let (worker, sender) = worker();
        let command = parse_command(
            r#"{"cmd":"dap","sessionId":"s1","requestId":"r1","dapCommand":"threads"}"#,
        )
        .unwrap();
        worker.handle_command(command).await;

        let messages = sender.messages.lock().await;
        assert_eq!(
            messages[0],
            ProxyMessage::response_err("s1", "r1", "DAP client not connected")
        );
    }

    #[tokio::test]
    async fn test_dry_run_reports_command_and_terminates() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("app.py");
        std::fs::write(&script, "print('hi')\n").unwrap();

        let (worker, sender) = worker();
        worker.handle_command(init_command(&script, true)).await;

        assert_eq!(worker.state(), ProxyState::Terminated);
        let messages = sender.messages.lock().await;
        match &messages[0] {
            ProxyMessage::Status {
                status,
                command,
                script: reported,
                ..
            } => {
                assert_eq!(status, status::DRY_RUN_COMPLETE);
                let command = command.as_deref().unwrap();
                assert!(command.contains("-m debugpy.adapter"));
                assert!(command.contains("--port 5678"));
                assert_eq!(reported.as_deref(), Some(script.display().to_string().as_str()));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_script_resets_state() {
        let (worker, sender) = worker();
        worker
            .handle_command(init_command(Path::new("/nonexistent/dapx/app.py"), false))
            .await;

        assert_eq!(worker.state(), ProxyState::Uninitialized);
        let messages = sender.messages.lock().await;
        match &messages[0] {
            ProxyMessage::Error { message, .. } => {
                assert!(message.contains("Script path not found"), "{}", message)
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_init_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("app.py");
        std::fs::write(&script, "").unwrap();

        let (worker, sender) = worker();
        worker.handle_command(init_command(&script, true)).await;
        worker.handle_command(init_command(&script, true)).await;

        let messages = sender.messages.lock().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(
            messages[1],
            ProxyMessage::error("s1", "Invalid state for init: terminated")
        );
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let (worker, sender) = worker();
        let terminate =
            parse_command(r#"{"cmd":"terminate","sessionId":"s1"}"#).unwrap();
        worker.handle_command(terminate.clone()).await;
        worker.handle_command(terminate).await;

        assert_eq!(worker.state(), ProxyState::Terminated);
        let messages = sender.messages.lock().await;
        assert_eq!(messages.len(), 2);
        assert!(messages
            .iter()
            .all(|m| *m == ProxyMessage::status("s1", status::TERMINATED)));
    }
}
