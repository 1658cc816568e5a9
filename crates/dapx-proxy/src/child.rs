//! Child session management
//!
//! Multi-session adapters (js-debug) ask for secondary sessions through
//! `startDebugging`. Each adopted target gets its own connection to the
//! adapter, its own handshake, and its events are re-emitted to the
//! parent as [`ChildNotification::ChildEvent`].
//!
//! Adoption is serialized per parent: a second `create_child_session` for
//! a pending id that is being (or was) adopted waits for the first one and
//! then returns without creating anything.

use crate::client::{ClientEvent, DapClient};
use crate::connection::DapConnector;
use crate::constants::{client, events, requests};
use crate::error::{Error, Result};
use crate::policy::{AdapterPolicy, ChildSessionRequest};
use crate::protocol::{
    DisconnectArguments, Event, InitializeRequestArguments, SetBreakpointsArguments, Source,
    SourceBreakpoint, ThreadsResponseBody,
};
use dapx_config::constants::{DEFAULT_DISCONNECT_TIMEOUT_MS, DEFAULT_EVENT_CHANNEL_CAPACITY};
use dapx_config::ChildSessionConfig;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the manager reports to the parent session
#[derive(Debug, Clone, PartialEq)]
pub enum ChildNotification {
    ChildCreated { pending_id: String },
    ChildEvent { pending_id: String, event: Event },
    ChildError { pending_id: String, message: String },
    ChildClosed { pending_id: String, reason: String },
}

/// One adopted child connection
pub struct ChildSession {
    pending_id: String,
    parent_session_id: String,
    client: Arc<DapClient>,
    ready: AtomicBool,
    stopped: watch::Receiver<bool>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ChildSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildSession")
            .field("pending_id", &self.pending_id)
            .field("parent_session_id", &self.parent_session_id)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl ChildSession {
    pub fn pending_id(&self) -> &str {
        &self.pending_id
    }

    pub fn parent_session_id(&self) -> &str {
        &self.parent_session_id
    }

    pub fn client(&self) -> &Arc<DapClient> {
        &self.client
    }

    /// The child reported readiness during its handshake
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Last `stopped`/`continued` seen on the child
    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    fn abort_forwarder(&self) {
        if let Some(handle) = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct ChildState {
    adopted: HashSet<String>,
    /// Adoption order; the last live one is active
    children: Vec<Arc<ChildSession>>,
    breakpoints: HashMap<String, Vec<SourceBreakpoint>>,
    shut_down: bool,
}

#[derive(Default)]
struct Notifier {
    subscribers: Mutex<Vec<mpsc::Sender<ChildNotification>>>,
}

impl Notifier {
    fn notify(&self, notification: ChildNotification) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| match tx.try_send(notification.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Child notification dropped for slow subscriber");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// Where children connect and how the parent session is named
#[derive(Debug, Clone)]
pub struct ChildTarget {
    pub parent_session_id: String,
    pub host: String,
    pub port: u16,
}

/// Creates, tracks and routes to child sessions of one parent
pub struct ChildSessionManager {
    policy: Arc<dyn AdapterPolicy>,
    connector: Arc<dyn DapConnector>,
    config: ChildSessionConfig,
    target: ChildTarget,
    adoption: tokio::sync::Mutex<()>,
    state: Arc<Mutex<ChildState>>,
    notifier: Arc<Notifier>,
}

impl std::fmt::Debug for ChildSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildSessionManager")
            .field("policy", &self.policy.name())
            .field("target", &self.target)
            .finish()
    }
}

impl ChildSessionManager {
    pub fn new(
        policy: Arc<dyn AdapterPolicy>,
        connector: Arc<dyn DapConnector>,
        config: ChildSessionConfig,
        target: ChildTarget,
    ) -> Self {
        Self {
            policy,
            connector,
            config,
            target,
            adoption: tokio::sync::Mutex::new(()),
            state: Arc::new(Mutex::new(ChildState::default())),
            notifier: Arc::new(Notifier::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChildState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> mpsc::Receiver<ChildNotification> {
        let (tx, rx) = mpsc::channel(DEFAULT_EVENT_CHANNEL_CAPACITY);
        self.notifier
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Adopt a pending target.
    ///
    /// Returns `Ok(None)` when the id was already adopted (including by a
    /// concurrent call that got there first).
    pub async fn create_child_session(
        &self,
        request: ChildSessionRequest,
    ) -> Result<Option<Arc<ChildSession>>> {
        let _adoption = self.adoption.lock().await;
        let pending_id = request.pending_id.clone();

        {
            let mut state = self.state();
            if state.shut_down {
                return Err(Error::InvalidState(
                    "child session manager is shut down".to_string(),
                ));
            }
            if !state.adopted.insert(pending_id.clone()) {
                debug!("Child {} already adopted, skipping", pending_id);
                return Ok(None);
            }
        }

        info!(
            "Creating child session {} for parent {}",
            pending_id, self.target.parent_session_id
        );
        match self.adopt(&request).await {
            Ok(child) => {
                // shutdown() may have run while the handshake was in flight
                let shut_down = {
                    let mut state = self.state();
                    if !state.shut_down {
                        state.children.push(child.clone());
                    }
                    state.shut_down
                };
                if shut_down {
                    warn!("Shut down while adopting child {}, disconnecting it", pending_id);
                    disconnect_child(&child).await;
                    return Err(Error::InvalidState(
                        "child session manager is shut down".to_string(),
                    ));
                }
                self.notifier.notify(ChildNotification::ChildCreated {
                    pending_id: pending_id.clone(),
                });
                if self.policy.dap_client_behavior().pause_after_child_attach {
                    tokio::spawn(pause_after_attach(child.clone(), self.config.clone()));
                }
                Ok(Some(child))
            }
            Err(e) => {
                warn!("Child session {} failed: {}", pending_id, e);
                self.state().adopted.remove(&pending_id);
                self.notifier.notify(ChildNotification::ChildError {
                    pending_id,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn adopt(&self, request: &ChildSessionRequest) -> Result<Arc<ChildSession>> {
        let behavior = self.policy.dap_client_behavior();
        let start = self
            .policy
            .build_child_start_args(&request.pending_id, &request.parent_config)?;

        let client = Arc::new(
            self.connector
                .connect(&self.target.host, self.target.port)
                .await?,
        );
        let mut events = HandshakeEvents::new(client.subscribe().await);

        let result = async {
            let init_args = InitializeRequestArguments {
                client_id: Some(format!("{}-{}", client::CHILD_CLIENT_ID_PREFIX, request.pending_id)),
                client_name: Some(client::CLIENT_NAME.to_string()),
                adapter_id: self.policy.adapter_id().to_string(),
                locale: Some(client::LOCALE.to_string()),
                lines_start_at1: Some(true),
                columns_start_at1: Some(true),
                path_format: Some(client::PATH_FORMAT.to_string()),
                supports_variable_type: Some(true),
                supports_run_in_terminal_request: Some(false),
                supports_start_debugging_request: Some(true),
            };
            client
                .send_request(requests::INITIALIZE, Some(serde_json::to_value(init_args)?))
                .await?;

            let policy = self.policy.clone();
            let ready = events
                .wait_for(|e| policy.is_child_ready_event(e), behavior.child_init_timeout)
                .await;
            if !ready {
                warn!(
                    "Child {} did not report readiness within {:?}",
                    request.pending_id, behavior.child_init_timeout
                );
            }

            self.send_configuration(&client).await;
            if !behavior.suppress_post_attach_config_done {
                client
                    .send_request(requests::CONFIGURATION_DONE, Some(json!({})))
                    .await?;
            }

            self.send_start_with_retry(&client, &start.command, start.arguments.clone())
                .await?;

            let post_attach_wait = Duration::from_millis(self.config.post_attach_init_wait_ms);
            if events
                .wait_for(|e| e.event == events::INITIALIZED, post_attach_wait)
                .await
                && behavior.mirror_breakpoints
            {
                debug!("Child {} re-initialized after attach", request.pending_id);
                self.send_configuration(&client).await;
            }
            Ok::<bool, Error>(ready)
        }
        .await;

        let ready = match result {
            Ok(ready) => ready,
            Err(e) => {
                client.shutdown("Child handshake failed").await;
                return Err(e);
            }
        };

        let (stopped_tx, stopped_rx) = watch::channel(false);
        let child = Arc::new(ChildSession {
            pending_id: request.pending_id.clone(),
            parent_session_id: self.target.parent_session_id.clone(),
            client,
            ready: AtomicBool::new(ready),
            stopped: stopped_rx,
            forwarder: Mutex::new(None),
        });

        let forwarder = tokio::spawn(forward_child_events(
            events,
            stopped_tx,
            request.pending_id.clone(),
            self.state.clone(),
            self.notifier.clone(),
        ));
        *child
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(forwarder);
        Ok(child)
    }

    /// Exception filters and mirrored breakpoints; failures are logged.
    async fn send_configuration(&self, client: &DapClient) {
        if let Err(e) = client
            .send_request(
                requests::SET_EXCEPTION_BREAKPOINTS,
                Some(json!({ "filters": [] })),
            )
            .await
        {
            warn!("Child setExceptionBreakpoints failed: {}", e);
        }

        if !self.policy.dap_client_behavior().mirror_breakpoints {
            return;
        }
        let breakpoints: Vec<(String, Vec<SourceBreakpoint>)> = self
            .state()
            .breakpoints
            .iter()
            .map(|(file, bps)| (file.clone(), bps.clone()))
            .collect();
        for (file, bps) in breakpoints {
            if let Err(e) = send_breakpoints(client, &file, bps).await {
                warn!("Mirroring breakpoints for {} failed: {}", file, e);
            }
        }
    }

    async fn send_start_with_retry(
        &self,
        client: &DapClient,
        command: &str,
        arguments: serde_json::Value,
    ) -> Result<()> {
        let attempts = self.config.attach_max_retries.max(1);
        let timeout = Duration::from_millis(self.config.attach_timeout_ms);
        let interval = Duration::from_millis(self.config.attach_retry_interval_ms);

        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match client
                .send_request_with_timeout(command, Some(arguments.clone()), timeout)
                .await
            {
                Ok(_) => {
                    debug!("Child '{}' succeeded on attempt {}", command, attempt);
                    return Ok(());
                }
                Err(e @ Error::Disconnected(_)) => return Err(e),
                Err(e) => {
                    last_error = e.to_string();
                    debug!("Child '{}' attempt {} failed: {}", command, attempt, last_error);
                    if attempt < attempts {
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        }
        Err(Error::Communication(format!(
            "Failed to attach child after {} attempts: {}",
            attempts, last_error
        )))
    }

    /// Whether the policy routes `command` to the debuggee session
    pub fn should_route_to_child(&self, command: &str) -> bool {
        self.policy
            .dap_client_behavior()
            .child_routed_commands
            .contains(&command)
    }

    /// Remember the latest breakpoints for a file and mirror them to the
    /// active child. No-op unless the policy mirrors breakpoints.
    pub async fn store_breakpoints(&self, file: &str, breakpoints: Vec<SourceBreakpoint>) {
        if !self.policy.dap_client_behavior().mirror_breakpoints {
            return;
        }
        let file = std::path::absolute(Path::new(file))
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| file.to_string());
        self.state()
            .breakpoints
            .insert(file.clone(), breakpoints.clone());

        if let Some(child) = self.active_child() {
            if let Err(e) = send_breakpoints(child.client(), &file, breakpoints).await {
                debug!("Mirroring breakpoints to child {} failed: {}", child.pending_id(), e);
            }
        }
    }

    pub fn stored_breakpoints(&self, file: &str) -> Option<Vec<SourceBreakpoint>> {
        self.state().breakpoints.get(file).cloned()
    }

    pub fn has_active_children(&self) -> bool {
        !self.state().children.is_empty()
    }

    /// Most recently adopted live child
    pub fn active_child(&self) -> Option<Arc<ChildSession>> {
        self.state().children.last().cloned()
    }

    pub fn child_count(&self) -> usize {
        self.state().children.len()
    }

    /// Disconnect every child and clear all state. Idempotent.
    pub async fn shutdown(&self) {
        let children = {
            let mut state = self.state();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.adopted.clear();
            state.breakpoints.clear();
            std::mem::take(&mut state.children)
        };
        if !children.is_empty() {
            info!("Shutting down {} child session(s)", children.len());
        }

        for child in children {
            disconnect_child(&child).await;
        }
        self.notifier
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

async fn disconnect_child(child: &ChildSession) {
    child.abort_forwarder();
    let args = DisconnectArguments {
        restart: None,
        terminate_debuggee: Some(true),
    };
    let disconnect = child.client.send_request_with_timeout(
        requests::DISCONNECT,
        serde_json::to_value(args).ok(),
        Duration::from_millis(DEFAULT_DISCONNECT_TIMEOUT_MS),
    );
    if let Err(e) = disconnect.await {
        debug!("Child {} disconnect failed: {}", child.pending_id, e);
    }
    child.client.shutdown("Child session shutdown").await;
}

async fn send_breakpoints(
    client: &DapClient,
    file: &str,
    breakpoints: Vec<SourceBreakpoint>,
) -> Result<()> {
    let args = SetBreakpointsArguments {
        source: Source::from_path(file),
        breakpoints: Some(breakpoints),
        source_modified: None,
    };
    client
        .send_request(requests::SET_BREAKPOINTS, Some(serde_json::to_value(args)?))
        .await?;
    Ok(())
}

/// Client events during the handshake; skipped events are kept for the
/// forwarder
struct HandshakeEvents {
    rx: mpsc::Receiver<ClientEvent>,
    backlog: VecDeque<ClientEvent>,
}

impl HandshakeEvents {
    fn new(rx: mpsc::Receiver<ClientEvent>) -> Self {
        Self {
            rx,
            backlog: VecDeque::new(),
        }
    }

    async fn wait_for<F>(&mut self, matches: F, timeout: Duration) -> bool
    where
        F: Fn(&Event) -> bool,
    {
        let wait = async {
            while let Some(event) = self.rx.recv().await {
                if let ClientEvent::Event(e) = &event {
                    if matches(e) {
                        return true;
                    }
                }
                let closed = matches!(event, ClientEvent::Closed(_));
                self.backlog.push_back(event);
                if closed {
                    return false;
                }
            }
            false
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    async fn next(&mut self) -> Option<ClientEvent> {
        match self.backlog.pop_front() {
            Some(event) => Some(event),
            None => self.rx.recv().await,
        }
    }
}

async fn forward_child_events(
    mut events: HandshakeEvents,
    stopped: watch::Sender<bool>,
    pending_id: String,
    state: Arc<Mutex<ChildState>>,
    notifier: Arc<Notifier>,
) {
    while let Some(event) = events.next().await {
        match event {
            ClientEvent::Event(event) => {
                match event.event.as_str() {
                    events::STOPPED => stopped.send_replace(true),
                    events::CONTINUED => stopped.send_replace(false),
                    _ => false,
                };
                notifier.notify(ChildNotification::ChildEvent {
                    pending_id: pending_id.clone(),
                    event,
                });
            }
            ClientEvent::ChildSessionRequested(request) => {
                debug!(
                    "Child {} requested nested session {}, ignoring",
                    pending_id, request.pending_id
                );
            }
            ClientEvent::Error(message) => {
                notifier.notify(ChildNotification::ChildError {
                    pending_id: pending_id.clone(),
                    message,
                });
            }
            ClientEvent::Closed(reason) => {
                info!("Child session {} closed: {}", pending_id, reason);
                state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .children
                    .retain(|c| c.pending_id != pending_id);
                notifier.notify(ChildNotification::ChildClosed {
                    pending_id: pending_id.clone(),
                    reason,
                });
                break;
            }
        }
    }
}

/// Make sure a freshly attached child ends up paused.
async fn pause_after_attach(child: Arc<ChildSession>, config: ChildSessionConfig) {
    let mut stopped = child.stopped.clone();
    let stop_wait = Duration::from_millis(config.stop_wait_ms);
    let stopped_in_time = matches!(
        tokio::time::timeout(stop_wait, stopped.wait_for(|s| *s)).await,
        Ok(Ok(_))
    );
    if stopped_in_time {
        debug!("Child {} stopped after attach", child.pending_id);
        return;
    }

    let threads_timeout = Duration::from_millis(config.threads_timeout_ms);
    let threads = match child
        .client
        .send_request_with_timeout(requests::THREADS, None, threads_timeout)
        .await
    {
        Ok(response) => response
            .body
            .and_then(|body| serde_json::from_value::<ThreadsResponseBody>(body).ok())
            .map(|body| body.threads)
            .unwrap_or_default(),
        Err(e) => {
            warn!("Child {} threads request failed: {}", child.pending_id, e);
            return;
        }
    };

    let Some(first) = threads.first() else {
        debug!("Child {} has no threads to pause", child.pending_id);
        return;
    };
    let mut thread_ids = vec![first.id];
    if first.id == 0 {
        thread_ids.push(1);
    }
    for thread_id in thread_ids {
        info!("Pausing child {} thread {}", child.pending_id, thread_id);
        if let Err(e) = child
            .client
            .send_request(requests::PAUSE, Some(json!({ "threadId": thread_id })))
            .await
        {
            warn!("Pausing child thread {} failed: {}", thread_id, e);
        }
    }
}
