//! Adapter policies
//!
//! A policy captures everything that differs between debug adapter
//! families: spawn command, handshake ordering, command queueing, scope
//! and variable naming, frame filtering and multi-session support. The
//! worker, the connection manager and the child session manager only see
//! [`AdapterPolicy`]; adding a backend means one new implementation plus a
//! [`PolicyRegistry`] entry.

mod dotnet;
mod go;
mod java;
mod js;
mod python;
mod registry;
mod rust;
pub mod validate;

pub use dotnet::DotnetPolicy;
pub use go::GoPolicy;
pub use java::JavaPolicy;
pub use js::JsDebugPolicy;
pub use python::PythonPolicy;
pub use registry::{DefaultAdapterPolicy, PolicyRegistry};
pub use rust::RustPolicy;

use crate::constants::{events, requests, reverse_requests};
use crate::control::InitPayload;
use crate::error::Result;
use crate::process::AdapterSpawnConfig;
use crate::protocol::{Event, Request, Scope, StackFrame, Variable};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Default time a child session has to report readiness
pub const DEFAULT_POLICY_CHILD_INIT_TIMEOUT_MS: u64 = 5_000;

/// How a policy obtains secondary sessions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChildSessionStrategy {
    /// Single-session adapter
    #[default]
    None,
    /// The adapter asks for a child via `startDebugging`; the proxy opens a
    /// new connection and adopts the pending target
    SpawnOnDemand,
}

/// Per-session readiness flags, mutated only through policy hooks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterSpecificState {
    /// The adapter sent `initialized`
    pub initialized: bool,
    /// `configurationDone` was sent
    pub configuration_done: bool,
    /// The `initialize` request got its response
    pub initialize_responded: bool,
    /// `launch` or `attach` was sent
    pub start_sent: bool,
}

/// Queueing decision for one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandHandling {
    pub should_queue: bool,
    /// Hold the command until `configurationDone` went out
    pub should_defer: bool,
    pub reason: Option<String>,
}

impl CommandHandling {
    pub fn send_now() -> Self {
        Self::default()
    }

    pub fn queue(reason: impl Into<String>) -> Self {
        Self {
            should_queue: true,
            should_defer: false,
            reason: Some(reason.into()),
        }
    }

    pub fn defer(reason: impl Into<String>) -> Self {
        Self {
            should_queue: true,
            should_defer: true,
            reason: Some(reason.into()),
        }
    }
}

/// A caller request held back until the adapter is ready
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCommand {
    pub request_id: String,
    pub command: String,
    pub arguments: Option<Value>,
}

impl QueuedCommand {
    pub fn new(request_id: impl Into<String>, command: impl Into<String>, arguments: Option<Value>) -> Self {
        Self {
            request_id: request_id.into(),
            command: command.into(),
            arguments,
        }
    }
}

/// Handshake ordering quirks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitializationBehavior {
    /// `configurationDone` is held until `launch` is on the wire
    pub defer_config_done: bool,
    /// stop-on-entry default when the caller gives none
    pub default_stop_on_entry: Option<bool>,
    /// Send launch right after the initialize response (the common case).
    /// When false, launch follows the `configurationDone` response.
    pub send_launch_before_config: bool,
    /// Add `runtimeExecutable` to launch arguments
    pub add_runtime_executable: bool,
}

/// Multi-session behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DapClientBehavior {
    /// Debuggee-scoped commands that go to the active child
    pub child_routed_commands: &'static [&'static str],
    pub mirror_breakpoints: bool,
    /// Parent `configurationDone` waits until a child attached
    pub defer_parent_config_done: bool,
    pub pause_after_child_attach: bool,
    pub child_init_timeout: Duration,
    /// Child handshake skips its own `configurationDone`
    pub suppress_post_attach_config_done: bool,
}

impl Default for DapClientBehavior {
    fn default() -> Self {
        Self {
            child_routed_commands: &[],
            mirror_breakpoints: false,
            defer_parent_config_done: false,
            pause_after_child_attach: false,
            child_init_timeout: Duration::from_millis(DEFAULT_POLICY_CHILD_INIT_TIMEOUT_MS),
            suppress_post_attach_config_done: false,
        }
    }
}

/// What the adapter asked for when it requested a secondary session
#[derive(Debug, Clone, PartialEq)]
pub struct ChildSessionRequest {
    pub pending_id: String,
    /// The `configuration` object of the `startDebugging` request
    pub parent_config: Map<String, Value>,
}

/// Answer to a reverse request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReverseRequestResult {
    pub handled: bool,
    pub response_body: Option<Value>,
    pub create_child_session: bool,
    pub child_config: Option<ChildSessionRequest>,
}

impl ReverseRequestResult {
    pub fn acknowledged() -> Self {
        Self {
            handled: true,
            response_body: Some(Value::Object(Map::new())),
            ..Default::default()
        }
    }

    pub fn unhandled() -> Self {
        Self::default()
    }
}

/// Request that starts a child session on its own connection
#[derive(Debug, Clone, PartialEq)]
pub struct ChildStartRequest {
    pub command: String,
    pub arguments: Value,
}

/// Acknowledge `runInTerminal`, leave everything else unhandled.
pub fn default_reverse_request(request: &Request) -> ReverseRequestResult {
    if request.command == reverse_requests::RUN_IN_TERMINAL {
        ReverseRequestResult::acknowledged()
    } else {
        ReverseRequestResult::unhandled()
    }
}

/// Spawn config for a caller-provided `adapterCommand`, used verbatim.
pub fn custom_spawn_config(payload: &InitPayload) -> Option<AdapterSpawnConfig> {
    let custom = payload.adapter_command.as_ref()?;
    Some(AdapterSpawnConfig {
        command: custom.command.clone(),
        args: custom.args.clone(),
        host: payload.adapter_host.clone(),
        port: payload.adapter_port,
        log_dir: payload.log_dir.clone(),
        cwd: None,
        env: custom.env.clone().unwrap_or_default(),
    })
}

/// Adapter family behavior consumed by the proxy core.
///
/// Every method is total: empty or partial inputs produce an empty or
/// default answer, never a panic.
#[async_trait]
pub trait AdapterPolicy: Send + Sync + std::fmt::Debug {
    /// Registry name (`python`, `go`, `javascript`, ...)
    fn name(&self) -> &'static str;

    /// DAP `adapterID` / launch `type`
    fn adapter_id(&self) -> &'static str;

    fn normalize_adapter_id(&self, adapter_id: &str) -> String {
        adapter_id.to_string()
    }

    // ------------------------------------------------------------------
    // Multi-session
    // ------------------------------------------------------------------

    fn supports_reverse_start_debugging(&self) -> bool {
        false
    }

    fn child_session_strategy(&self) -> ChildSessionStrategy {
        ChildSessionStrategy::None
    }

    fn should_defer_parent_config_done(&self, _parent_config: &Map<String, Value>) -> bool {
        false
    }

    fn build_child_start_args(
        &self,
        _pending_id: &str,
        _parent_config: &Map<String, Value>,
    ) -> Result<ChildStartRequest> {
        Err(crate::Error::NotSupported(format!(
            "{} does not support child sessions",
            self.name()
        )))
    }

    fn is_child_ready_event(&self, event: &Event) -> bool {
        event.event == events::INITIALIZED
    }

    // ------------------------------------------------------------------
    // Variables and frames
    // ------------------------------------------------------------------

    /// Scope names holding the top frame's locals
    fn local_scope_names(&self) -> &'static [&'static str];

    fn is_local_scope(&self, scope_name: &str) -> bool {
        self.local_scope_names().contains(&scope_name)
    }

    /// Adapter noise hidden unless special variables are requested
    fn is_special_variable(&self, _name: &str) -> bool {
        false
    }

    /// Locals of the top frame, in adapter order.
    ///
    /// `scopes` is keyed by frame id, `variables` by variables reference.
    fn extract_local_variables(
        &self,
        frames: &[StackFrame],
        scopes: &HashMap<i64, Vec<Scope>>,
        variables: &HashMap<i64, Vec<Variable>>,
        include_special: bool,
    ) -> Vec<Variable> {
        let Some(top) = frames.first() else {
            return Vec::new();
        };
        let Some(scope) = scopes
            .get(&top.id)
            .and_then(|s| s.iter().find(|scope| self.is_local_scope(&scope.name)))
        else {
            return Vec::new();
        };
        variables
            .get(&scope.variables_reference)
            .map(|vars| {
                vars.iter()
                    .filter(|v| include_special || !self.is_special_variable(&v.name))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Runtime or library frame
    fn is_internal_frame(&self, _frame: &StackFrame) -> bool {
        false
    }

    /// Drop internal frames; order of the rest is kept.
    fn filter_stack_frames(&self, frames: &[StackFrame], include_internals: bool) -> Vec<StackFrame> {
        if include_internals {
            return frames.to_vec();
        }
        frames
            .iter()
            .filter(|frame| !self.is_internal_frame(frame))
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Executable
    // ------------------------------------------------------------------

    /// Environment variable consulted when no path is provided
    fn executable_env_var(&self) -> Option<&'static str> {
        None
    }

    fn default_executable(&self) -> Option<String> {
        None
    }

    /// Provided path, else the policy env var, else the policy default.
    fn resolve_executable_path(&self, provided: Option<&str>) -> Option<String> {
        if let Some(path) = provided.filter(|p| !p.is_empty()) {
            return Some(path.to_string());
        }
        if let Some(path) = self
            .executable_env_var()
            .and_then(|var| std::env::var(var).ok())
            .filter(|p| !p.is_empty())
        {
            return Some(path);
        }
        self.default_executable()
    }

    /// Run the executable with a version flag and judge the result.
    async fn validate_executable(&self, path: &str, timeout: Duration) -> bool;

    // ------------------------------------------------------------------
    // Session state
    // ------------------------------------------------------------------

    fn create_initial_state(&self) -> AdapterSpecificState {
        AdapterSpecificState::default()
    }

    fn update_state_on_command(
        &self,
        command: &str,
        _arguments: Option<&Value>,
        state: &mut AdapterSpecificState,
    ) {
        if command == requests::CONFIGURATION_DONE {
            state.configuration_done = true;
        }
    }

    fn update_state_on_event(&self, event: &str, _body: Option<&Value>, state: &mut AdapterSpecificState) {
        if event == events::INITIALIZED {
            state.initialized = true;
        }
    }

    fn update_state_on_response(&self, command: &str, success: bool, state: &mut AdapterSpecificState) {
        if command == requests::INITIALIZE && success {
            state.initialize_responded = true;
        }
    }

    fn is_initialized(&self, state: &AdapterSpecificState) -> bool {
        state.initialized
    }

    fn is_connected(&self, state: &AdapterSpecificState) -> bool {
        state.initialized
    }

    // ------------------------------------------------------------------
    // Queueing
    // ------------------------------------------------------------------

    fn requires_command_queueing(&self) -> bool {
        false
    }

    fn should_queue_command(&self, _command: &str, _state: &AdapterSpecificState) -> CommandHandling {
        CommandHandling::send_now()
    }

    /// Order in which queued commands are replayed
    fn process_queued_commands(&self, commands: Vec<QueuedCommand>) -> Vec<QueuedCommand> {
        commands
    }

    // ------------------------------------------------------------------
    // Spawn and handshake
    // ------------------------------------------------------------------

    /// Whether a resolved adapter command belongs to this family
    fn matches_adapter(&self, command: &crate::control::AdapterCommand) -> bool;

    fn initialization_behavior(&self) -> InitializationBehavior {
        InitializationBehavior {
            send_launch_before_config: true,
            ..Default::default()
        }
    }

    fn dap_client_behavior(&self) -> DapClientBehavior {
        DapClientBehavior::default()
    }

    /// Answer an adapter-to-client request. `adopted` holds pending target
    /// ids already turned into children.
    fn handle_reverse_request(&self, request: &Request, _adopted: &HashSet<String>) -> ReverseRequestResult {
        default_reverse_request(request)
    }

    fn adapter_spawn_config(&self, payload: &InitPayload) -> Result<AdapterSpawnConfig>;
}

/// True when any of `needles` occurs in the command or its arguments
pub(crate) fn command_mentions(command: &crate::control::AdapterCommand, needles: &[&str]) -> bool {
    let haystacks = std::iter::once(command.command.as_str()).chain(command.args.iter().map(String::as_str));
    haystacks
        .map(str::to_lowercase)
        .any(|hay| needles.iter().any(|needle| hay.contains(needle)))
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::control::{AdapterCommand, InitPayload};
    use crate::protocol::{Scope, StackFrame, Variable};
    use std::collections::HashMap;
    use std::path::PathBuf;

    pub fn payload() -> InitPayload {
        InitPayload {
            session_id: "s1".to_string(),
            executable_path: "/usr/bin/backend".to_string(),
            adapter_host: "127.0.0.1".to_string(),
            adapter_port: 5678,
            log_dir: PathBuf::from("/tmp/logs"),
            script_path: PathBuf::from("/home/u/app.py"),
            script_args: Vec::new(),
            stop_on_entry: None,
            just_my_code: None,
            dry_run_spawn: false,
            initial_breakpoints: Vec::new(),
            adapter_command: None,
            language: None,
            launch_config: None,
        }
    }

    pub fn adapter_command(command: &str, args: &[&str]) -> AdapterCommand {
        AdapterCommand {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: None,
        }
    }

    /// One frame (id 1) whose scope `scope_name` holds `names`
    pub fn locals_fixture(
        scope_name: &str,
        names: &[&str],
    ) -> (Vec<StackFrame>, HashMap<i64, Vec<Scope>>, HashMap<i64, Vec<Variable>>) {
        let frames = vec![StackFrame::new(1, "main", "/src/app", 10)];
        let scopes = HashMap::from([(1, vec![Scope::new("Globals", 7), Scope::new(scope_name, 8)])]);
        let variables = HashMap::from([(
            8,
            names.iter().map(|n| Variable::new(*n, "1")).collect::<Vec<_>>(),
        )]);
        (frames, scopes, variables)
    }

    pub fn names(vars: &[Variable]) -> Vec<&str> {
        vars.iter().map(|v| v.name.as_str()).collect()
    }
}
