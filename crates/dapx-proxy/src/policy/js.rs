//! js-debug (`pwa-node`)
//!
//! js-debug is the only multi-session adapter: every debuggable target
//! (the main process, workers, child processes) arrives as a
//! `startDebugging` reverse request carrying a `__pendingTargetId`, and the
//! proxy adopts it on a new connection. The parent connection does not
//! accept commands until `initialize` was answered, and `launch` must wait
//! for `configurationDone`.

use super::validate::probe;
use super::{
    command_mentions, custom_spawn_config, AdapterPolicy, AdapterSpecificState,
    ChildSessionRequest, ChildSessionStrategy, ChildStartRequest, CommandHandling,
    DapClientBehavior, InitializationBehavior, QueuedCommand, ReverseRequestResult,
};
use crate::constants::{requests, reverse_requests, PENDING_TARGET_ID_KEY};
use crate::control::{AdapterCommand, InitPayload};
use crate::error::{Error, Result};
use crate::process::AdapterSpawnConfig;
use crate::protocol::{Request, StackFrame};
use async_trait::async_trait;
use dapx_config::constants::DEFAULT_CHILD_INIT_TIMEOUT_MS;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_JS_ADAPTER_TYPE: &str = "pwa-node";

/// Path to a js-debug `vsDebugServer` script
pub const JS_DEBUG_SERVER_ENV: &str = "DAPX_JS_DEBUG_SERVER";

const JS_DEBUG_SERVER_FILES: &[&str] = &["vsDebugServer.cjs", "vsDebugServer.js"];

/// Commands addressed to the debuggee rather than the session
const CHILD_ROUTED_COMMANDS: &[&str] = &[
    requests::THREADS,
    requests::PAUSE,
    requests::CONTINUE,
    requests::NEXT,
    requests::STEP_IN,
    requests::STEP_OUT,
    requests::STACK_TRACE,
    requests::SCOPES,
    requests::VARIABLES,
    requests::EVALUATE,
    "setVariable",
    "source",
    "loadedSources",
    "exceptionInfo",
];

/// Replayed first, in this order, before configurationDone
const CONFIG_COMMANDS: &[&str] = &[
    requests::SET_BREAKPOINTS,
    requests::SET_FUNCTION_BREAKPOINTS,
    requests::SET_EXCEPTION_BREAKPOINTS,
    requests::SET_DATA_BREAKPOINTS,
    requests::SET_INSTRUCTION_BREAKPOINTS,
];

#[derive(Debug, Default, Clone, Copy)]
pub struct JsDebugPolicy;

fn is_start_command(command: &str) -> bool {
    command == requests::LAUNCH || command == requests::ATTACH
}

/// Flush rank: configuration, configurationDone, start, everything else
fn flush_rank(command: &str) -> u8 {
    if CONFIG_COMMANDS.contains(&command) {
        0
    } else if command == requests::CONFIGURATION_DONE {
        1
    } else if is_start_command(command) {
        2
    } else {
        3
    }
}

#[async_trait]
impl AdapterPolicy for JsDebugPolicy {
    fn name(&self) -> &'static str {
        "javascript"
    }

    fn adapter_id(&self) -> &'static str {
        DEFAULT_JS_ADAPTER_TYPE
    }

    fn normalize_adapter_id(&self, adapter_id: &str) -> String {
        match adapter_id {
            "javascript" | "node" | "js" => DEFAULT_JS_ADAPTER_TYPE.to_string(),
            other => other.to_string(),
        }
    }

    fn supports_reverse_start_debugging(&self) -> bool {
        true
    }

    fn child_session_strategy(&self) -> ChildSessionStrategy {
        ChildSessionStrategy::SpawnOnDemand
    }

    fn build_child_start_args(
        &self,
        pending_id: &str,
        parent_config: &Map<String, Value>,
    ) -> Result<ChildStartRequest> {
        if pending_id.is_empty() {
            return Err(Error::Validation(format!("{} is empty", PENDING_TARGET_ID_KEY)));
        }
        let adapter_type = parent_config
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_JS_ADAPTER_TYPE);
        Ok(ChildStartRequest {
            command: requests::ATTACH.to_string(),
            arguments: json!({
                "type": adapter_type,
                "request": "attach",
                "__pendingTargetId": pending_id,
                "continueOnAttach": true,
            }),
        })
    }

    // js-debug names the scope "Local: <function>"
    fn local_scope_names(&self) -> &'static [&'static str] {
        &["Local", "Locals"]
    }

    fn is_local_scope(&self, scope_name: &str) -> bool {
        self.local_scope_names().contains(&scope_name) || scope_name.starts_with("Local:")
    }

    fn is_special_variable(&self, name: &str) -> bool {
        name == "this" || name == "__proto__"
    }

    fn is_internal_frame(&self, frame: &StackFrame) -> bool {
        let file = frame.file();
        file.starts_with("<node_internals>") || file.starts_with("node:internal")
    }

    /// Keeps the first frame when every frame is internal.
    fn filter_stack_frames(&self, frames: &[StackFrame], include_internals: bool) -> Vec<StackFrame> {
        if include_internals {
            return frames.to_vec();
        }
        let filtered: Vec<StackFrame> = frames
            .iter()
            .filter(|frame| !self.is_internal_frame(frame))
            .cloned()
            .collect();
        if filtered.is_empty() {
            return frames.first().cloned().into_iter().collect();
        }
        filtered
    }

    fn default_executable(&self) -> Option<String> {
        Some("node".to_string())
    }

    async fn validate_executable(&self, path: &str, timeout: Duration) -> bool {
        probe(path, &["--version"], timeout)
            .await
            .is_some_and(|output| output.success && output.stdout.trim_start().starts_with('v'))
    }

    fn update_state_on_command(
        &self,
        command: &str,
        _arguments: Option<&Value>,
        state: &mut AdapterSpecificState,
    ) {
        if command == requests::CONFIGURATION_DONE {
            state.configuration_done = true;
        } else if is_start_command(command) {
            state.start_sent = true;
        }
    }

    fn is_initialized(&self, state: &AdapterSpecificState) -> bool {
        state.initialize_responded && state.initialized
    }

    fn is_connected(&self, state: &AdapterSpecificState) -> bool {
        state.initialize_responded
    }

    fn requires_command_queueing(&self) -> bool {
        true
    }

    fn should_queue_command(&self, command: &str, state: &AdapterSpecificState) -> CommandHandling {
        if command == requests::INITIALIZE {
            return CommandHandling::send_now();
        }
        if !state.initialize_responded {
            return CommandHandling::queue("waiting for initialize response");
        }
        if is_start_command(command) && !state.configuration_done {
            return CommandHandling::defer("start request waits for configurationDone");
        }
        CommandHandling::send_now()
    }

    fn process_queued_commands(&self, mut commands: Vec<QueuedCommand>) -> Vec<QueuedCommand> {
        // Stable: commands of the same rank keep arrival order
        commands.sort_by_key(|c| flush_rank(&c.command));
        commands
    }

    fn matches_adapter(&self, command: &AdapterCommand) -> bool {
        command_mentions(command, &["js-debug", "vsdebugserver", "pwa-node"])
    }

    fn initialization_behavior(&self) -> InitializationBehavior {
        InitializationBehavior {
            send_launch_before_config: false,
            add_runtime_executable: true,
            ..Default::default()
        }
    }

    fn dap_client_behavior(&self) -> DapClientBehavior {
        DapClientBehavior {
            child_routed_commands: CHILD_ROUTED_COMMANDS,
            mirror_breakpoints: true,
            defer_parent_config_done: false,
            pause_after_child_attach: true,
            child_init_timeout: Duration::from_millis(DEFAULT_CHILD_INIT_TIMEOUT_MS),
            suppress_post_attach_config_done: false,
        }
    }

    fn handle_reverse_request(&self, request: &Request, adopted: &HashSet<String>) -> ReverseRequestResult {
        if request.command != reverse_requests::START_DEBUGGING {
            return super::default_reverse_request(request);
        }

        let configuration = request
            .arguments
            .as_ref()
            .and_then(|args| args.get("configuration"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let pending_id = configuration
            .get(PENDING_TARGET_ID_KEY)
            .and_then(Value::as_str)
            .map(str::to_string);

        let Some(pending_id) = pending_id else {
            debug!("startDebugging without {}", PENDING_TARGET_ID_KEY);
            return ReverseRequestResult::acknowledged();
        };
        if adopted.contains(&pending_id) {
            debug!("Target {} already adopted, acknowledging only", pending_id);
            return ReverseRequestResult::acknowledged();
        }

        info!("Adopting js-debug target {}", pending_id);
        ReverseRequestResult {
            create_child_session: true,
            child_config: Some(ChildSessionRequest {
                pending_id,
                parent_config: configuration,
            }),
            ..ReverseRequestResult::acknowledged()
        }
    }

    fn adapter_spawn_config(&self, payload: &InitPayload) -> Result<AdapterSpawnConfig> {
        match custom_spawn_config(payload) {
            Some(config) => Ok(config),
            None => self.server_spawn_config(payload, js_debug_server()),
        }
    }
}

impl JsDebugPolicy {
    // vsDebugServer takes the port and host positionally
    fn server_spawn_config(
        &self,
        payload: &InitPayload,
        server: Option<PathBuf>,
    ) -> Result<AdapterSpawnConfig> {
        let server = server.ok_or_else(|| {
            Error::NotSupported(format!(
                "js-debug server not found; set {} or pass adapterCommand",
                JS_DEBUG_SERVER_ENV
            ))
        })?;
        let node = self
            .resolve_executable_path(Some(&payload.executable_path))
            .unwrap_or_else(|| "node".to_string());
        Ok(AdapterSpawnConfig {
            command: node,
            args: vec![
                server.display().to_string(),
                payload.adapter_port.to_string(),
                payload.adapter_host.clone(),
            ],
            host: payload.adapter_host.clone(),
            port: payload.adapter_port,
            log_dir: payload.log_dir.clone(),
            cwd: None,
            env: HashMap::new(),
        })
    }
}

/// Vendored js-debug server: `$DAPX_JS_DEBUG_SERVER`, else
/// `vendor/js-debug/` next to the current executable or one level up
pub fn js_debug_server() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(JS_DEBUG_SERVER_ENV)
        .map(PathBuf::from)
        .filter(|path| path.is_file())
    {
        return Some(path);
    }
    let exe_dir = std::env::current_exe().ok()?.parent()?.to_path_buf();
    find_debug_server(&[exe_dir.clone(), exe_dir.join("..")])
}

fn find_debug_server(roots: &[PathBuf]) -> Option<PathBuf> {
    roots
        .iter()
        .flat_map(|root| {
            JS_DEBUG_SERVER_FILES
                .iter()
                .map(move |file| root.join("vendor").join("js-debug").join(file))
        })
        .find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    fn state(initialize_responded: bool, configuration_done: bool) -> AdapterSpecificState {
        AdapterSpecificState {
            initialize_responded,
            configuration_done,
            ..Default::default()
        }
    }

    #[test]
    fn test_child_start_args() {
        let parent = json!({"type": "node"}).as_object().cloned().unwrap();
        let start = JsDebugPolicy.build_child_start_args("abc", &parent).unwrap();
        assert_eq!(start.command, "attach");
        assert_eq!(
            start.arguments,
            json!({"type": "node", "request": "attach", "__pendingTargetId": "abc", "continueOnAttach": true})
        );

        let start = JsDebugPolicy.build_child_start_args("abc", &Map::new()).unwrap();
        assert_eq!(start.arguments["type"], "pwa-node");
        assert!(JsDebugPolicy.build_child_start_args("", &Map::new()).is_err());
    }

    #[test]
    fn test_first_frame_fallback() {
        let frames = vec![
            StackFrame::new(1, "processTicks", "<node_internals>/internal/process/task_queues", 95),
            StackFrame::new(2, "runMain", "<node_internals>/internal/modules/run_main", 1),
        ];
        let filtered = JsDebugPolicy.filter_stack_frames(&frames, false);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, 1);
    }

    #[test]
    fn test_internal_frames_removed() {
        let frames = vec![
            StackFrame::new(1, "handler", "/app/index.js", 3),
            StackFrame::new(2, "emit", "node:internal/events", 1),
            StackFrame::new(3, "main", "/app/index.js", 9),
        ];
        let ids: Vec<i64> = JsDebugPolicy
            .filter_stack_frames(&frames, false)
            .iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_locals_scope_with_function_suffix() {
        let (frames, scopes, variables) = locals_fixture("Local: handler", &["this", "req", "__proto__", "res"]);
        let locals = JsDebugPolicy.extract_local_variables(&frames, &scopes, &variables, false);
        assert_eq!(names(&locals), vec!["req", "res"]);
    }

    #[test]
    fn test_queueing_rules() {
        let policy = JsDebugPolicy;
        assert!(!policy.should_queue_command("initialize", &state(false, false)).should_queue);

        let before_init = policy.should_queue_command("threads", &state(false, false));
        assert!(before_init.should_queue);
        assert!(!before_init.should_defer);

        let launch = policy.should_queue_command("launch", &state(true, false));
        assert!(launch.should_queue && launch.should_defer);

        assert!(!policy.should_queue_command("launch", &state(true, true)).should_queue);
        assert!(!policy.should_queue_command("threads", &state(true, false)).should_queue);
    }

    #[test]
    fn test_queued_command_flush_order() {
        let queued = ["threads", "launch", "configurationDone", "setBreakpoints", "evaluate", "setExceptionBreakpoints"]
            .iter()
            .enumerate()
            .map(|(i, c)| QueuedCommand::new(i.to_string(), *c, None))
            .collect();
        let order: Vec<String> = JsDebugPolicy
            .process_queued_commands(queued)
            .into_iter()
            .map(|c| c.command)
            .collect();
        assert_eq!(
            order,
            vec!["setBreakpoints", "setExceptionBreakpoints", "configurationDone", "launch", "threads", "evaluate"]
        );
    }

    #[test]
    fn test_connected_after_initialize_response() {
        let policy = JsDebugPolicy;
        let mut state = policy.create_initial_state();
        policy.update_state_on_response("initialize", true, &mut state);
        assert!(policy.is_connected(&state));
        assert!(!policy.is_initialized(&state));

        policy.update_state_on_event("initialized", None, &mut state);
        policy.update_state_on_command("launch", None, &mut state);
        assert!(policy.is_initialized(&state));
        assert!(state.start_sent);
    }

    #[test]
    fn test_start_debugging_adoption() {
        let request = Request::new(5, "startDebugging").with_arguments(json!({
            "request": "attach",
            "configuration": {"type": "pwa-node", "__pendingTargetId": "t1"}
        }));

        let result = JsDebugPolicy.handle_reverse_request(&request, &HashSet::new());
        assert!(result.handled && result.create_child_session);
        assert_eq!(result.child_config.unwrap().pending_id, "t1");

        let adopted = HashSet::from(["t1".to_string()]);
        let again = JsDebugPolicy.handle_reverse_request(&request, &adopted);
        assert!(again.handled);
        assert!(!again.create_child_session);
    }

    #[test]
    fn test_normalize_adapter_id() {
        assert_eq!(JsDebugPolicy.normalize_adapter_id("javascript"), "pwa-node");
        assert_eq!(JsDebugPolicy.normalize_adapter_id("pwa-chrome"), "pwa-chrome");
    }

    #[test]
    fn test_routes_debuggee_commands_only() {
        let behavior = JsDebugPolicy.dap_client_behavior();
        assert!(behavior.child_routed_commands.contains(&"stackTrace"));
        assert!(!behavior.child_routed_commands.contains(&"launch"));
        assert!(behavior.mirror_breakpoints);
    }

    #[test]
    fn test_default_spawn_runs_vendored_server() {
        let server = PathBuf::from("/opt/dapx/vendor/js-debug/vsDebugServer.cjs");
        let config = JsDebugPolicy
            .server_spawn_config(&payload(), Some(server))
            .unwrap();
        assert_eq!(
            config.command_line(),
            "/usr/bin/backend /opt/dapx/vendor/js-debug/vsDebugServer.cjs 5678 127.0.0.1"
        );
        assert_eq!(config.port, 5678);

        let missing = JsDebugPolicy.server_spawn_config(&payload(), None);
        assert!(matches!(missing, Err(Error::NotSupported(_))));
    }

    #[test]
    fn test_find_debug_server_prefers_cjs() {
        let dir = tempfile::TempDir::new().unwrap();
        let empty = dir.path().join("bin");
        let vendor = dir.path().join("vendor").join("js-debug");
        std::fs::create_dir_all(&vendor).unwrap();
        assert_eq!(find_debug_server(&[dir.path().to_path_buf()]), None);

        std::fs::write(vendor.join("vsDebugServer.js"), "").unwrap();
        std::fs::write(vendor.join("vsDebugServer.cjs"), "").unwrap();
        assert_eq!(
            find_debug_server(&[empty, dir.path().to_path_buf()]),
            Some(vendor.join("vsDebugServer.cjs"))
        );
    }

    #[test]
    fn test_custom_adapter_command_wins() {
        let mut custom = payload();
        custom.adapter_command = Some(adapter_command("node", &["/js-debug/src/dapDebugServer.js", "5678"]));
        let config = JsDebugPolicy.adapter_spawn_config(&custom).unwrap();
        assert!(JsDebugPolicy.matches_adapter(&custom.adapter_command.unwrap()));
        assert_eq!(config.command, "node");
    }
}
