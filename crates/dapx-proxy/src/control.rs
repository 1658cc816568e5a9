//! Control messages between the embedding caller and the proxy
//!
//! Inbound commands (`init`, `dap`, `terminate`) arrive as JSON objects
//! tagged by `cmd`. This is the only place their schema is checked; the
//! rest of the engine trusts the typed payloads produced here.
//!
//! Outbound [`ProxyMessage`]s report status changes, forwarded responses,
//! forwarded events and errors back to the caller.

use crate::error::{Error, Result};
use crate::protocol::Response;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;

/// Session id used in outbound messages before `init` named one
pub const UNKNOWN_SESSION_ID: &str = "unknown";

// ============================================================
// INBOUND COMMANDS
// ============================================================

/// A validated command from the caller
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyCommand {
    Init(Box<InitPayload>),
    Dap(DapPayload),
    Terminate(TerminatePayload),
}

impl ProxyCommand {
    /// The `cmd` tag this command arrived with
    pub fn name(&self) -> &'static str {
        match self {
            ProxyCommand::Init(_) => "init",
            ProxyCommand::Dap(_) => "dap",
            ProxyCommand::Terminate(_) => "terminate",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            ProxyCommand::Init(p) => &p.session_id,
            ProxyCommand::Dap(p) => &p.session_id,
            ProxyCommand::Terminate(p) => &p.session_id,
        }
    }
}

/// Start a debug session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    pub session_id: String,
    /// Runtime or debugger executable (python interpreter, dlv, node, ...)
    #[serde(alias = "pythonPath")]
    pub executable_path: String,
    pub adapter_host: String,
    pub adapter_port: u16,
    pub log_dir: PathBuf,
    pub script_path: PathBuf,
    #[serde(default)]
    pub script_args: Vec<String>,
    #[serde(default)]
    pub stop_on_entry: Option<bool>,
    #[serde(default)]
    pub just_my_code: Option<bool>,
    #[serde(default)]
    pub dry_run_spawn: bool,
    #[serde(default)]
    pub initial_breakpoints: Vec<InitialBreakpoint>,
    /// Explicit adapter command, used verbatim instead of the policy default
    #[serde(default)]
    pub adapter_command: Option<AdapterCommand>,
    /// Language name selecting the adapter policy
    #[serde(default)]
    pub language: Option<String>,
    /// Extra launch arguments merged into the launch request
    #[serde(default)]
    pub launch_config: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialBreakpoint {
    pub file: String,
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// A fully specified adapter command line
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

/// Forward one DAP request to the adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DapPayload {
    pub session_id: String,
    /// Caller correlation id, echoed in the `dapResponse`
    pub request_id: String,
    pub dap_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dap_args: Option<Value>,
}

/// End the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminatePayload {
    pub session_id: String,
}

/// Parse and validate one command line from the caller.
pub fn parse_command(message: &str) -> Result<ProxyCommand> {
    let value: Value = serde_json::from_str(message)
        .map_err(|e| Error::Validation(format!("Failed to parse JSON message: {}", e)))?;
    parse_command_value(value)
}

/// Validate an already-decoded command object.
pub fn parse_command_value(value: Value) -> Result<ProxyCommand> {
    let Value::Object(obj) = value else {
        return Err(Error::Validation(format!(
            "Invalid message type: expected object, got {}",
            json_type_name(&value)
        )));
    };

    let cmd = match obj.get("cmd") {
        Some(Value::String(cmd)) if !cmd.is_empty() => cmd.clone(),
        other => {
            return Err(Error::Validation(format!(
                "Missing or invalid 'cmd' field: {}",
                display_value(other)
            )))
        }
    };

    match cmd.as_str() {
        "init" => validate_init(obj).map(|p| ProxyCommand::Init(Box::new(p))),
        "dap" => validate_dap(obj).map(ProxyCommand::Dap),
        "terminate" => validate_terminate(obj).map(ProxyCommand::Terminate),
        other => Err(Error::Validation(format!("Unknown command type: {}", other))),
    }
}

const INIT_REQUIRED_STRINGS: [&str; 5] = [
    "sessionId",
    "executablePath",
    "adapterHost",
    "logDir",
    "scriptPath",
];

fn validate_init(mut obj: Map<String, Value>) -> Result<InitPayload> {
    // Older callers name the interpreter `pythonPath`
    if !obj.contains_key("executablePath") {
        if let Some(python) = obj.remove("pythonPath") {
            obj.insert("executablePath".to_string(), python);
        }
    }

    for field in INIT_REQUIRED_STRINGS {
        require_non_empty_string(&obj, field, "Init")?;
    }

    let port_ok = obj
        .get("adapterPort")
        .and_then(Value::as_u64)
        .is_some_and(|port| (1..=65535).contains(&port));
    if !port_ok {
        return Err(Error::Validation(format!(
            "Init payload missing or invalid 'adapterPort': {}",
            display_value(obj.get("adapterPort"))
        )));
    }

    if let Some(args) = present(&obj, "scriptArgs") {
        let all_strings = args
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_string));
        if !all_strings {
            return Err(Error::Validation(
                "Init payload 'scriptArgs' must be an array of strings if provided".to_string(),
            ));
        }
    }

    for flag in ["stopOnEntry", "justMyCode", "dryRunSpawn"] {
        if present(&obj, flag).is_some_and(|v| !v.is_boolean()) {
            return Err(Error::Validation(format!(
                "Init payload '{}' must be a boolean if provided",
                flag
            )));
        }
    }

    if let Some(breakpoints) = present(&obj, "initialBreakpoints") {
        let Some(items) = breakpoints.as_array() else {
            return Err(Error::Validation(
                "Init payload 'initialBreakpoints' must be an array if provided".to_string(),
            ));
        };
        for bp in items {
            validate_initial_breakpoint(bp)?;
        }
    }

    if let Some(command) = present(&obj, "adapterCommand") {
        let valid = command
            .get("command")
            .and_then(Value::as_str)
            .is_some_and(|c| !c.is_empty());
        if !valid {
            return Err(Error::Validation(
                "Init payload 'adapterCommand' must have a non-empty 'command'".to_string(),
            ));
        }
    }

    if present(&obj, "launchConfig").is_some_and(|v| !v.is_object()) {
        return Err(Error::Validation(
            "Init payload 'launchConfig' must be an object if provided".to_string(),
        ));
    }

    strip_nulls(&mut obj);
    serde_json::from_value(Value::Object(obj))
        .map_err(|e| Error::Validation(format!("Init payload invalid: {}", e)))
}

fn validate_initial_breakpoint(bp: &Value) -> Result<()> {
    let Some(bp) = bp.as_object() else {
        return Err(Error::Validation(
            "Invalid breakpoint in initialBreakpoints".to_string(),
        ));
    };

    let file_ok = bp.get("file").is_some_and(Value::is_string);
    let line_ok = bp
        .get("line")
        .and_then(Value::as_u64)
        .is_some_and(|line| line <= u64::from(u32::MAX));
    if !file_ok || !line_ok {
        return Err(Error::Validation(
            "Breakpoint must have 'file' (string) and 'line' (number)".to_string(),
        ));
    }

    if bp
        .get("condition")
        .is_some_and(|c| !c.is_null() && !c.is_string())
    {
        return Err(Error::Validation(
            "Breakpoint 'condition' must be a string if provided".to_string(),
        ));
    }
    Ok(())
}

fn validate_dap(obj: Map<String, Value>) -> Result<DapPayload> {
    for field in ["sessionId", "requestId", "dapCommand"] {
        require_non_empty_string(&obj, field, "DAP")?;
    }

    if matches!(obj.get("dapArgs"), Some(Value::Null)) {
        return Err(Error::Validation(
            "DAP payload 'dapArgs' should not be null".to_string(),
        ));
    }

    serde_json::from_value(Value::Object(obj))
        .map_err(|e| Error::Validation(format!("DAP payload invalid: {}", e)))
}

fn validate_terminate(obj: Map<String, Value>) -> Result<TerminatePayload> {
    require_non_empty_string(&obj, "sessionId", "Terminate")?;
    serde_json::from_value(Value::Object(obj))
        .map_err(|e| Error::Validation(format!("Terminate payload invalid: {}", e)))
}

fn require_non_empty_string(obj: &Map<String, Value>, field: &str, kind: &str) -> Result<()> {
    match obj.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(()),
        other => Err(Error::Validation(format!(
            "{} payload missing or invalid '{}': {}",
            kind,
            field,
            display_value(other)
        ))),
    }
}

/// Field value when present and not null
fn present<'a>(obj: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    obj.get(field).filter(|v| !v.is_null())
}

fn strip_nulls(obj: &mut Map<String, Value>) {
    obj.retain(|_, v| !v.is_null());
}

fn display_value(value: Option<&Value>) -> String {
    match value {
        None => "undefined".to_string(),
        Some(v) => v.to_string(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================
// OUTBOUND MESSAGES
// ============================================================

/// Message from the proxy to its caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ProxyMessage {
    Status {
        session_id: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        script: Option<String>,
    },
    DapResponse {
        session_id: String,
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<Response>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    DapEvent {
        session_id: String,
        event: String,
        #[serde(default)]
        body: Option<Value>,
    },
    Error {
        session_id: String,
        message: String,
    },
}

impl ProxyMessage {
    pub fn status(session_id: impl Into<String>, status: impl Into<String>) -> Self {
        ProxyMessage::Status {
            session_id: session_id.into(),
            status: status.into(),
            code: None,
            signal: None,
            command: None,
            script: None,
        }
    }

    pub fn adapter_exited(
        session_id: impl Into<String>,
        code: Option<i32>,
        signal: Option<String>,
    ) -> Self {
        ProxyMessage::Status {
            session_id: session_id.into(),
            status: status::ADAPTER_EXITED.to_string(),
            code,
            signal,
            command: None,
            script: None,
        }
    }

    pub fn dry_run_complete(
        session_id: impl Into<String>,
        command: impl Into<String>,
        script: impl Into<String>,
    ) -> Self {
        ProxyMessage::Status {
            session_id: session_id.into(),
            status: status::DRY_RUN_COMPLETE.to_string(),
            code: None,
            signal: None,
            command: Some(command.into()),
            script: Some(script.into()),
        }
    }

    pub fn response_ok(
        session_id: impl Into<String>,
        request_id: impl Into<String>,
        response: Response,
    ) -> Self {
        ProxyMessage::DapResponse {
            session_id: session_id.into(),
            request_id: request_id.into(),
            success: true,
            body: response.body.clone(),
            response: Some(response),
            error: None,
        }
    }

    pub fn response_err(
        session_id: impl Into<String>,
        request_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        ProxyMessage::DapResponse {
            session_id: session_id.into(),
            request_id: request_id.into(),
            success: false,
            body: None,
            response: None,
            error: Some(error.into()),
        }
    }

    pub fn event(
        session_id: impl Into<String>,
        event: impl Into<String>,
        body: Option<Value>,
    ) -> Self {
        ProxyMessage::DapEvent {
            session_id: session_id.into(),
            event: event.into(),
            body,
        }
    }

    pub fn error(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        ProxyMessage::Error {
            session_id: session_id.into(),
            message: message.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            ProxyMessage::Status { session_id, .. }
            | ProxyMessage::DapResponse { session_id, .. }
            | ProxyMessage::DapEvent { session_id, .. }
            | ProxyMessage::Error { session_id, .. } => session_id,
        }
    }
}

/// `status` values reported to the caller
pub mod status {
    pub const DRY_RUN_COMPLETE: &str = "dry_run_complete";
    pub const ADAPTER_CONFIGURED_AND_LAUNCHED: &str = "adapter_configured_and_launched";
    pub const ADAPTER_EXITED: &str = "adapter_exited";
    pub const DAP_CONNECTION_CLOSED: &str = "dap_connection_closed";
    pub const TERMINATED: &str = "terminated";
}
