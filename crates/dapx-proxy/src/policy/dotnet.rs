//! vsdbg / netcoredbg, reached through the stdio bridge
//!
//! These debuggers only speak DAP over stdio, so the proxy spawns
//! `dapx-bridge`, which listens on the session port and runs the debugger
//! per client connection.

use super::validate::probe;
use super::{command_mentions, custom_spawn_config, AdapterPolicy};
use crate::control::{AdapterCommand, InitPayload};
use crate::error::Result;
use crate::process::AdapterSpawnConfig;
use crate::protocol::StackFrame;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const VSDBG_PATH_ENV: &str = "VSDBG_PATH";

/// Name of the bridge binary installed next to `dapx`
pub const BRIDGE_BINARY: &str = "dapx-bridge";

const COMPILER_GENERATED_PREFIXES: &[&str] = &["<>", "CS$<>", "$VB$"];
const FRAMEWORK_PREFIXES: &[&str] = &["System.", "Microsoft."];

#[derive(Debug, Default, Clone, Copy)]
pub struct DotnetPolicy;

/// Bridge binary next to the current executable, else `dapx-bridge` on PATH
pub fn bridge_executable() -> String {
    let name = format!("{}{}", BRIDGE_BINARY, std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
        .filter(|path| path.is_file())
        .unwrap_or_else(|| PathBuf::from(name))
        .display()
        .to_string()
}

#[async_trait]
impl AdapterPolicy for DotnetPolicy {
    fn name(&self) -> &'static str {
        "dotnet"
    }

    fn adapter_id(&self) -> &'static str {
        "coreclr"
    }

    fn local_scope_names(&self) -> &'static [&'static str] {
        &["Locals"]
    }

    fn is_special_variable(&self, name: &str) -> bool {
        COMPILER_GENERATED_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
    }

    fn is_internal_frame(&self, frame: &StackFrame) -> bool {
        frame.file().is_empty()
            || FRAMEWORK_PREFIXES
                .iter()
                .any(|prefix| frame.name.starts_with(prefix))
    }

    fn executable_env_var(&self) -> Option<&'static str> {
        Some(VSDBG_PATH_ENV)
    }

    fn default_executable(&self) -> Option<String> {
        Some("vsdbg".to_string())
    }

    // vsdbg prints its banner and exits non-zero on --version
    async fn validate_executable(&self, path: &str, timeout: Duration) -> bool {
        probe(path, &["--version"], timeout)
            .await
            .is_some_and(|output| output.success || output.has_output())
    }

    fn matches_adapter(&self, command: &AdapterCommand) -> bool {
        command_mentions(command, &["vsdbg", "netcoredbg", "dotnet"])
    }

    fn adapter_spawn_config(&self, payload: &InitPayload) -> Result<AdapterSpawnConfig> {
        if let Some(config) = custom_spawn_config(payload) {
            return Ok(config);
        }
        let debugger = self
            .resolve_executable_path(Some(&payload.executable_path))
            .unwrap_or_else(|| "vsdbg".to_string());

        Ok(AdapterSpawnConfig {
            command: bridge_executable(),
            args: vec![
                "--host".to_string(),
                payload.adapter_host.clone(),
                "--port".to_string(),
                payload.adapter_port.to_string(),
                "--command".to_string(),
                debugger,
                "--args".to_string(),
                "--interpreter=vscode".to_string(),
            ],
            host: payload.adapter_host.clone(),
            port: payload.adapter_port,
            log_dir: payload.log_dir.clone(),
            cwd: None,
            env: HashMap::new(),
        })
    }
}
