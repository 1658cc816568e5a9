//! Delve (`dlv dap`)

use super::validate::probe;
use super::{command_mentions, custom_spawn_config, AdapterPolicy, InitializationBehavior};
use crate::control::{AdapterCommand, InitPayload};
use crate::error::Result;
use crate::process::AdapterSpawnConfig;
use crate::protocol::StackFrame;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

pub const DLV_PATH_ENV: &str = "DLV_PATH";

/// Frames from these directories belong to the Go runtime or test harness
const INTERNAL_PATH_MARKERS: &[&str] = &["/runtime/", "/testing/"];

#[derive(Debug, Default, Clone, Copy)]
pub struct GoPolicy;

#[async_trait]
impl AdapterPolicy for GoPolicy {
    fn name(&self) -> &'static str {
        "go"
    }

    fn adapter_id(&self) -> &'static str {
        "dlv-dap"
    }

    fn local_scope_names(&self) -> &'static [&'static str] {
        &["Locals", "Local"]
    }

    // `_` itself is a real (blank) identifier
    fn is_special_variable(&self, name: &str) -> bool {
        name.starts_with('_') && name != "_"
    }

    fn is_internal_frame(&self, frame: &StackFrame) -> bool {
        let file = frame.file().replace('\\', "/");
        INTERNAL_PATH_MARKERS.iter().any(|marker| file.contains(marker))
    }

    fn executable_env_var(&self) -> Option<&'static str> {
        Some(DLV_PATH_ENV)
    }

    fn default_executable(&self) -> Option<String> {
        Some("dlv".to_string())
    }

    async fn validate_executable(&self, path: &str, timeout: Duration) -> bool {
        probe(path, &["version"], timeout)
            .await
            .is_some_and(|output| output.success && output.has_output())
    }

    fn matches_adapter(&self, command: &AdapterCommand) -> bool {
        command_mentions(command, &["dlv", "delve"])
    }

    // Delve errors when stack traces are requested right after an entry stop
    fn initialization_behavior(&self) -> InitializationBehavior {
        InitializationBehavior {
            default_stop_on_entry: Some(false),
            send_launch_before_config: true,
            // Delve may only send `initialized` once it has seen `launch`
            defer_config_done: true,
            ..Default::default()
        }
    }

    fn adapter_spawn_config(&self, payload: &InitPayload) -> Result<AdapterSpawnConfig> {
        if let Some(config) = custom_spawn_config(payload) {
            return Ok(config);
        }
        let dlv = self
            .resolve_executable_path(Some(&payload.executable_path))
            .unwrap_or_else(|| "dlv".to_string());

        Ok(AdapterSpawnConfig {
            command: dlv,
            args: vec![
                "dap".to_string(),
                "--listen".to_string(),
                format!("{}:{}", payload.adapter_host, payload.adapter_port),
                "--log".to_string(),
                "--log-output".to_string(),
                "dap".to_string(),
                "--log-dest".to_string(),
                payload.log_dir.display().to_string(),
            ],
            host: payload.adapter_host.clone(),
            port: payload.adapter_port,
            log_dir: payload.log_dir.clone(),
            cwd: None,
            env: HashMap::new(),
        })
    }
}
