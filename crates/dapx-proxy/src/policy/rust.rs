//! CodeLLDB

use super::validate::probe;
use super::{command_mentions, custom_spawn_config, AdapterPolicy};
use crate::control::{AdapterCommand, InitPayload};
use crate::error::Result;
use crate::process::AdapterSpawnConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CARGO_PATH_ENV: &str = "CARGO_PATH";

/// Vendored CodeLLDB location relative to the working directory
const VENDORED_CODELLDB_DIR: &str = "vendor/codelldb";

const DEBUGGER_PREFIXES: &[&str] = &["$", "__", "_lldb", "_debug"];

#[derive(Debug, Default, Clone, Copy)]
pub struct RustPolicy;

/// Vendored subdirectory for an OS/architecture pair (`std::env::consts` names)
pub fn codelldb_platform_dir(os: &str, arch: &str) -> Option<&'static str> {
    match (os, arch) {
        ("windows", _) => Some("win32-x64"),
        ("macos", "aarch64") => Some("darwin-arm64"),
        ("macos", _) => Some("darwin-x64"),
        ("linux", "aarch64") => Some("linux-arm64"),
        ("linux", _) => Some("linux-x64"),
        _ => None,
    }
}

/// `<root>/vendor/codelldb/<platform>/adapter/codelldb[.exe]` for this host
pub fn vendored_codelldb_path(root: &Path) -> Option<PathBuf> {
    let platform = codelldb_platform_dir(std::env::consts::OS, std::env::consts::ARCH)?;
    let binary = if cfg!(windows) { "codelldb.exe" } else { "codelldb" };
    Some(
        root.join(VENDORED_CODELLDB_DIR)
            .join(platform)
            .join("adapter")
            .join(binary),
    )
}

#[async_trait]
impl AdapterPolicy for RustPolicy {
    fn name(&self) -> &'static str {
        "rust"
    }

    fn adapter_id(&self) -> &'static str {
        "lldb"
    }

    fn local_scope_names(&self) -> &'static [&'static str] {
        &["Local", "Locals"]
    }

    fn is_special_variable(&self, name: &str) -> bool {
        DEBUGGER_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
    }

    fn executable_env_var(&self) -> Option<&'static str> {
        Some(CARGO_PATH_ENV)
    }

    async fn validate_executable(&self, path: &str, timeout: Duration) -> bool {
        if !Path::new(path).exists() {
            return false;
        }
        probe(path, &["--version"], timeout)
            .await
            .is_some_and(|output| {
                output.success && output.combined().to_lowercase().contains("codelldb")
            })
    }

    fn matches_adapter(&self, command: &AdapterCommand) -> bool {
        command_mentions(command, &["codelldb", "lldb-server", "lldb"])
    }

    fn adapter_spawn_config(&self, payload: &InitPayload) -> Result<AdapterSpawnConfig> {
        if let Some(config) = custom_spawn_config(payload) {
            return Ok(config);
        }

        // An existing executable path wins over the vendored copy
        let provided = Path::new(&payload.executable_path);
        let command = if provided.is_file() {
            payload.executable_path.clone()
        } else {
            std::env::current_dir()
                .ok()
                .and_then(|cwd| vendored_codelldb_path(&cwd))
                .filter(|vendored| vendored.is_file())
                .map(|vendored| vendored.display().to_string())
                .unwrap_or_else(|| payload.executable_path.clone())
        };

        let mut env = HashMap::new();
        if cfg!(windows) {
            env.insert("LLDB_USE_NATIVE_PDB_READER".to_string(), "1".to_string());
        }

        Ok(AdapterSpawnConfig {
            command,
            args: vec!["--port".to_string(), payload.adapter_port.to_string()],
            host: payload.adapter_host.clone(),
            port: payload.adapter_port,
            log_dir: payload.log_dir.clone(),
            cwd: None,
            env,
        })
    }
}
