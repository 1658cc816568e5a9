//! debugpy

use super::validate::probe;
use super::{command_mentions, custom_spawn_config, AdapterPolicy, InitializationBehavior};
use crate::control::{AdapterCommand, InitPayload};
use crate::error::Result;
use crate::process::AdapterSpawnConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Environment variable naming the Python interpreter
pub const PYTHON_PATH_ENV: &str = "PYTHON_PATH";

const VISIBLE_DUNDERS: &[&str] = &["__name__", "__file__", "__doc__"];
const GROUPING_NODES: &[&str] = &["special variables", "function variables"];

#[derive(Debug, Default, Clone, Copy)]
pub struct PythonPolicy;

impl PythonPolicy {
    /// `python -c "import debugpy"` succeeds.
    pub async fn has_debugpy(&self, python: &str, timeout: Duration) -> bool {
        probe(python, &["-c", "import debugpy"], timeout)
            .await
            .is_some_and(|output| output.success)
    }
}

/// The Windows Store stub answers `--version` without being a real interpreter.
pub fn is_store_alias(path: &str, output: &str) -> bool {
    (path.to_lowercase().contains("windowsapps") && !output.contains("Python "))
        || output.contains("Microsoft Store")
}

#[async_trait]
impl AdapterPolicy for PythonPolicy {
    fn name(&self) -> &'static str {
        "python"
    }

    fn adapter_id(&self) -> &'static str {
        "python"
    }

    fn local_scope_names(&self) -> &'static [&'static str] {
        &["Locals", "Local"]
    }

    fn is_special_variable(&self, name: &str) -> bool {
        if GROUPING_NODES.contains(&name) || name == "_" || name.starts_with("_pydev") {
            return true;
        }
        name.starts_with("__") && name.ends_with("__") && !VISIBLE_DUNDERS.contains(&name)
    }

    fn executable_env_var(&self) -> Option<&'static str> {
        Some(PYTHON_PATH_ENV)
    }

    fn default_executable(&self) -> Option<String> {
        Some(if cfg!(windows) { "python" } else { "python3" }.to_string())
    }

    async fn validate_executable(&self, path: &str, timeout: Duration) -> bool {
        let Some(output) = probe(path, &["--version"], timeout).await else {
            return false;
        };
        let combined = output.combined();
        if is_store_alias(path, &combined) {
            debug!("Rejecting Windows Store alias at {}", path);
            return false;
        }
        output.success && combined.contains("Python")
    }

    fn matches_adapter(&self, command: &AdapterCommand) -> bool {
        command_mentions(command, &["debugpy"])
    }

    fn initialization_behavior(&self) -> InitializationBehavior {
        InitializationBehavior {
            send_launch_before_config: true,
            ..Default::default()
        }
    }

    fn adapter_spawn_config(&self, payload: &InitPayload) -> Result<AdapterSpawnConfig> {
        if let Some(config) = custom_spawn_config(payload) {
            return Ok(config);
        }
        let python = self
            .resolve_executable_path(Some(&payload.executable_path))
            .unwrap_or_else(|| payload.executable_path.clone());

        Ok(AdapterSpawnConfig {
            command: python,
            args: vec![
                "-m".to_string(),
                "debugpy.adapter".to_string(),
                "--host".to_string(),
                payload.adapter_host.clone(),
                "--port".to_string(),
                payload.adapter_port.to_string(),
                "--log-dir".to_string(),
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

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_spawn_command() {
        let config = PythonPolicy.adapter_spawn_config(&payload()).unwrap();
        assert_eq!(config.command, "/usr/bin/backend");
        assert_eq!(
            config.command_line(),
            "/usr/bin/backend -m debugpy.adapter --host 127.0.0.1 --port 5678 --log-dir /tmp/logs"
        );
    }

    #[test]
    fn test_special_variables_filtered_in_order() {
        let (frames, scopes, variables) = locals_fixture(
            "Locals",
            &["special variables", "a", "__name__", "__builtins__", "_pydevd_x", "_", "b"],
        );
        let locals = PythonPolicy.extract_local_variables(&frames, &scopes, &variables, false);
        assert_eq!(names(&locals), vec!["a", "__name__", "b"]);

        let all = PythonPolicy.extract_local_variables(&frames, &scopes, &variables, true);
        assert_eq!(all.len(), 7);
    }

    #[test]
    fn test_store_alias_detection() {
        assert!(is_store_alias(
            r"C:\Users\u\AppData\Local\Microsoft\WindowsApps\python.exe",
            ""
        ));
        assert!(is_store_alias("python", "Python was not found; run without arguments to install from the Microsoft Store"));
        assert!(!is_store_alias(r"C:\Python312\python.exe", "Python 3.12.1"));
    }

    #[test]
    fn test_matches_adapter() {
        assert!(PythonPolicy.matches_adapter(&adapter_command("python", &["-m", "debugpy.adapter"])));
        assert!(!PythonPolicy.matches_adapter(&adapter_command("dlv", &["dap"])));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_validate_executable() {
        use super::super::validate::test_support::script;
        let dir = tempfile::tempdir().unwrap();
        let good = script(dir.path(), "python", "echo 'Python 3.11.4'");
        let bad = script(dir.path(), "notpython", "echo 'something else'");
        let timeout = Duration::from_secs(5);

        assert!(PythonPolicy.validate_executable(good.to_str().unwrap(), timeout).await);
        assert!(!PythonPolicy.validate_executable(bad.to_str().unwrap(), timeout).await);
        assert!(!PythonPolicy.validate_executable("/nonexistent/python", timeout).await);
    }
}
