//! JVM debugging through a caller-provided adapter command

use super::validate::probe;
use super::{command_mentions, custom_spawn_config, AdapterPolicy};
use crate::control::{AdapterCommand, InitPayload};
use crate::error::{Error, Result};
use crate::process::AdapterSpawnConfig;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

pub const JAVA_HOME_ENV: &str = "JAVA_HOME";

#[derive(Debug, Default, Clone, Copy)]
pub struct JavaPolicy;

fn java_binary_name() -> &'static str {
    if cfg!(windows) {
        "java.exe"
    } else {
        "java"
    }
}

#[async_trait]
impl AdapterPolicy for JavaPolicy {
    fn name(&self) -> &'static str {
        "java"
    }

    fn adapter_id(&self) -> &'static str {
        "java"
    }

    fn local_scope_names(&self) -> &'static [&'static str] {
        &["Local", "Locals"]
    }

    fn is_special_variable(&self, name: &str) -> bool {
        name == "this"
    }

    fn default_executable(&self) -> Option<String> {
        Some("java".to_string())
    }

    /// Provided path, else `$JAVA_HOME/bin/java`, else `java` on PATH.
    fn resolve_executable_path(&self, provided: Option<&str>) -> Option<String> {
        if let Some(path) = provided.filter(|p| !p.is_empty()) {
            return Some(path.to_string());
        }
        if let Some(home) = std::env::var_os(JAVA_HOME_ENV).filter(|h| !h.is_empty()) {
            let java = PathBuf::from(home).join("bin").join(java_binary_name());
            return Some(java.display().to_string());
        }
        self.default_executable()
    }

    async fn validate_executable(&self, path: &str, timeout: Duration) -> bool {
        probe(path, &["-version"], timeout)
            .await
            .is_some_and(|output| output.success)
    }

    fn matches_adapter(&self, command: &AdapterCommand) -> bool {
        command_mentions(command, &["jdb", "java-debug"])
    }

    fn adapter_spawn_config(&self, payload: &InitPayload) -> Result<AdapterSpawnConfig> {
        custom_spawn_config(payload).ok_or_else(|| {
            Error::NotSupported("Java adapter requires adapterCommand to be provided".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_requires_adapter_command() {
        let err = JavaPolicy.adapter_spawn_config(&payload()).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));

        let mut with_command = payload();
        with_command.adapter_command = Some(adapter_command("java", &["-jar", "jdb-dap.jar"]));
        let config = JavaPolicy.adapter_spawn_config(&with_command).unwrap();
        assert_eq!(config.command_line(), "java -jar jdb-dap.jar");
    }

    #[test]
    fn test_this_is_special() {
        let (frames, scopes, variables) = locals_fixture("Local", &["this", "count"]);
        let locals = JavaPolicy.extract_local_variables(&frames, &scopes, &variables, false);
        assert_eq!(names(&locals), vec!["count"]);
    }

    #[test]
    fn test_provided_path_wins() {
        assert_eq!(
            JavaPolicy.resolve_executable_path(Some("/opt/jdk/bin/java")),
            Some("/opt/jdk/bin/java".to_string())
        );
    }

    #[test]
    fn test_matches_adapter() {
        assert!(JavaPolicy.matches_adapter(&adapter_command("java", &["-jar", "jdb-bridge.jar"])));
        assert!(!JavaPolicy.matches_adapter(&adapter_command("node", &["server.js"])));
    }
}
