//! Policy lookup by language name or adapter command

use super::validate::probe;
use super::{
    custom_spawn_config, AdapterPolicy, DotnetPolicy, GoPolicy, JavaPolicy, JsDebugPolicy,
    PythonPolicy, RustPolicy,
};
use crate::control::{AdapterCommand, InitPayload};
use crate::error::{Error, Result};
use crate::process::AdapterSpawnConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Fallback for unknown adapters: no child sessions, `initialized`
/// readiness, no frame or variable filtering.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAdapterPolicy;

#[async_trait]
impl AdapterPolicy for DefaultAdapterPolicy {
    fn name(&self) -> &'static str {
        "default"
    }

    fn adapter_id(&self) -> &'static str {
        "default"
    }

    fn local_scope_names(&self) -> &'static [&'static str] {
        &["Locals", "Local", "Local Variables"]
    }

    async fn validate_executable(&self, path: &str, timeout: Duration) -> bool {
        probe(path, &["--version"], timeout)
            .await
            .is_some_and(|output| output.success)
    }

    fn matches_adapter(&self, _command: &AdapterCommand) -> bool {
        false
    }

    fn adapter_spawn_config(&self, payload: &InitPayload) -> Result<AdapterSpawnConfig> {
        custom_spawn_config(payload).ok_or_else(|| {
            Error::NotSupported(format!(
                "No adapter policy for language {:?}; provide adapterCommand",
                payload.language.as_deref().unwrap_or("")
            ))
        })
    }
}

/// Maps language names to policies
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: Vec<Arc<dyn AdapterPolicy>>,
    by_language: HashMap<String, Arc<dyn AdapterPolicy>>,
    default_policy: Arc<dyn AdapterPolicy>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyRegistry {
    /// Registry with every built-in policy.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(PythonPolicy), &["python", "py"]);
        registry.register(Arc::new(GoPolicy), &["go", "golang"]);
        registry.register(Arc::new(JavaPolicy), &["java"]);
        registry.register(Arc::new(RustPolicy), &["rust"]);
        registry.register(
            Arc::new(JsDebugPolicy),
            &["javascript", "node", "js", "typescript"],
        );
        registry.register(Arc::new(DotnetPolicy), &["dotnet", "csharp", "cs"]);
        registry
    }

    pub fn empty() -> Self {
        Self {
            policies: Vec::new(),
            by_language: HashMap::new(),
            default_policy: Arc::new(DefaultAdapterPolicy),
        }
    }

    /// Register `policy` under its own name and every alias.
    pub fn register(&mut self, policy: Arc<dyn AdapterPolicy>, aliases: &[&str]) {
        for name in std::iter::once(policy.name()).chain(aliases.iter().copied()) {
            self.by_language.insert(name.to_lowercase(), policy.clone());
        }
        self.policies.push(policy);
    }

    pub fn languages(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_language.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn for_language(&self, language: &str) -> Option<Arc<dyn AdapterPolicy>> {
        self.by_language.get(&language.trim().to_lowercase()).cloned()
    }

    /// First registered policy recognizing the command.
    pub fn for_command(&self, command: &AdapterCommand) -> Option<Arc<dyn AdapterPolicy>> {
        self.policies
            .iter()
            .find(|policy| policy.matches_adapter(command))
            .cloned()
    }

    pub fn default_policy(&self) -> Arc<dyn AdapterPolicy> {
        self.default_policy.clone()
    }

    /// Policy for an init payload.
    ///
    /// Explicit language first, then the adapter command, then Python when
    /// neither is given. An unknown language or an unrecognized command
    /// gets [`DefaultAdapterPolicy`].
    pub fn select(&self, payload: &InitPayload) -> Arc<dyn AdapterPolicy> {
        if let Some(language) = payload.language.as_deref().filter(|l| !l.is_empty()) {
            return match self.for_language(language) {
                Some(policy) => policy,
                None => {
                    warn!("No policy for language '{}', using default", language);
                    self.default_policy()
                }
            };
        }

        match &payload.adapter_command {
            Some(command) => self.for_command(command).unwrap_or_else(|| {
                debug!("Adapter command '{}' matched no policy", command.command);
                self.default_policy()
            }),
            None => self
                .for_language("python")
                .unwrap_or_else(|| self.default_policy()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_language_aliases() {
        let registry = PolicyRegistry::new();
        assert_eq!(registry.for_language("node").unwrap().name(), "javascript");
        assert_eq!(registry.for_language("CSharp").unwrap().name(), "dotnet");
        assert_eq!(registry.for_language("golang").unwrap().name(), "go");
        assert!(registry.for_language("cobol").is_none());
        assert!(registry.languages().contains(&"rust"));
    }

    #[test]
    fn test_select_precedence() {
        let registry = PolicyRegistry::new();

        let mut payload = payload();
        assert_eq!(registry.select(&payload).name(), "python");

        payload.adapter_command = Some(adapter_command("/go/bin/dlv", &["dap"]));
        assert_eq!(registry.select(&payload).name(), "go");

        payload.language = Some("java".to_string());
        assert_eq!(registry.select(&payload).name(), "java");

        payload.language = Some("cobol".to_string());
        assert_eq!(registry.select(&payload).name(), "default");

        payload.language = None;
        payload.adapter_command = Some(adapter_command("/opt/mystery-adapter", &[]));
        assert_eq!(registry.select(&payload).name(), "default");
    }

    #[test]
    fn test_default_policy_is_passthrough() {
        let policy = DefaultAdapterPolicy;
        assert!(!policy.supports_reverse_start_debugging());
        assert!(policy.adapter_spawn_config(&payload()).is_err());

        let frames = vec![crate::protocol::StackFrame::new(1, "f", "", 1)];
        assert_eq!(policy.filter_stack_frames(&frames, false).len(), 1);
    }
}
