//! Executable probes used by `validate_executable`

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Captured result of running an executable once
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ProbeOutput {
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }

    pub fn has_output(&self) -> bool {
        !self.stdout.trim().is_empty() || !self.stderr.trim().is_empty()
    }
}

/// Run `path args...` with closed stdin and wait up to `timeout`.
///
/// Returns `None` when the process cannot be started or does not finish in
/// time; the child is killed in the latter case.
pub async fn probe(path: &str, args: &[&str], timeout: Duration) -> Option<ProbeOutput> {
    let mut command = Command::new(path);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => Some(ProbeOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(e)) => {
            debug!("Failed to run {} {:?}: {}", path, args, e);
            None
        }
        Err(_) => {
            debug!("Probe {} {:?} timed out after {:?}", path, args, timeout);
            None
        }
    }
}

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Write an executable shell script into `dir`
    pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::test_support::script;
    use super::*;

    #[tokio::test]
    async fn test_probe_captures_output_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let tool = script(dir.path(), "tool", "echo out; echo err >&2; exit 2");

        let output = probe(tool.to_str().unwrap(), &["--version"], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!output.success);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(output.has_output());
    }

    #[tokio::test]
    async fn test_probe_missing_binary() {
        assert!(probe("/nonexistent/tool", &[], Duration::from_secs(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let tool = script(dir.path(), "slow", "sleep 5");
        assert!(probe(tool.to_str().unwrap(), &[], Duration::from_millis(100))
            .await
            .is_none());
    }
}
