//! Path utilities for dapx
//!
//! Config file resolution and directory helpers shared by the proxy,
//! the bridge and the logging crate.

use crate::constants::{CONTAINER_WORKSPACE_ROOT, ENV_DAPX_CONFIG, ENV_DAPX_CONTAINER};
use std::path::{Path, PathBuf};

/// Config path from `DAPX_CONFIG`, if set and non-empty.
pub fn config_path_from_env() -> Option<PathBuf> {
    std::env::var_os(ENV_DAPX_CONFIG)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Whether the proxy runs inside the container image (`DAPX_CONTAINER=true`).
pub fn is_container_mode() -> bool {
    std::env::var(ENV_DAPX_CONTAINER)
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Resolve a script path for the current runtime.
///
/// In container mode relative paths live under the workspace mount;
/// elsewhere the path is returned unchanged.
pub fn resolve_script_path(path: &Path, container_mode: bool) -> PathBuf {
    if container_mode && path.is_relative() {
        Path::new(CONTAINER_WORKSPACE_ROOT).join(path)
    } else {
        path.to_path_buf()
    }
}

/// Ensure the parent directory of a file path exists.
///
/// # Example
/// ```
/// use dapx_config::paths::ensure_parent_dir;
/// use std::path::Path;
///
/// ensure_parent_dir(Path::new("relative.log")).unwrap();
/// ```
pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
