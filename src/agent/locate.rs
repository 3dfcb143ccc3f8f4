use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::sync::OnceCell;

use crate::error::{AppError, Result};

/// Resolves the agent executable once and remembers the answer.
///
/// The caller creates one locator per batch and shares it with every runner,
/// so the `PATH` search happens at most once. A failed lookup is cached too:
/// every unit then fails with the same error detail.
pub struct AgentLocator {
    command: String,
    search_path: Option<OsString>,
    resolved: OnceCell<std::result::Result<PathBuf, String>>,
}

impl AgentLocator {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            search_path: std::env::var_os("PATH"),
            resolved: OnceCell::new(),
        }
    }

    /// Search the given `PATH`-style list instead of the process environment.
    pub fn with_search_path(command: &str, search_path: impl Into<OsString>) -> Self {
        Self {
            command: command.to_string(),
            search_path: Some(search_path.into()),
            resolved: OnceCell::new(),
        }
    }

    /// A locator that always yields `path`.
    pub fn fixed(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            command: path.display().to_string(),
            search_path: None,
            resolved: OnceCell::new_with(Some(Ok(path))),
        }
    }

    pub async fn resolve(&self) -> Result<PathBuf> {
        let resolved = self
            .resolved
            .get_or_init(|| async {
                let found = find_executable(&self.command, self.search_path.as_ref());
                match &found {
                    Ok(path) => tracing::info!(
                        command = %self.command,
                        path = %path.display(),
                        "Resolved agent executable"
                    ),
                    Err(e) => tracing::error!(
                        command = %self.command,
                        error = %e,
                        "Agent lookup failed"
                    ),
                }
                found
            })
            .await;

        resolved.clone().map_err(AppError::AgentNotFound)
    }
}

fn find_executable(
    command: &str,
    search_path: Option<&OsString>,
) -> std::result::Result<PathBuf, String> {
    if command.is_empty() {
        return Err("agent command is empty".to_string());
    }

    // Explicit paths are checked as-is, never searched.
    if command.contains(std::path::MAIN_SEPARATOR) || command.contains('/') {
        let path = PathBuf::from(command);
        return if is_executable(&path) {
            Ok(path)
        } else {
            Err(format!("{command} does not exist or is not executable"))
        };
    }

    let search_path =
        search_path.ok_or_else(|| format!("PATH is not set; cannot find {command}"))?;
    std::env::split_paths(search_path)
        .map(|dir| dir.join(command))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| format!("{command} not found in PATH"))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
