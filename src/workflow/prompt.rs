use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};
use crate::queue::task::Target;

/// Task description shared by every target, with per-target placeholders:
/// `{{org}}`, `{{repo}}`, `{{branch}}` and `{{target}}` (`org/repo@branch`).
#[derive(Debug, Clone)]
pub struct TaskTemplate {
    source: String,
}

impl TaskTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let source = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::TaskSpec(format!("cannot read template {}: {e}", path.display()))
        })?;
        Ok(Self::new(source))
    }

    pub fn render(&self, target: &Target) -> String {
        self.source
            .replace("{{org}}", &target.org)
            .replace("{{repo}}", &target.repo)
            .replace("{{branch}}", &target.branch)
            .replace("{{target}}", &target.to_string())
    }

    /// Write the rendered task for `target` to `<dir>/<target id>.md`.
    pub async fn write_for(&self, target: &Target, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(format!("{}.md", target.id()));
        tokio::fs::write(&path, self.render(target)).await?;
        Ok(path)
    }
}
