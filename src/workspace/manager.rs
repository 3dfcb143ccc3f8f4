use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::config::{AppConfig, GitHubConfig, WorkspaceConfig};
use crate::error::{AppError, Result};
use crate::queue::task::Target;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::workspace::git;

/// Produces an isolated, checked-out working directory for a target.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, target: &Target) -> Result<PathBuf>;
}

/// Manages one checkout per target under a common base directory.
pub struct WorkspaceManager {
    base_dir: PathBuf,
    base_url: String,
    token: Option<String>,
    retry: RetryPolicy,
}

impl WorkspaceManager {
    pub fn new(workspace: &WorkspaceConfig, github: &GitHubConfig, retry: RetryPolicy) -> Self {
        Self {
            base_dir: workspace.base_dir.clone(),
            base_url: github.base_url.trim_end_matches('/').to_string(),
            token: github.token.clone(),
            retry,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.workspace, &config.github, config.retry_policy("git"))
    }

    /// Directory reserved for `target`. Distinct targets never share one.
    pub fn workspace_path(&self, target: &Target) -> PathBuf {
        self.base_dir.join(target.id())
    }

    pub fn clone_url(&self, target: &Target) -> String {
        format!("{}/{}/{}.git", self.base_url, target.org, target.repo)
    }

    fn policy(&self, label: String) -> RetryPolicy {
        RetryPolicy {
            label,
            ..self.retry.clone()
        }
    }

    async fn clone_fresh(&self, target: &Target, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Workspace(format!("Failed to create workspace dir: {e}")))?;
        }

        let url = self.clone_url(target);
        git::validate_clone_url(&url)?;

        tracing::info!(repo = %target, path = %path.display(), "Cloning repository");
        let label = format!("clone {}/{}", target.org, target.repo);
        let url = url.as_str();
        let token = self.token.as_deref();
        retry_with_backoff(self.policy(label), || async move {
            let result = git::clone(url, path, token).await;
            if result.is_err() && path.exists() {
                // A half-written clone would make the next attempt fail on a
                // non-empty directory.
                if let Err(e) = tokio::fs::remove_dir_all(path).await {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to remove partial clone"
                    );
                }
            }
            result
        })
        .await
        .map_err(|e| AppError::Provision(e.to_string()))
    }

    async fn fetch(&self, target: &Target, path: &Path) -> Result<()> {
        let label = format!("fetch {target}");
        let branch = target.branch.as_str();
        let token = self.token.as_deref();
        retry_with_backoff(self.policy(label), || {
            git::fetch_branch(path, branch, token)
        })
        .await
        .map_err(|e| AppError::Provision(e.to_string()))
    }
}

#[async_trait]
impl Provisioner for WorkspaceManager {
    /// Clone (or refresh) the target's repository and check out its branch.
    ///
    /// An existing directory that is not a git checkout is a naming conflict
    /// and is left untouched.
    async fn provision(&self, target: &Target) -> Result<PathBuf> {
        git::validate_branch_name(&target.branch)?;
        let path = self.workspace_path(target);

        if path.exists() {
            if !git::is_repository(&path) {
                return Err(AppError::Workspace(format!(
                    "Naming conflict: {} exists and is not a git checkout",
                    path.display()
                )));
            }
            tracing::info!(
                repo = %target,
                path = %path.display(),
                "Reusing existing checkout"
            );
        } else {
            self.clone_fresh(target, &path).await?;
        }

        self.fetch(target, &path).await?;
        git::checkout_remote_branch(&path, &target.branch).await?;

        tracing::info!(repo = %target, path = %path.display(), "Workspace ready");
        Ok(path)
    }
}
