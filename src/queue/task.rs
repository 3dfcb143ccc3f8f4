use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

const DEFAULT_BRANCH: &str = "main";

/// One (organization, repository, branch) the task should run against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub org: String,
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

impl Target {
    pub fn new(org: &str, repo: &str, branch: &str) -> Self {
        Self {
            org: org.to_string(),
            repo: repo.to_string(),
            branch: branch.to_string(),
        }
    }

    /// Parse `org/repo` or `org/repo@branch`.
    pub fn parse(spec: &str) -> Result<Self> {
        let (path, branch) = match spec.split_once('@') {
            Some((path, branch)) => (path, branch),
            None => (spec, DEFAULT_BRANCH),
        };

        let (org, repo) = path.split_once('/').ok_or_else(|| {
            AppError::Config(format!(
                "Invalid target '{spec}': expected org/repo[@branch]"
            ))
        })?;

        if org.is_empty() || repo.is_empty() || branch.is_empty() || repo.contains('/') {
            return Err(AppError::Config(format!(
                "Invalid target '{spec}': expected org/repo[@branch]"
            )));
        }

        Ok(Self::new(org, repo, branch))
    }

    /// Filesystem-safe identifier, unique per target.
    ///
    /// Components are joined with `__`, so `_`, `/` and `%` inside a component
    /// are percent-encoded and `__` only ever appears as a separator.
    pub fn id(&self) -> String {
        format!(
            "{}__{}__{}",
            encode_component(&self.org),
            encode_component(&self.repo),
            encode_component(&self.branch)
        )
    }
}

fn encode_component(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => encoded.push_str("%25"),
            '/' => encoded.push_str("%2F"),
            '_' => encoded.push_str("%5F"),
            other => encoded.push(other),
        }
    }
    encoded
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.org, self.repo, self.branch)
    }
}

/// A single schedulable unit: one target, its checkout, and its task spec.
///
/// Fields are private so a unit cannot change after provisioning hands it over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    id: String,
    task_spec: PathBuf,
    work_dir: PathBuf,
}

impl WorkUnit {
    pub fn new(
        id: impl Into<String>,
        task_spec: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            task_spec: task_spec.into(),
            work_dir: work_dir.into(),
        }
    }

    pub fn for_target(
        target: &Target,
        task_spec: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self::new(target.id(), task_spec, work_dir)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task_spec(&self) -> &Path {
        &self.task_spec
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}
