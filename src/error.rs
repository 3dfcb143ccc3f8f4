use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Git operation failed: {0}")]
    Git(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Provisioning failed: {0}")]
    Provision(String),

    #[error("Missing environment: {} does not exist", .0.display())]
    MissingEnvironment(PathBuf),

    #[error("Task specification error: {0}")]
    TaskSpec(String),

    #[error("Agent executable not found: {0}")]
    AgentNotFound(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Agent timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<git2::Error> for AppError {
    fn from(e: git2::Error) -> Self {
        AppError::Git(e.message().to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
