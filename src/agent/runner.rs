use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use crate::agent::locate::AgentLocator;
use crate::error::{AppError, Result};
use crate::queue::outcome::Outcome;
use crate::queue::task::WorkUnit;
use crate::shutdown::CancelToken;

/// Executes one work unit to a terminal outcome.
///
/// Implementations never fail: every problem becomes an `Outcome` with
/// `success == false`.
#[async_trait]
pub trait UnitRunner: Send + Sync + 'static {
    async fn run(&self, unit: &WorkUnit) -> Outcome;
}

/// Runs the external coding agent inside a unit's checkout.
///
/// The task spec is piped to the agent's stdin; stdout and stderr both go to
/// `<log_dir>/<unit id>.log`.
pub struct AgentRunner {
    locator: Arc<AgentLocator>,
    args: Vec<String>,
    log_dir: PathBuf,
    timeout: Option<Duration>,
    cancel: CancelToken,
}

impl AgentRunner {
    pub fn new(locator: Arc<AgentLocator>, args: Vec<String>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            locator,
            args,
            log_dir: log_dir.into(),
            timeout: None,
            cancel: CancelToken::never(),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn log_path(&self, unit: &WorkUnit) -> PathBuf {
        self.log_dir.join(format!("{}.log", unit.id()))
    }

    /// Check preconditions, spawn the agent, and wait for it to exit.
    async fn execute(&self, unit: &WorkUnit, log_path: &Path) -> Result<ExitStatus> {
        if !tokio::fs::metadata(unit.work_dir())
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(AppError::MissingEnvironment(unit.work_dir().to_path_buf()));
        }

        let task = tokio::fs::read_to_string(unit.task_spec())
            .await
            .map_err(|e| {
                AppError::TaskSpec(format!("cannot read {}: {e}", unit.task_spec().display()))
            })?;

        let agent = self.locator.resolve().await?;

        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let log = tokio::fs::File::create(log_path).await?;
        let log_err = log.try_clone().await?;
        let (log, log_err) = (log.into_std().await, log_err.into_std().await);

        let mut child = Command::new(&agent)
            .args(&self.args)
            .current_dir(unit.work_dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Agent(format!("failed to spawn {}: {e}", agent.display())))?;

        tracing::debug!(unit = %unit.id(), pid = ?child.id(), "Agent process started");

        feed_stdin(&mut child, task, unit.id());

        let deadline = async {
            match self.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            status = child.wait() => Ok(status?),
            _ = deadline => {
                kill(&mut child, unit.id()).await;
                Err(AppError::Timeout(self.timeout.unwrap_or_default()))
            }
            _ = self.cancel.cancelled() => {
                kill(&mut child, unit.id()).await;
                Err(AppError::Cancelled)
            }
        }
    }
}

#[async_trait]
impl UnitRunner for AgentRunner {
    async fn run(&self, unit: &WorkUnit) -> Outcome {
        let log_path = self.log_path(unit);
        let started_at = Utc::now();
        let clock = Instant::now();

        tracing::info!(unit = %unit.id(), dir = %unit.work_dir().display(), "Starting agent");

        match self.execute(unit, &log_path).await {
            Ok(status) => {
                let outcome = Outcome::completed(
                    unit,
                    status.code(),
                    started_at,
                    clock.elapsed(),
                    log_path,
                );
                if outcome.success {
                    tracing::info!(
                        unit = %unit.id(),
                        duration_ms = outcome.duration.as_millis() as u64,
                        "Agent finished"
                    );
                } else {
                    tracing::warn!(
                        unit = %unit.id(),
                        exit_code = ?outcome.exit_code,
                        log = ?outcome.log_path,
                        "Agent reported failure"
                    );
                }
                outcome
            }
            Err(e) => {
                tracing::error!(unit = %unit.id(), error = %e, "Could not run agent");
                // Only point at the log if the agent got far enough to write one.
                let log_path = log_path.exists().then_some(log_path);
                Outcome::errored(unit.id(), started_at, clock.elapsed(), log_path, e.to_string())
            }
        }
    }
}

/// Write the task to the agent's stdin in the background and close it.
///
/// An agent that exits without reading its input closes the pipe; that is
/// not a runner failure, the exit status still decides the outcome.
fn feed_stdin(child: &mut Child, task: String, unit_id: &str) {
    let Some(mut stdin) = child.stdin.take() else {
        return;
    };
    let unit_id = unit_id.to_string();

    tokio::spawn(async move {
        let written = async {
            stdin.write_all(task.as_bytes()).await?;
            stdin.shutdown().await
        };
        if let Err(e) = written.await {
            tracing::debug!(unit = %unit_id, error = %e, "Agent closed stdin early");
        }
    });
}

async fn kill(child: &mut Child, unit_id: &str) {
    if let Err(e) = child.kill().await {
        tracing::warn!(unit = %unit_id, error = %e, "Failed to kill agent process");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::shutdown::Cancellation;

    struct Fixture {
        _dir: tempfile::TempDir,
        unit: WorkUnit,
        log_dir: PathBuf,
    }

    fn fixture(task: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path().join("ws").join("acme__api__main");
        std::fs::create_dir_all(&work_dir).unwrap();
        let task_path = dir.path().join("tasks").join("acme__api__main.md");
        std::fs::create_dir_all(task_path.parent().unwrap()).unwrap();
        std::fs::write(&task_path, task).unwrap();

        Fixture {
            log_dir: dir.path().join("logs"),
            unit: WorkUnit::new("acme__api__main", task_path, work_dir),
            _dir: dir,
        }
    }

    fn sh_runner(script: &str, log_dir: &Path) -> AgentRunner {
        AgentRunner::new(
            Arc::new(AgentLocator::fixed("/bin/sh")),
            vec!["-c".to_string(), script.to_string()],
            log_dir,
        )
    }

    #[tokio::test]
    async fn test_successful_agent_receives_task_in_work_dir() {
        let fx = fixture("Upgrade the logging crate.");
        let runner = sh_runner("cat > received.md; echo agent-done", &fx.log_dir);

        let outcome = runner.run(&fx.unit).await;

        assert!(outcome.success);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.unit_id, "acme__api__main");
        assert!(outcome.finished_at >= outcome.started_at);

        let received = std::fs::read_to_string(fx.unit.work_dir().join("received.md")).unwrap();
        assert_eq!(received, "Upgrade the logging crate.");

        let log = std::fs::read_to_string(outcome.log_path.unwrap()).unwrap();
        assert!(log.contains("agent-done"));
    }

    #[tokio::test]
    async fn test_stdout_and_stderr_share_one_log() {
        let fx = fixture("task");
        let runner = sh_runner("echo to-stdout; echo to-stderr >&2", &fx.log_dir);

        let outcome = runner.run(&fx.unit).await;

        assert!(outcome.success);
        let log = std::fs::read_to_string(outcome.log_path.unwrap()).unwrap();
        assert!(log.contains("to-stdout"));
        assert!(log.contains("to-stderr"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure_without_error_detail() {
        let fx = fixture("task");
        let runner = sh_runner("echo to-stdout; echo to-stderr >&2; exit 3", &fx.log_dir);

        let outcome = runner.run(&fx.unit).await;

        assert!(!outcome.success);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.exit_code, Some(3));

        let log = std::fs::read_to_string(outcome.log_path.unwrap()).unwrap();
        assert!(log.contains("to-stdout"));
        assert!(log.contains("to-stderr"));
    }

    #[tokio::test]
    async fn test_missing_work_dir_never_spawns() {
        let fx = fixture("task");
        std::fs::remove_dir_all(fx.unit.work_dir()).unwrap();
        let marker = fx.log_dir.join("spawned");
        let runner = sh_runner(&format!("touch {}", marker.display()), &fx.log_dir);

        let outcome = runner.run(&fx.unit).await;

        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap().contains("Missing environment"));
        assert!(outcome.log_path.is_none());
        assert!(!marker.exists());
        assert!(!runner.log_path(&fx.unit).exists());
    }

    #[tokio::test]
    async fn test_unreadable_task_spec_is_runner_error() {
        let fx = fixture("task");
        std::fs::remove_file(fx.unit.task_spec()).unwrap();
        let runner = sh_runner("exit 0", &fx.log_dir);

        let outcome = runner.run(&fx.unit).await;

        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap().contains("Task specification"));
    }

    #[tokio::test]
    async fn test_unresolved_agent_is_runner_error() {
        let fx = fixture("task");
        let empty = tempfile::tempdir().unwrap();
        let locator = AgentLocator::with_search_path("no-such-agent", empty.path().as_os_str());
        let runner = AgentRunner::new(Arc::new(locator), vec![], &fx.log_dir);

        let outcome = runner.run(&fx.unit).await;

        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_timeout_kills_agent() {
        let fx = fixture("task");
        let runner =
            sh_runner("sleep 30", &fx.log_dir).with_timeout(Some(Duration::from_millis(100)));

        let started = Instant::now();
        let outcome = runner.run(&fx.unit).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap().contains("timed out"));
        assert!(outcome.log_path.is_some());
    }

    #[tokio::test]
    async fn test_cancellation_kills_agent() {
        let fx = fixture("task");
        let cancellation = Cancellation::new();
        let runner = sh_runner("sleep 30", &fx.log_dir).with_cancel_token(cancellation.token());

        let handle = tokio::spawn({
            let unit = fx.unit.clone();
            async move { runner.run(&unit).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancellation.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Cancelled"));
    }

    #[tokio::test]
    async fn test_log_dir_is_created() {
        let fx = fixture("task");
        let nested = fx.log_dir.join("deeper").join("still");
        let runner = sh_runner("echo hi", &nested);

        let outcome = runner.run(&fx.unit).await;

        assert!(outcome.success);
        assert_eq!(outcome.log_path.unwrap(), nested.join("acme__api__main.log"));
    }
}
