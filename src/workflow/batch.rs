use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;

use crate::agent::runner::UnitRunner;
use crate::error::Result;
use crate::queue::outcome::ExecutionSummary;
use crate::queue::task::{Target, WorkUnit};
use crate::queue::Scheduler;
use crate::shutdown::CancelToken;
use crate::workflow::prompt::TaskTemplate;
use crate::workspace::Provisioner;

/// A target that never became a work unit.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionFailure {
    pub target: String,
    pub error: String,
}

/// Everything a batch produced: targets lost before scheduling plus the
/// scheduler's summary for the rest.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub provision_failures: Vec<ProvisionFailure>,
    pub summary: ExecutionSummary,
}

impl BatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.provision_failures.is_empty() && self.summary.all_succeeded()
    }
}

/// Provisions every target, writes its task spec, and runs the agent across
/// the resulting units.
pub struct Batch {
    provisioner: Arc<dyn Provisioner>,
    runner: Arc<dyn UnitRunner>,
    template: TaskTemplate,
    task_dir: PathBuf,
    concurrency: usize,
    cancel: CancelToken,
}

impl Batch {
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        runner: Arc<dyn UnitRunner>,
        template: TaskTemplate,
        task_dir: impl Into<PathBuf>,
        concurrency: usize,
    ) -> Self {
        Self {
            provisioner,
            runner,
            template,
            task_dir: task_dir.into(),
            concurrency: concurrency.max(1),
            cancel: CancelToken::never(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the whole batch. Only setup problems (the task directory cannot be
    /// created) are returned as errors; per-target failures are in the report.
    pub async fn run(&self, targets: Vec<Target>) -> Result<BatchReport> {
        tokio::fs::create_dir_all(&self.task_dir).await?;

        let targets = dedup_targets(targets);
        let mut provision_failures = Vec::new();
        let mut units = Vec::new();

        for (target, provisioned) in self.provision_all(targets).await {
            let work_dir = match provisioned {
                Ok(dir) => dir,
                Err(error) => {
                    tracing::error!(repo = %target, error = %error, "Provisioning failed");
                    provision_failures.push(ProvisionFailure {
                        target: target.to_string(),
                        error,
                    });
                    continue;
                }
            };

            match self.template.write_for(&target, &self.task_dir).await {
                Ok(task_spec) => units.push(WorkUnit::for_target(&target, task_spec, work_dir)),
                Err(e) => {
                    tracing::error!(repo = %target, error = %e, "Failed to write task spec");
                    provision_failures.push(ProvisionFailure {
                        target: target.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let summary = Scheduler::new(Arc::clone(&self.runner))
            .with_cancel_token(self.cancel.clone())
            .execute(units, self.concurrency)
            .await;

        Ok(BatchReport {
            provision_failures,
            summary,
        })
    }

    /// Provision with at most `concurrency` targets in flight. Results come
    /// back in input order.
    async fn provision_all(
        &self,
        targets: Vec<Target>,
    ) -> Vec<(Target, std::result::Result<PathBuf, String>)> {
        let slots = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(targets.len());

        for target in targets {
            let provisioner = Arc::clone(&self.provisioner);
            let slots = Arc::clone(&slots);
            let cancel = self.cancel.clone();
            let spawned = target.clone();

            let handle = tokio::spawn(async move {
                let _permit = slots
                    .acquire_owned()
                    .await
                    .map_err(|e| format!("provisioning pool closed: {e}"))?;
                if cancel.is_cancelled() {
                    return Err("cancelled before provisioning".to_string());
                }
                provisioner
                    .provision(&spawned)
                    .await
                    .map_err(|e| e.to_string())
            });
            handles.push((target, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (target, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(format!("provisioning panicked: {e}")),
            };
            results.push((target, result));
        }
        results
    }
}

/// Drop repeated targets; two units must never share a checkout.
fn dedup_targets(targets: Vec<Target>) -> Vec<Target> {
    let mut seen = HashSet::new();
    targets
        .into_iter()
        .filter(|target| {
            let fresh = seen.insert(target.id());
            if !fresh {
                tracing::warn!(repo = %target, "Ignoring duplicate target");
            }
            fresh
        })
        .collect()
}
