pub mod outcome;
pub mod task;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};

use crate::agent::runner::UnitRunner;
use crate::shutdown::CancelToken;

use outcome::{ExecutionSummary, Outcome};
use task::WorkUnit;

/// Units waiting for a worker, tagged with their submission index.
type PendingQueue = Arc<Mutex<VecDeque<(usize, WorkUnit)>>>;

/// Bounded worker pool that runs every submitted unit exactly once.
///
/// `max_concurrency` workers pull from a shared queue; each runs one unit to
/// completion before taking the next. A unit's failure (or panic) becomes a
/// failed `Outcome` and never stops the other workers.
pub struct Scheduler {
    runner: Arc<dyn UnitRunner>,
    cancel: CancelToken,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn UnitRunner>) -> Self {
        Self {
            runner,
            cancel: CancelToken::never(),
        }
    }

    /// Stop handing out queued units once `cancel` fires.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run all units, at most `max_concurrency` at a time, and wait for every
    /// one to finish. Units are dispatched and reported in ascending id order.
    pub async fn execute(
        &self,
        mut units: Vec<WorkUnit>,
        max_concurrency: usize,
    ) -> ExecutionSummary {
        let clock = Instant::now();
        units.sort_by(|a, b| a.id().cmp(b.id()));

        let total = units.len();
        let unit_ids: Vec<String> = units.iter().map(|u| u.id().to_string()).collect();
        let workers = max_concurrency.max(1).min(total.max(1));

        tracing::info!(units = total, workers, "Dispatching work units");

        let queue: PendingQueue =
            Arc::new(Mutex::new(units.into_iter().enumerate().collect()));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, Outcome)>();

        for worker in 0..workers {
            tokio::spawn(worker_loop(
                worker,
                Arc::clone(&queue),
                Arc::clone(&self.runner),
                self.cancel.clone(),
                tx.clone(),
            ));
        }
        // Workers hold the remaining senders; the channel closes when the last one exits.
        drop(tx);

        let mut summary = ExecutionSummary::default();
        let mut slots: Vec<Option<Outcome>> = vec![None; total];

        while let Some((index, outcome)) = rx.recv().await {
            summary.tally(&outcome);
            tracing::info!(
                unit = %outcome.unit_id,
                success = outcome.success,
                done = summary.total(),
                total,
                "Unit finished"
            );
            slots[index] = Some(outcome);
        }

        // Every unit is claimed by exactly one worker; a gap means a worker
        // died outside `run_isolated`, and the unit still has to be counted.
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                let outcome = Outcome::errored(
                    &unit_ids[index],
                    Utc::now(),
                    Duration::ZERO,
                    None,
                    "worker exited before reporting",
                );
                summary.tally(&outcome);
                *slot = Some(outcome);
            }
        }

        summary.outcomes = slots.into_iter().flatten().collect();
        summary.total_duration = clock.elapsed();

        tracing::info!(
            successful = summary.successful,
            failed = summary.failed,
            duration_ms = summary.total_duration.as_millis() as u64,
            "All units finished"
        );

        summary
    }
}

async fn worker_loop(
    worker: usize,
    queue: PendingQueue,
    runner: Arc<dyn UnitRunner>,
    cancel: CancelToken,
    results: mpsc::UnboundedSender<(usize, Outcome)>,
) {
    loop {
        let next = queue.lock().await.pop_front();
        let Some((index, unit)) = next else {
            break;
        };

        let outcome = if cancel.is_cancelled() {
            tracing::warn!(worker, unit = %unit.id(), "Skipping unit, batch cancelled");
            Outcome::skipped(&unit, "cancelled before start")
        } else {
            tracing::debug!(worker, unit = %unit.id(), "Worker picked up unit");
            run_isolated(Arc::clone(&runner), unit).await
        };

        if results.send((index, outcome)).is_err() {
            break;
        }
    }
}

/// Run one unit on its own task so a panic is confined to that unit.
async fn run_isolated(runner: Arc<dyn UnitRunner>, unit: WorkUnit) -> Outcome {
    let unit_id = unit.id().to_string();
    let started_at = Utc::now();
    let clock = Instant::now();

    match tokio::spawn(async move { runner.run(&unit).await }).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(unit = %unit_id, error = %e, "Unit runner panicked");
            Outcome::errored(
                &unit_id,
                started_at,
                clock.elapsed(),
                None,
                format!("runner panicked: {e}"),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::shutdown::Cancellation;

    /// Fake runner that sleeps, tracks concurrency, and fails chosen units.
    struct FakeRunner {
        delay: Duration,
        fail: Vec<String>,
        panic_on: Vec<String>,
        running: AtomicUsize,
        peak: AtomicUsize,
        calls: std::sync::Mutex<HashMap<String, usize>>,
    }

    impl FakeRunner {
        fn new(delay_ms: u64) -> Self {
            Self {
                delay: Duration::from_millis(delay_ms),
                fail: Vec::new(),
                panic_on: Vec::new(),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: std::sync::Mutex::new(HashMap::new()),
            }
        }

        fn failing(mut self, id: &str) -> Self {
            self.fail.push(id.to_string());
            self
        }

        fn panicking(mut self, id: &str) -> Self {
            self.panic_on.push(id.to_string());
            self
        }

        fn calls(&self, id: &str) -> usize {
            self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().values().sum()
        }
    }

    #[async_trait]
    impl UnitRunner for FakeRunner {
        async fn run(&self, unit: &WorkUnit) -> Outcome {
            *self.calls.lock().unwrap().entry(unit.id().to_string()).or_default() += 1;
            let started_at = Utc::now();
            let clock = Instant::now();

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.panic_on.iter().any(|id| id == unit.id()) {
                panic!("runner blew up on {}", unit.id());
            }

            let exit_code = if self.fail.iter().any(|id| id == unit.id()) { 1 } else { 0 };
            Outcome::completed(
                unit,
                Some(exit_code),
                started_at,
                clock.elapsed(),
                format!("/tmp/logs/{}.log", unit.id()).into(),
            )
        }
    }

    fn units(ids: &[&str]) -> Vec<WorkUnit> {
        ids.iter()
            .map(|id| WorkUnit::new(*id, format!("/tmp/tasks/{id}.md"), format!("/tmp/ws/{id}")))
            .collect()
    }

    /// Smallest gap between one outcome's end and the next one's start.
    fn min_gap(outcomes: &[Outcome]) -> Option<chrono::TimeDelta> {
        outcomes
            .windows(2)
            .map(|pair| pair[1].started_at - pair[0].finished_at)
            .min()
    }

    fn ids(summary: &ExecutionSummary) -> Vec<&str> {
        summary.outcomes.iter().map(|o| o.unit_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_every_unit_yields_one_outcome() {
        for (n, c) in [(0, 1), (1, 1), (5, 2), (7, 3), (3, 10)] {
            let names: Vec<String> = (0..n).map(|i| format!("unit-{i:02}")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let runner = Arc::new(FakeRunner::new(5).failing("unit-01"));
            let scheduler = Scheduler::new(runner.clone());

            let summary = scheduler.execute(units(&refs), c).await;

            assert_eq!(summary.outcomes.len(), n, "n={n} c={c}");
            assert_eq!(summary.successful + summary.failed, n, "n={n} c={c}");
            assert_eq!(runner.total_calls(), n);
        }
    }

    #[tokio::test]
    async fn test_sequential_runs_in_submission_order_without_overlap() {
        let runner = Arc::new(FakeRunner::new(20));
        let scheduler = Scheduler::new(runner.clone());

        let summary = scheduler.execute(units(&["c", "a", "d", "b"]), 1).await;

        assert_eq!(ids(&summary), vec!["a", "b", "c", "d"]);
        assert_eq!(runner.peak.load(Ordering::SeqCst), 1);
        assert!(min_gap(&summary.outcomes).unwrap() >= chrono::TimeDelta::zero());
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_bound() {
        let runner = Arc::new(FakeRunner::new(50));
        let scheduler = Scheduler::new(runner.clone());
        let names = ["a", "b", "c", "d", "e", "f", "g", "h", "i"];

        let summary = scheduler.execute(units(&names), 3).await;

        let peak = runner.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency was {peak}");
        assert!(peak > 1, "units never overlapped");
        assert_eq!(summary.successful, 9);
    }

    #[tokio::test]
    async fn test_results_reported_in_id_order_despite_completion_order() {
        let runner = Arc::new(FakeRunner::new(10));
        let scheduler = Scheduler::new(runner);

        let summary = scheduler
            .execute(units(&["zeta", "alpha", "mid", "beta"]), 4)
            .await;

        assert_eq!(ids(&summary), vec!["alpha", "beta", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_block_siblings() {
        let runner = Arc::new(FakeRunner::new(10).failing("b"));
        let scheduler = Scheduler::new(runner);

        let summary = scheduler.execute(units(&["a", "b", "c", "d"]), 2).await;

        assert_eq!(summary.successful, 3);
        assert_eq!(summary.failed, 1);
        let failed: Vec<&str> = summary.failures().map(|o| o.unit_id.as_str()).collect();
        assert_eq!(failed, vec!["b"]);
        assert!(!summary.all_succeeded());
    }

    #[tokio::test]
    async fn test_panicking_unit_becomes_failed_outcome() {
        let runner = Arc::new(FakeRunner::new(5).panicking("b"));
        let scheduler = Scheduler::new(runner);

        let summary = scheduler.execute(units(&["a", "b", "c"]), 2).await;

        assert_eq!(summary.successful, 2);
        assert_eq!(summary.failed, 1);
        let b = &summary.outcomes[1];
        assert_eq!(b.unit_id, "b");
        assert!(b.error.as_deref().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_rerun_executes_every_unit_again() {
        let runner = Arc::new(FakeRunner::new(5).failing("b"));
        let scheduler = Scheduler::new(runner.clone());
        let batch = units(&["a", "b", "c"]);

        let first = scheduler.execute(batch.clone(), 2).await;
        let second = scheduler.execute(batch, 2).await;

        assert_eq!(first.failed, 1);
        assert_eq!(second.failed, 1);
        for id in ["a", "b", "c"] {
            assert_eq!(runner.calls(id), 2, "unit {id}");
        }
    }

    #[tokio::test]
    async fn test_cancelled_batch_skips_queued_units() {
        let cancellation = Cancellation::new();
        cancellation.cancel();
        let runner = Arc::new(FakeRunner::new(5));
        let scheduler = Scheduler::new(runner.clone()).with_cancel_token(cancellation.token());

        let summary = scheduler.execute(units(&["a", "b", "c"]), 2).await;

        assert_eq!(runner.total_calls(), 0);
        assert_eq!(summary.failed, 3);
        assert!(summary
            .outcomes
            .iter()
            .all(|o| o.error.as_deref() == Some("cancelled before start")));
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_treated_as_sequential() {
        let runner = Arc::new(FakeRunner::new(5));
        let scheduler = Scheduler::new(runner.clone());

        let summary = scheduler.execute(units(&["a", "b"]), 0).await;

        assert_eq!(summary.successful, 2);
        assert_eq!(runner.peak.load(Ordering::SeqCst), 1);
    }
}
