use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use super::task::WorkUnit;

/// Terminal result of one work unit.
///
/// `error` is set only when the unit could not be executed at all (missing
/// checkout, unreadable task spec, agent not found, timeout, panic). An agent
/// that ran and exited non-zero is a failure without an error detail.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub unit_id: String,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub log_path: Option<PathBuf>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl Outcome {
    /// The agent process ran to completion; `exit_code` decides success.
    pub fn completed(
        unit: &WorkUnit,
        exit_code: Option<i32>,
        started_at: DateTime<Utc>,
        duration: Duration,
        log_path: PathBuf,
    ) -> Self {
        Self {
            unit_id: unit.id().to_string(),
            success: exit_code == Some(0),
            started_at,
            finished_at: Utc::now(),
            duration,
            log_path: Some(log_path),
            exit_code,
            error: None,
        }
    }

    /// The unit could not be executed.
    pub fn errored(
        unit_id: &str,
        started_at: DateTime<Utc>,
        duration: Duration,
        log_path: Option<PathBuf>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            success: false,
            started_at,
            finished_at: Utc::now(),
            duration,
            log_path,
            exit_code: None,
            error: Some(error.into()),
        }
    }

    /// A unit that never started (e.g. the batch was cancelled first).
    pub fn skipped(unit: &WorkUnit, reason: impl Into<String>) -> Self {
        Self::errored(unit.id(), Utc::now(), Duration::ZERO, None, reason)
    }
}

/// Aggregate of every outcome in a batch, in submission order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionSummary {
    pub successful: usize,
    pub failed: usize,
    pub outcomes: Vec<Outcome>,
    #[serde(rename = "total_duration_ms", serialize_with = "serialize_millis")]
    pub total_duration: Duration,
}

impl ExecutionSummary {
    pub fn total(&self) -> usize {
        self.successful + self.failed
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter().filter(|o| !o.success)
    }

    /// Count one arriving outcome.
    pub(crate) fn tally(&mut self, outcome: &Outcome) {
        if outcome.success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}
