use std::path::Path;

use crate::error::Result;
use crate::workflow::batch::BatchReport;

/// Log one line per target and a closing totals line.
pub fn log_report(report: &BatchReport) {
    for failure in &report.provision_failures {
        tracing::warn!(
            repo = %failure.target,
            error = %failure.error,
            "Not run: provisioning failed"
        );
    }

    for outcome in &report.summary.outcomes {
        let log = outcome
            .log_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        if outcome.success {
            tracing::info!(
                unit = %outcome.unit_id,
                duration_ms = outcome.duration.as_millis() as u64,
                log = %log,
                "Succeeded"
            );
        } else if let Some(error) = &outcome.error {
            tracing::warn!(unit = %outcome.unit_id, error = %error, log = %log, "Could not run");
        } else {
            tracing::warn!(
                unit = %outcome.unit_id,
                exit_code = ?outcome.exit_code,
                log = %log,
                "Agent failed"
            );
        }
    }

    let summary = &report.summary;
    tracing::info!(
        successful = summary.successful,
        failed = summary.failed,
        not_provisioned = report.provision_failures.len(),
        duration_ms = summary.total_duration.as_millis() as u64,
        "Batch complete"
    );
}

/// Persist the report as pretty-printed JSON.
pub async fn write_report(report: &BatchReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(report)?;
    tokio::fs::write(path, json).await?;
    tracing::info!(path = %path.display(), "Wrote batch report");
    Ok(())
}
