//! Best-effort audit trail of runs.

use std::path::Path;

use chrono::{DateTime, Utc};
use dagflow::{Operation, RunSummary};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct AuditRecord {
    timestamp: DateTime<Utc>,
    operation: String,
    root: String,
    applied: Vec<String>,
    not_applied: Vec<String>,
    failures: Vec<String>,
}

impl AuditRecord {
    fn new(operation: Operation, root: &Path, summary: &RunSummary) -> Self {
        let mut applied: Vec<String> = summary
            .applied
            .iter()
            .map(|path| path.display().to_string())
            .collect();
        applied.sort();
        let mut not_applied: Vec<String> = summary
            .not_applied
            .iter()
            .map(|path| path.display().to_string())
            .collect();
        not_applied.sort();
        Self {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            root: root.display().to_string(),
            applied,
            not_applied,
            failures: summary
                .failures
                .iter()
                .map(|path| path.display().to_string())
                .collect(),
        }
    }
}

/// POST a run summary to the audit endpoint. Failures are logged and
/// never affect the run's outcome.
pub fn post_run_record(url: &str, operation: Operation, root: &Path, summary: &RunSummary) {
    let record = AuditRecord::new(operation, root, summary);
    match ureq::post(url).send_json(&record) {
        Ok(_) => log::debug!("posted audit record to {url}"),
        Err(err) => log::warn!("failed to post audit record to {url}: {err}"),
    }
}
