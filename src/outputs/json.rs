//! JSON run document.
//!
//! Serializes the [`RunOutput`] (report plus records, including per-field
//! provenance) for consumers that want structured output instead of, or in
//! addition to, the CSV export.
//!
//! # Output Structure
//!
//! ```text
//! {
//!   "report":  { "run_id": ..., "attempted": 10, "succeeded": 8, "outcomes": [...], "export": {...} },
//!   "records": [ { "id": ..., "provenance": { "budget": "Synthetic", ... } }, ... ]
//! }
//! ```

use std::path::Path;
use tokio::fs;
use tracing::{error, info, instrument};

use crate::error::ExportError;
use crate::models::RunOutput;

/// Pretty-printed document for files; compact documents go to stdout.
pub fn to_json(output: &RunOutput, pretty: bool) -> Result<String, serde_json::Error> {
    if pretty {
        serde_json::to_string_pretty(output)
    } else {
        serde_json::to_string(output)
    }
}

/// Write the run document, creating parent directories as needed.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn write_run_document(output: &RunOutput, path: &Path) -> Result<(), ExportError> {
    let json = to_json(output, true).map_err(|e| ExportError::write(path, std::io::Error::other(e)))?;

    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        info!(dir = %dir.display(), "Ensuring report directory exists");
        if let Err(e) = fs::create_dir_all(dir).await {
            error!(dir = %dir.display(), error = %e, "Failed to create report dir");
            return Err(ExportError::write(path, e));
        }
    }

    fs::write(path, json)
        .await
        .map_err(|e| ExportError::write(path, e))?;
    info!(records = output.batch.len(), "Wrote JSON run document");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Batch, ExportStatus, RunReport, SkipReason};
    use chrono::Utc;
    use uuid::Uuid;

    fn empty_output() -> RunOutput {
        let now = Utc::now();
        RunOutput {
            report: RunReport {
                run_id: Uuid::new_v4(),
                started_at: now,
                finished_at: now,
                attempted: 0,
                succeeded: 0,
                failed: 0,
                deduplicated: 0,
                cancelled: false,
                outcomes: vec![],
                export: ExportStatus::Skipped {
                    reason: SkipReason::NoRecords,
                },
            },
            batch: Batch::default(),
        }
    }

    #[test]
    fn test_document_shape() {
        let json = to_json(&empty_output(), false).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["records"].as_array().unwrap().is_empty());
        assert_eq!(value["report"]["export"]["export"], "skipped");
        assert_eq!(value["report"]["export"]["reason"], "no_records");
    }

    #[tokio::test]
    async fn test_write_run_document_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/2025-05-06/run.json");

        write_run_document(&empty_output(), &path).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"run_id\""));
    }
}
