//! CSV export of a batch.
//!
//! The header is [`CanonicalRecord::COLUMNS`] and never changes order. Nested
//! values are flattened into a single cell (`map_coordinates` as compact
//! JSON), so every row has exactly one cell per column.

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{error, info, instrument};

use crate::error::ExportError;
use crate::models::{Batch, CanonicalRecord};

/// What a successful export wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportSummary {
    pub destination: PathBuf,
    pub rows: usize,
    pub bytes: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CsvExporter;

impl CsvExporter {
    /// Write `batch` to `destination`, replacing any existing file.
    ///
    /// # Errors
    ///
    /// - [`ExportError::EmptyBatch`] if there is nothing to write; the
    ///   destination is not touched.
    /// - [`ExportError::WriteFailure`] on any I/O error. A partially written
    ///   file must be discarded by the caller.
    #[instrument(level = "info", skip_all, fields(destination = %destination.display(), rows = batch.len()))]
    pub async fn export(
        &self,
        batch: &Batch,
        destination: &Path,
    ) -> Result<ExportSummary, ExportError> {
        if batch.is_empty() {
            return Err(ExportError::EmptyBatch);
        }

        let bytes = render(batch).map_err(|e| ExportError::write(destination, e))?;

        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!(dir = %parent.display(), error = %e, "Failed to create export directory");
                return Err(ExportError::write(destination, e));
            }
        }

        fs::write(destination, &bytes)
            .await
            .map_err(|e| ExportError::write(destination, e))?;
        info!(bytes = bytes.len(), "Wrote CSV export");

        Ok(ExportSummary {
            destination: destination.to_path_buf(),
            rows: batch.len(),
            bytes: bytes.len(),
        })
    }
}

/// Serialize header and rows in memory.
pub fn render(batch: &Batch) -> Result<Vec<u8>, std::io::Error> {
    let mut writer = ::csv::WriterBuilder::new()
        .terminator(::csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(CanonicalRecord::COLUMNS)?;
    for record in batch.records() {
        let row = record.to_row().map_err(std::io::Error::other)?;
        writer.write_record(&row)?;
    }
    writer
        .into_inner()
        .map_err(|e| std::io::Error::other(e.to_string()))
}
