//! Run orchestration.
//!
//! A run drives every source through fetch, extract, normalize and enrich
//! with bounded concurrency, collects the records, and exports the batch
//! once at the end.
//!
//! # Failure Isolation
//!
//! Fetch and extract errors end the unit they happen in and are recorded in
//! the [`RunReport`]; they never abort sibling units. Only an export failure
//! fails the run, and the report and collected batch travel inside the error.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::collector::Collector;
use crate::config::RunConfig;
use crate::enrich::{Summarizer, enrich_record};
use crate::error::{FailureKind, PipelineError};
use crate::extract::extract;
use crate::fetch::{PageFetcher, RetryFetch};
use crate::models::{
    Batch, ExportStatus, RunOutput, RunReport, SkipReason, SourceOutcome, SourceRef, SourceStatus,
};
use crate::normalize::{Clock, Normalizer, SystemClock};
use crate::outputs::csv::CsvExporter;
use crate::utils::truncate_for_log;

/// Run-level knobs taken from [`RunConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub worker_count: usize,
    pub dedupe_by_url: bool,
    pub discard_on_cancel: bool,
    pub export_destination: PathBuf,
}

impl From<&RunConfig> for PipelineOptions {
    fn from(config: &RunConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            dedupe_by_url: config.dedupe_by_url,
            discard_on_cancel: config.discard_on_cancel,
            export_destination: config.export_destination.clone(),
        }
    }
}

pub struct Pipeline<F, S> {
    fetcher: RetryFetch<F>,
    normalizer: Normalizer,
    summarizer: S,
    exporter: CsvExporter,
    clock: Box<dyn Clock + Send + Sync>,
    options: PipelineOptions,
}

impl<F, S> Pipeline<F, S>
where
    F: PageFetcher,
    S: Summarizer,
{
    pub fn new(
        fetcher: RetryFetch<F>,
        normalizer: Normalizer,
        summarizer: S,
        options: PipelineOptions,
    ) -> Self {
        Self {
            fetcher,
            normalizer,
            summarizer,
            exporter: CsvExporter,
            clock: Box::new(SystemClock),
            options,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn fetcher(&self) -> &RetryFetch<F> {
        &self.fetcher
    }

    /// Execute one run over `sources`.
    ///
    /// Cancelling `cancel` stops new fetches from starting (those sources are
    /// reported as [`FailureKind::Cancelled`]) and interrupts retry backoffs.
    /// Fetches already on the wire are allowed to finish, and whatever was
    /// collected is exported unless `discard_on_cancel` is set.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::NoSources`] if `sources` is empty
    /// - [`PipelineError::Export`] if the batch could not be written
    #[instrument(level = "info", skip_all, fields(sources = sources.len(), workers = self.options.worker_count))]
    pub async fn run(
        &self,
        sources: &[SourceRef],
        cancel: &CancellationToken,
    ) -> Result<RunOutput, PipelineError> {
        if sources.is_empty() {
            return Err(PipelineError::NoSources);
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let t0 = Instant::now();
        info!(%run_id, "Run starting");

        let collector = Collector::new(self.options.dedupe_by_url);
        let collector_ref = &collector;

        let mut indexed: Vec<(usize, SourceOutcome)> = stream::iter(sources.iter().enumerate())
            .map(|(i, source)| async move { (i, self.run_unit(source, cancel, collector_ref).await) })
            .buffer_unordered(self.options.worker_count.max(1))
            .collect()
            .await;
        indexed.sort_by_key(|(i, _)| *i);
        let outcomes: Vec<SourceOutcome> = indexed.into_iter().map(|(_, o)| o).collect();

        let cancelled = cancel.is_cancelled();
        let deduplicated = collector.dropped();
        let mut batch = collector.finish();

        let succeeded = outcomes
            .iter()
            .filter(|o| matches!(o.status, SourceStatus::Succeeded { .. }))
            .count();
        let failed = outcomes.len() - succeeded;

        let mut report = RunReport {
            run_id,
            started_at,
            finished_at: started_at,
            attempted: sources.len(),
            succeeded,
            failed,
            deduplicated,
            cancelled,
            outcomes,
            export: ExportStatus::Skipped {
                reason: SkipReason::NoRecords,
            },
        };

        let export_result = if cancelled && self.options.discard_on_cancel {
            warn!(dropped = batch.len(), "Run cancelled; discarding collected records");
            batch = Batch::default();
            report.export = ExportStatus::Skipped {
                reason: SkipReason::Discarded,
            };
            Ok(())
        } else if batch.is_empty() {
            warn!(failed, "No records collected; export skipped");
            Ok(())
        } else {
            match self
                .exporter
                .export(&batch, &self.options.export_destination)
                .await
            {
                Ok(summary) => {
                    info!(
                        rows = summary.rows,
                        bytes = summary.bytes,
                        destination = %summary.destination.display(),
                        "Batch exported"
                    );
                    report.export = ExportStatus::Written {
                        destination: summary.destination.display().to_string(),
                        rows: summary.rows,
                    };
                    Ok(())
                }
                Err(e) => {
                    error!(error = %e, "Export failed");
                    report.export = ExportStatus::Failed {
                        error: e.to_string(),
                    };
                    Err(e)
                }
            }
        };

        report.finished_at = Utc::now();
        info!(
            %run_id,
            attempted = report.attempted,
            succeeded,
            failed,
            deduplicated,
            records = batch.len(),
            cancelled,
            elapsed_ms_total = t0.elapsed().as_millis() as u64,
            "Run complete"
        );

        match export_result {
            Ok(()) => Ok(RunOutput { report, batch }),
            Err(error) => Err(PipelineError::Export {
                error,
                output: Box::new(RunOutput { report, batch }),
            }),
        }
    }

    /// One source from fetch to collection. Never fails; the outcome says
    /// what happened.
    #[instrument(level = "debug", skip_all, fields(url = %source))]
    async fn run_unit(
        &self,
        source: &SourceRef,
        cancel: &CancellationToken,
        collector: &Collector,
    ) -> SourceOutcome {
        let (fetched, attempts) = self.fetcher.fetch(source, cancel).await;

        let page = match fetched {
            Ok(page) => page,
            Err(failure) => {
                return SourceOutcome {
                    url: source.to_string(),
                    status: SourceStatus::Failed {
                        kind: failure.kind(),
                        message: failure.to_string(),
                    },
                    attempts,
                };
            }
        };

        let bag = match extract(&page) {
            Ok(bag) => bag,
            Err(e) => {
                warn!(
                    error = %e,
                    bytes = page.body.len(),
                    body_preview = %truncate_for_log(&page.body, 200),
                    "Extraction failed"
                );
                return SourceOutcome {
                    url: source.to_string(),
                    status: SourceStatus::Failed {
                        kind: FailureKind::Unparseable,
                        message: e.to_string(),
                    },
                    attempts,
                };
            }
        };

        let record = self.normalizer.normalize(&bag, source, self.clock.as_ref());
        let record = enrich_record(&self.summarizer, record).await;
        let record_id = record.id;
        let collected = collector.add(record);
        debug!(
            %record_id,
            collected,
            fetched_at = %page.fetched_at,
            status = page.status,
            "Unit finished"
        );

        SourceOutcome {
            url: source.to_string(),
            status: SourceStatus::Succeeded {
                record_id,
                collected,
            },
            attempts,
        }
    }
}

pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_NO_SOURCES: u8 = 2;
pub const EXIT_NOTHING_EXPORTED: u8 = 3;

/// Process exit status for a finished run.
pub fn exit_code(result: &Result<RunOutput, PipelineError>, allow_empty_export: bool) -> u8 {
    match result {
        Ok(output) => match output.report.export {
            ExportStatus::Written { .. } => EXIT_OK,
            ExportStatus::Skipped {
                reason: SkipReason::Discarded,
            } => EXIT_OK,
            ExportStatus::Skipped {
                reason: SkipReason::NoRecords,
            } if allow_empty_export => EXIT_OK,
            ExportStatus::Skipped { .. } => EXIT_NOTHING_EXPORTED,
            ExportStatus::Failed { .. } => EXIT_FAILURE,
        },
        Err(PipelineError::NoSources) => EXIT_NO_SOURCES,
        Err(PipelineError::Export { .. }) => EXIT_FAILURE,
    }
}
