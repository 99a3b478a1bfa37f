//! # Project Ingest
//!
//! Scrapes public construction-project and tender listings, normalizes every
//! page into one fixed-schema record, and exports the batch as CSV for
//! downstream analytics.
//!
//! ## Features
//!
//! - Bounded-concurrency fetching with per-request timeouts and retries
//! - Title, description and hint extraction from meta tags and JSON-LD
//! - Deterministic, provenance-tracked defaults for fields a page lacks
//! - URL de-duplication, CSV export, and an optional JSON run document
//! - Optional description summaries through an OpenAI-compatible LLM API
//!   (`summarize` feature)
//!
//! ## Usage
//!
//! ```sh
//! project_ingest --config ingest.yaml -o ./standardized_data.csv
//! project_ingest --every 3600 --json https://dot.ca.gov/ https://www.enr.com/
//! ```
//!
//! ## Architecture
//!
//! 1. **Fetching**: Retrieve each source page ([`fetch`])
//! 2. **Extraction**: Pull an attribute bag out of the markup ([`extract`])
//! 3. **Normalization**: Fill the canonical schema ([`normalize`])
//! 4. **Collection and export**: Gather records and write CSV ([`collector`], [`outputs`])

use clap::Parser;
use std::error::Error;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;
mod collector;
mod config;
mod enrich;
mod error;
mod extract;
mod fetch;
mod models;
mod normalize;
mod outputs;
mod pipeline;
#[cfg(test)]
mod testing;
mod utils;

use cli::Cli;
use config::RunConfig;
use enrich::{NoSummary, SummaryBackend, Summarizer};
use error::PipelineError;
use fetch::{HttpFetcher, PageFetcher, RetryFetch};
use models::SourceRef;
use normalize::Normalizer;
use outputs::json;
use pipeline::{EXIT_FAILURE, EXIT_NO_SOURCES, Pipeline, PipelineOptions, exit_code};
use utils::ensure_writable_parent;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = Instant::now();
    info!("project_ingest starting up");

    let args = Cli::parse();
    debug!(?args.config, ?args.output, sources = args.sources.len(), "Parsed CLI arguments");

    let config = match RunConfig::from_cli(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(Box::new(e) as Box<dyn Error>);
        }
    };
    let sources = config.source_refs()?;

    // Early check: a bad destination should fail before anything is fetched
    if let Err(e) = ensure_writable_parent(&config.export_destination).await {
        error!(
            path = %config.export_destination.display(),
            error = %e,
            "Export destination is not writable (fix perms or choose a different path)"
        );
        return Err(Box::new(e) as Box<dyn Error>);
    }
    if let Some(report_path) = &config.report_path {
        ensure_writable_parent(report_path).await?;
    }

    let fetcher = RetryFetch::new(
        HttpFetcher::new(&config.user_agent),
        config.retry_limit,
        config.fetch_timeout(),
        config.retry_base_delay(),
    );
    let pipeline = Pipeline::new(
        fetcher,
        Normalizer::new(config.defaults.clone()),
        summary_backend(&args).await,
        PipelineOptions::from(&config),
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; letting in-flight fetches finish");
                cancel.cancel();
            }
        });
    }

    let mut runs = 0u64;
    let code = loop {
        runs += 1;
        let code = run_once(&pipeline, &sources, &config, &cancel, args.json).await;

        let Some(every) = args.every else { break code };
        if code == EXIT_NO_SOURCES || cancel.is_cancelled() {
            break code;
        }
        info!(run = runs, next_in_secs = every, "Waiting for next run");
        tokio::select! {
            _ = sleep(Duration::from_secs(every)) => {}
            _ = cancel.cancelled() => break code,
        }
    };

    let sessions = pipeline.fetcher().inner().sessions();
    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        runs,
        peak_sessions = sessions.peak(),
        open_sessions = sessions.in_flight(),
        exit_code = code,
        "Execution complete"
    );
    Ok(ExitCode::from(code))
}

/// Pick the summarizer. Falls back to no summaries if the LLM backend cannot
/// be set up; enrichment is never a reason to abort a run.
async fn summary_backend(args: &Cli) -> SummaryBackend {
    if !args.summarize {
        return SummaryBackend::Disabled(NoSummary);
    }
    llm_backend(&args.summary_template).await
}

#[cfg(feature = "summarize")]
async fn llm_backend(template: &str) -> SummaryBackend {
    match enrich::LlmSummarizer::load(template, None).await {
        Ok(llm) => {
            info!(%template, "Summaries enabled");
            SummaryBackend::Llm(llm)
        }
        Err(e) => {
            warn!(error = %e, "Summarizer unavailable; continuing without summaries");
            SummaryBackend::Disabled(NoSummary)
        }
    }
}

#[cfg(not(feature = "summarize"))]
async fn llm_backend(template: &str) -> SummaryBackend {
    warn!(%template, "Built without the `summarize` feature; continuing without summaries");
    SummaryBackend::Disabled(NoSummary)
}

/// One pipeline run plus its side outputs. Returns the process exit code.
#[instrument(level = "info", skip_all)]
async fn run_once<F, S>(
    pipeline: &Pipeline<F, S>,
    sources: &[SourceRef],
    config: &RunConfig,
    cancel: &CancellationToken,
    print_json: bool,
) -> u8
where
    F: PageFetcher,
    S: Summarizer,
{
    let result = pipeline.run(sources, cancel).await;
    let mut code = exit_code(&result, config.allow_empty_export);

    let document = match &result {
        Ok(output) => Some(output.clone()),
        Err(PipelineError::Export { error, output }) => {
            error!(error = %error, records = output.batch.len(), "Run failed while exporting");
            Some(output.as_ref().clone())
        }
        Err(PipelineError::NoSources) => {
            error!("No sources configured; pass URLs or set `sources` in the config file");
            None
        }
    };

    if let Some(document) = document {
        for (url, kind) in document.report.failures() {
            warn!(%url, %kind, "Source failed");
        }

        if let Some(path) = &config.report_path {
            if let Err(e) = json::write_run_document(&document, path).await {
                error!(error = %e, "Failed to write run document");
                code = EXIT_FAILURE;
            }
        }

        if print_json {
            match json::to_json(&document, false) {
                Ok(text) => println!("{text}"),
                Err(e) => {
                    error!(error = %e, "Failed to serialize run document");
                    code = EXIT_FAILURE;
                }
            }
        }
    }

    code
}
