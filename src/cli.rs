//! Command-line interface definitions.
//!
//! Every flag overrides the matching key of the optional YAML config file.
//! Flags that take values can also be supplied through environment variables.

use clap::Parser;

/// Command-line arguments for a pipeline run.
///
/// # Examples
///
/// ```sh
/// # One-shot run over two pages
/// project_ingest -o projects.csv https://dot.ca.gov/ https://www.enr.com/
///
/// # Sources and deployment defaults from a file, re-run hourly
/// project_ingest --config ingest.yaml --every 3600
///
/// # Print the run report and records as JSON
/// project_ingest --config ingest.yaml --json
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Source URLs to scrape (replaces `sources` from the config file)
    pub sources: Vec<String>,

    /// Optional path to a YAML run configuration
    #[arg(short, long, env = "INGEST_CONFIG")]
    pub config: Option<String>,

    /// CSV export destination
    #[arg(short, long, env = "INGEST_OUTPUT")]
    pub output: Option<String>,

    /// Write the run report and records as JSON to this path
    #[arg(long, env = "INGEST_REPORT")]
    pub report: Option<String>,

    /// Number of sources processed concurrently
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Per-request timeout in seconds
    #[arg(long = "timeout")]
    pub timeout_secs: Option<u64>,

    /// Retries for transient fetch failures
    #[arg(long)]
    pub retries: Option<u32>,

    /// Keep one record per source entry even when URLs repeat
    #[arg(long)]
    pub keep_duplicates: bool,

    /// Treat a run with zero exported records as success
    #[arg(long)]
    pub allow_empty_export: bool,

    /// Drop collected records instead of exporting them when interrupted
    #[arg(long)]
    pub discard_on_cancel: bool,

    /// Re-run every N seconds until interrupted
    #[arg(long, value_name = "SECS")]
    pub every: Option<u64>,

    /// Print `{report, records}` as JSON on stdout after each run
    #[arg(long)]
    pub json: bool,

    /// Summarize descriptions with the configured LLM (`summarize` feature)
    #[arg(long)]
    pub summarize: bool,

    /// Chat template used for summaries
    #[arg(long, default_value = "project_summary")]
    pub summary_template: String,
}
