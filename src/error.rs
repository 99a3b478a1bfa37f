//! Typed errors for each pipeline stage.
//!
//! Fetch and extract errors are caught at the per-source unit boundary and
//! recorded in the run report. Export errors end the run.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::models::RunOutput;

/// Why a single fetch attempt failed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("blocked or forbidden (HTTP {status})")]
    BlockedOrForbidden { status: u16 },

    #[error("malformed request: {0}")]
    Malformed(String),
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::Timeout(_) => FailureKind::Timeout,
            FetchError::NetworkFailure(_) => FailureKind::NetworkFailure,
            FetchError::BlockedOrForbidden { .. } => FailureKind::BlockedOrForbidden,
            FetchError::Malformed(_) => FailureKind::Malformed,
        }
    }

    /// Timeouts and network failures are worth another attempt; a refusal or
    /// a request that can never succeed as written is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Timeout(_) | FetchError::NetworkFailure(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractError {
    #[error("page payload is not parseable markup: {0}")]
    Unparseable(String),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("refusing to export an empty batch")]
    EmptyBatch,

    #[error("failed writing {path}: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ExportError {
    pub(crate) fn write(path: impl Into<PathBuf>, source: impl Into<std::io::Error>) -> Self {
        ExportError::WriteFailure {
            path: path.into(),
            source: source.into(),
        }
    }
}

/// Errors from the optional summarization collaborator. Never fatal.
#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("summarizer unavailable: {0}")]
    Unavailable(String),

    #[error("summarizer failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed reading config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed parsing config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid source {url:?}: {reason}")]
    InvalidSource { url: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Terminal outcomes of [`crate::pipeline::Pipeline::run`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no sources configured")]
    NoSources,

    #[error("export failed: {error}")]
    Export {
        #[source]
        error: ExportError,
        /// Report and collected records, so callers can still emit them.
        output: Box<RunOutput>,
    },
}

/// Per-source failure category as it appears in the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureKind {
    Timeout,
    NetworkFailure,
    BlockedOrForbidden,
    Malformed,
    Unparseable,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Timeout => "Timeout",
            FailureKind::NetworkFailure => "NetworkFailure",
            FailureKind::BlockedOrForbidden => "BlockedOrForbidden",
            FailureKind::Malformed => "Malformed",
            FailureKind::Unparseable => "Unparseable",
            FailureKind::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}
