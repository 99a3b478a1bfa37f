//! Optional description summaries.
//!
//! Summaries come from an external model and are strictly best effort: a
//! failed or missing summary leaves the record as normalized.

use tracing::{debug, instrument, warn};

use crate::error::EnrichError;
use crate::models::{CanonicalRecord, FieldOrigin};

/// Trait for turning free text into a short summary.
pub trait Summarizer {
    /// `Ok(None)` means "no summary available", which is not an error.
    async fn summarize(&self, text: &str) -> Result<Option<String>, EnrichError>;
}

/// Summarizer that never produces anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSummary;

impl Summarizer for NoSummary {
    async fn summarize(&self, _text: &str) -> Result<Option<String>, EnrichError> {
        Ok(None)
    }
}

/// Replace the record's description with a summary when one is available.
///
/// Records with an empty description are passed through untouched.
#[instrument(level = "debug", skip_all, fields(url = %record.url))]
pub async fn enrich_record<S: Summarizer>(summarizer: &S, record: CanonicalRecord) -> CanonicalRecord {
    if record.description.is_empty() {
        return record;
    }
    match summarizer.summarize(&record.description).await {
        Ok(Some(summary)) if !summary.trim().is_empty() => {
            debug!(chars = summary.len(), "Description summarized");
            let mut provenance = record.provenance;
            provenance.set("description", FieldOrigin::Enriched);
            CanonicalRecord {
                description: summary.trim().to_string(),
                provenance,
                ..record
            }
        }
        Ok(_) => record,
        Err(e) => {
            warn!(error = %e, "Summary failed; keeping scraped description");
            record
        }
    }
}

#[cfg(feature = "summarize")]
pub use llm::LlmSummarizer;

#[cfg(feature = "summarize")]
mod llm {
    use awful_aj::api::ask;
    use awful_aj::{config, config::AwfulJadeConfig, config_dir, template, template::ChatTemplate};
    use std::time::Instant;
    use tracing::{info, instrument, warn};

    use super::Summarizer;
    use crate::error::EnrichError;

    /// Summaries from an OpenAI-compatible endpoint, configured the same way
    /// as the `aj` CLI (`config.yaml` plus a named chat template).
    pub struct LlmSummarizer {
        config: AwfulJadeConfig,
        template: ChatTemplate,
    }

    impl std::fmt::Debug for LlmSummarizer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("LlmSummarizer").finish_non_exhaustive()
        }
    }

    impl LlmSummarizer {
        #[instrument(level = "info")]
        pub async fn load(template_name: &str, config_path: Option<&str>) -> Result<Self, EnrichError> {
            let template = template::load_template(template_name)
                .await
                .map_err(|e| EnrichError::Unavailable(format!("template {template_name}: {e}")))?;
            let path = match config_path {
                Some(p) => p.to_string(),
                None => config_dir()
                    .map_err(|e| EnrichError::Unavailable(e.to_string()))?
                    .join("config.yaml")
                    .to_string_lossy()
                    .into_owned(),
            };
            let config = config::load_config(&path)
                .map_err(|e| EnrichError::Unavailable(format!("config {path}: {e}")))?;
            info!(config_path = %path, "Loaded summarizer configuration");
            Ok(Self { config, template })
        }
    }

    impl Summarizer for LlmSummarizer {
        #[instrument(level = "info", skip_all)]
        async fn summarize(&self, text: &str) -> Result<Option<String>, EnrichError> {
            let t0 = Instant::now();
            let prompt = format!("Summarize the following text: {text}");
            let res = ask(&self.config, prompt, &self.template, None, None).await;
            let dt = t0.elapsed();
            match res {
                Ok(summary) => {
                    info!(elapsed_ms = dt.as_millis() as u64, "Summary received");
                    Ok(Some(summary))
                }
                Err(e) => {
                    warn!(elapsed_ms = dt.as_millis() as u64, error = %e, "Summary call failed");
                    Err(EnrichError::Failed(e.to_string()))
                }
            }
        }
    }
}

/// The summarizer selected at startup.
#[derive(Debug)]
pub enum SummaryBackend {
    Disabled(NoSummary),
    #[cfg(feature = "summarize")]
    Llm(LlmSummarizer),
}

impl Summarizer for SummaryBackend {
    async fn summarize(&self, text: &str) -> Result<Option<String>, EnrichError> {
        match self {
            SummaryBackend::Disabled(s) => s.summarize(text).await,
            #[cfg(feature = "summarize")]
            SummaryBackend::Llm(s) => s.summarize(text).await,
        }
    }
}
