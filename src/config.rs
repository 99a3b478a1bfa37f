//! Run configuration.
//!
//! Loaded from an optional YAML file and then overridden by command-line
//! flags. Deployment defaults are the constants the normalizer falls back to
//! for a single-region deployment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::cli::Cli;
use crate::error::ConfigError;
use crate::models::{MapCoordinates, SourceRef};

/// Constants applied to fields no page reports.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeploymentDefaults {
    pub country_name: String,
    pub country_code: String,
    pub region_name: String,
    pub region_code: String,
    pub currency: String,
    pub sector: String,
    /// Candidate subsectors for the synthetic draw.
    pub subsectors: Vec<String>,
    /// `[longitude, latitude]`
    pub coordinates: [f64; 2],
}

impl Default for DeploymentDefaults {
    fn default() -> Self {
        Self {
            country_name: "United States".to_string(),
            country_code: "USA".to_string(),
            region_name: "California".to_string(),
            region_code: "CA".to_string(),
            currency: "USD".to_string(),
            sector: "Construction".to_string(),
            subsectors: vec![
                "Building Construction".to_string(),
                "Infrastructure Development".to_string(),
            ],
            coordinates: [-122.4, 37.8],
        }
    }
}

impl DeploymentDefaults {
    pub fn map_coordinates(&self) -> MapCoordinates {
        MapCoordinates::point(self.coordinates[0], self.coordinates[1])
    }
}

/// Everything one run needs, after file and CLI have been merged.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub sources: Vec<String>,
    pub worker_count: usize,
    pub fetch_timeout_secs: u64,
    pub retry_limit: u32,
    pub retry_base_delay_ms: u64,
    pub export_destination: PathBuf,
    /// Optional JSON document with the run report and batch.
    pub report_path: Option<PathBuf>,
    pub dedupe_by_url: bool,
    pub allow_empty_export: bool,
    pub discard_on_cancel: bool,
    pub user_agent: String,
    pub defaults: DeploymentDefaults,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            worker_count: 4,
            fetch_timeout_secs: 30,
            retry_limit: 3,
            retry_base_delay_ms: 1000,
            export_destination: PathBuf::from("standardized_data.csv"),
            report_path: None,
            dedupe_by_url: true,
            allow_empty_export: false,
            discard_on_cancel: false,
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
            defaults: DeploymentDefaults::default(),
        }
    }
}

impl RunConfig {
    /// Parse a YAML document. Missing keys take their defaults.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = serde_yaml::from_str(text)?;
        Ok(config)
    }

    #[instrument(level = "info", skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&text)?;
        info!(sources = config.sources.len(), "Loaded configuration file");
        Ok(config)
    }

    /// Build the effective configuration: file (if any), then CLI overrides.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Self::load(Path::new(path))?,
            None => Self::default(),
        };
        config.apply_cli(cli);
        config.validate()?;
        debug!(?config, "Effective configuration");
        Ok(config)
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if !cli.sources.is_empty() {
            self.sources = cli.sources.clone();
        }
        if let Some(n) = cli.workers {
            self.worker_count = n;
        }
        if let Some(secs) = cli.timeout_secs {
            self.fetch_timeout_secs = secs;
        }
        if let Some(n) = cli.retries {
            self.retry_limit = n;
        }
        if let Some(out) = &cli.output {
            self.export_destination = PathBuf::from(out);
        }
        if let Some(report) = &cli.report {
            self.report_path = Some(PathBuf::from(report));
        }
        if cli.keep_duplicates {
            self.dedupe_by_url = false;
        }
        if cli.allow_empty_export {
            self.allow_empty_export = true;
        }
        if cli.discard_on_cancel {
            self.discard_on_cancel = true;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be greater than 0".into()));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid("fetch_timeout_secs must be greater than 0".into()));
        }
        if self.defaults.subsectors.is_empty() {
            return Err(ConfigError::Invalid("defaults.subsectors must not be empty".into()));
        }
        if self.export_destination.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("export_destination must not be empty".into()));
        }
        self.source_refs().map(|_| ())
    }

    pub fn source_refs(&self) -> Result<Vec<SourceRef>, ConfigError> {
        self.sources.iter().map(|s| SourceRef::parse(s)).collect()
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}
