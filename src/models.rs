//! Data models for scraped pages and their normalized representations.
//!
//! This module defines the core data structures used throughout the application:
//! - [`SourceRef`]: One configured scrape target
//! - [`RawPage`]: Fetched page content before extraction
//! - [`AttributeBag`]: Loosely-typed extraction result
//! - [`CanonicalRecord`]: The fixed-schema exported row, with per-field [`Provenance`]
//! - [`Batch`] and [`RunReport`]: What one run produces
//!
//! Enum fields serialize to the display strings used in the export
//! (`"Design and Build"`, not `"DesignAndBuild"`).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;
use uuid::Uuid;

use crate::error::{ConfigError, FailureKind};

/// A single scrape target.
///
/// Construction validates that the URL is non-empty and absolute; whether the
/// scheme is actually fetchable is the fetcher's call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SourceRef {
    url: String,
}

impl SourceRef {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::InvalidSource {
                url: raw.to_string(),
                reason: "empty URL".to_string(),
            });
        }
        Url::parse(trimmed).map_err(|e| ConfigError::InvalidSource {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            url: trimmed.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Raw content returned by one successful fetch attempt.
#[derive(Debug, Clone)]
pub struct RawPage {
    /// The source URL the page was requested from.
    pub url: String,
    /// The page body as text.
    pub body: String,
    /// When the body finished downloading.
    pub fetched_at: DateTime<Utc>,
    /// HTTP status code of the response.
    pub status: u16,
}

/// A structured value recovered from a page alongside title and description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HintValue {
    Number(f64),
    Text(String),
}

impl HintValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            HintValue::Text(s) => Some(s),
            HintValue::Number(_) => None,
        }
    }
}

impl fmt::Display for HintValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HintValue::Number(n) => write!(f, "{n}"),
            HintValue::Text(s) => f.write_str(s),
        }
    }
}

/// Partial extraction result, consumed once by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeBag {
    pub title: String,
    pub description: String,
    pub hints: BTreeMap<String, HintValue>,
}

impl AttributeBag {
    /// Title used when a page carries no usable title element.
    pub const NO_TITLE: &'static str = "No Title";

    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let title = title.into();
        let title = if title.trim().is_empty() {
            Self::NO_TITLE.to_string()
        } else {
            title.trim().to_string()
        };
        Self {
            title,
            description: description.into().trim().to_string(),
            hints: BTreeMap::new(),
        }
    }

    #[cfg(test)]
    pub fn with_hint(mut self, key: impl Into<String>, value: HintValue) -> Self {
        self.hints.insert(key.into(), value);
        self
    }
}

/// GeoJSON-style point, `[longitude, latitude]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MapCoordinates {
    #[serde(rename = "type")]
    pub kind: PointKind,
    pub coordinates: [f64; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointKind {
    Point,
}

impl MapCoordinates {
    pub fn point(longitude: f64, latitude: f64) -> Self {
        Self {
            kind: PointKind::Point,
            coordinates: [longitude, latitude],
        }
    }
}

/// Declares a closed set of display strings and a loose, case-insensitive parser.
macro_rules! display_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $label)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }

            /// Matches ignoring case, spaces, hyphens and underscores.
            pub fn parse_loose(raw: &str) -> Option<Self> {
                let wanted = squash(raw);
                Self::ALL.iter().copied().find(|v| squash(v.as_str()) == wanted)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

fn squash(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

display_enum!(
    /// Whether the project is still accepting bids.
    Status { Open => "Open", Closed => "Closed" }
);
display_enum!(Stage { Planning => "Planning", Execution => "Execution" });
display_enum!(ProcurementMethod {
    DesignAndBuild => "Design and Build",
    RequestForProposal => "Request for Proposal",
});
display_enum!(Buyer { Public => "Public", Private => "Private" });

/// Where a record field's value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FieldOrigin {
    /// Read from the page.
    Scraped,
    /// Deployment constant from configuration.
    Configured,
    /// Drawn by the default policy; not real data.
    Synthetic,
    /// Produced at normalization time (id, capture date).
    Generated,
    /// The source reference the page was fetched from.
    Source,
    /// Replaced by the summarization collaborator.
    Enriched,
}

/// Field name to origin, for every canonical column.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Provenance(BTreeMap<&'static str, FieldOrigin>);

impl Provenance {
    pub fn set(&mut self, field: &'static str, origin: FieldOrigin) {
        self.0.insert(field, origin);
    }

    #[cfg(test)]
    pub fn get(&self, field: &str) -> Option<FieldOrigin> {
        self.0.get(field).copied()
    }

    /// Names of fields whose values were fabricated by the default policy.
    pub fn synthetic_fields(&self) -> Vec<&'static str> {
        self.0
            .iter()
            .filter(|(_, origin)| **origin == FieldOrigin::Synthetic)
            .map(|(field, _)| *field)
            .collect()
    }
}

/// A fully-populated row of the export schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRecord {
    pub id: Uuid,
    pub country_name: String,
    pub country_code: String,
    pub map_coordinates: MapCoordinates,
    pub url: String,
    pub region_name: String,
    pub region_code: String,
    pub title: String,
    pub description: String,
    pub status: Status,
    pub stage: Stage,
    pub captured_date: NaiveDate,
    pub procurement_method: ProcurementMethod,
    pub budget: f64,
    pub currency: String,
    pub buyer: Buyer,
    pub sector: String,
    pub subsector: String,
    pub provenance: Provenance,
}

impl CanonicalRecord {
    /// Export column names, in schema order.
    pub const COLUMNS: [&'static str; 18] = [
        "id",
        "country_name",
        "country_code",
        "map_coordinates",
        "url",
        "region_name",
        "region_code",
        "title",
        "description",
        "status",
        "stage",
        "captured_date",
        "procurement_method",
        "budget",
        "currency",
        "buyer",
        "sector",
        "subsector",
    ];

    /// One export row, aligned with [`Self::COLUMNS`].
    pub fn to_row(&self) -> Result<[String; 18], serde_json::Error> {
        Ok([
            self.id.to_string(),
            self.country_name.clone(),
            self.country_code.clone(),
            serde_json::to_string(&self.map_coordinates)?,
            self.url.clone(),
            self.region_name.clone(),
            self.region_code.clone(),
            self.title.clone(),
            self.description.clone(),
            self.status.to_string(),
            self.stage.to_string(),
            self.captured_date.format("%Y-%m-%d").to_string(),
            self.procurement_method.to_string(),
            format!("{:.2}", self.budget),
            self.currency.clone(),
            self.buyer.to_string(),
            self.sector.clone(),
            self.subsector.clone(),
        ])
    }
}

/// Records of one run in completion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Batch {
    records: Vec<CanonicalRecord>,
}

impl Batch {
    pub fn new(records: Vec<CanonicalRecord>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[CanonicalRecord] {
        &self.records
    }

    #[cfg(test)]
    pub fn into_records(self) -> Vec<CanonicalRecord> {
        self.records
    }
}

/// Outcome of one fetch attempt, kept whether or not the source succeeded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    pub latency_ms: u64,
    /// `None` on success.
    pub error: Option<FailureKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    Succeeded { record_id: Uuid, collected: bool },
    Failed { kind: FailureKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceOutcome {
    pub url: String,
    #[serde(flatten)]
    pub status: SourceStatus,
    pub attempts: Vec<FetchAttempt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No source produced a record.
    NoRecords,
    /// The run was cancelled and the caller asked for partial results to be dropped.
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "export", rename_all = "snake_case")]
pub enum ExportStatus {
    Written { destination: String, rows: usize },
    Skipped { reason: SkipReason },
    Failed { error: String },
}

/// Summary of one run, serialized into the JSON run document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Successful sources whose record was dropped as a URL duplicate.
    pub deduplicated: usize,
    pub cancelled: bool,
    pub outcomes: Vec<SourceOutcome>,
    pub export: ExportStatus,
}

impl RunReport {
    /// Failed sources with their failure kinds.
    pub fn failures(&self) -> impl Iterator<Item = (&str, FailureKind)> {
        self.outcomes.iter().filter_map(|o| match o.status {
            SourceStatus::Failed { kind, .. } => Some((o.url.as_str(), kind)),
            SourceStatus::Succeeded { .. } => None,
        })
    }
}

/// What a completed run hands back to its driver.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    pub report: RunReport,
    #[serde(rename = "records")]
    pub batch: Batch,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> CanonicalRecord {
        CanonicalRecord {
            id: Uuid::new_v4(),
            country_name: "United States".to_string(),
            country_code: "USA".to_string(),
            map_coordinates: MapCoordinates::point(-122.4, 37.8),
            url: "https://example.test/a".to_string(),
            region_name: "California".to_string(),
            region_code: "CA".to_string(),
            title: "Bridge retrofit, phase 2".to_string(),
            description: "Seismic work".to_string(),
            status: Status::Open,
            stage: Stage::Planning,
            captured_date: NaiveDate::from_ymd_opt(2025, 5, 6).unwrap(),
            procurement_method: ProcurementMethod::DesignAndBuild,
            budget: 1_250_000.0,
            currency: "USD".to_string(),
            buyer: Buyer::Public,
            sector: "Construction".to_string(),
            subsector: "Infrastructure Development".to_string(),
            provenance: Provenance::default(),
        }
    }

    #[test]
    fn test_source_ref_rejects_relative_and_empty() {
        assert!(SourceRef::parse("").is_err());
        assert!(SourceRef::parse("   ").is_err());
        assert!(SourceRef::parse("/1404/Major-Projects").is_err());
        let src = SourceRef::parse(" https://dot.ca.gov/ ").unwrap();
        assert_eq!(src.as_str(), "https://dot.ca.gov/");
    }

    #[test]
    fn test_attribute_bag_blank_title_becomes_sentinel() {
        let bag = AttributeBag::new("   ", "  Some text ");
        assert_eq!(bag.title, AttributeBag::NO_TITLE);
        assert_eq!(bag.description, "Some text");
        assert!(bag.hints.is_empty());
    }

    #[test]
    fn test_enum_loose_parsing() {
        assert_eq!(Status::parse_loose("OPEN"), Some(Status::Open));
        assert_eq!(
            ProcurementMethod::parse_loose("request_for_proposal"),
            Some(ProcurementMethod::RequestForProposal)
        );
        assert_eq!(
            ProcurementMethod::parse_loose("design-and-build"),
            Some(ProcurementMethod::DesignAndBuild)
        );
        assert_eq!(Buyer::parse_loose("government"), None);
    }

    #[test]
    fn test_enum_serializes_display_string() {
        let json = serde_json::to_string(&ProcurementMethod::DesignAndBuild).unwrap();
        assert_eq!(json, "\"Design and Build\"");
    }

    #[test]
    fn test_row_matches_columns() {
        let record = sample_record();
        let row = record.to_row().unwrap();
        assert_eq!(row.len(), CanonicalRecord::COLUMNS.len());
        assert_eq!(row[3], r#"{"type":"Point","coordinates":[-122.4,37.8]}"#);
        assert_eq!(row[11], "2025-05-06");
        assert_eq!(row[13], "1250000.00");
        assert_eq!(row[12], "Design and Build");
    }

    #[test]
    fn test_provenance_synthetic_fields() {
        let mut p = Provenance::default();
        p.set("status", FieldOrigin::Synthetic);
        p.set("title", FieldOrigin::Scraped);
        p.set("budget", FieldOrigin::Synthetic);
        assert_eq!(p.synthetic_fields(), vec!["budget", "status"]);
        assert_eq!(p.get("title"), Some(FieldOrigin::Scraped));
    }

    #[test]
    fn test_hint_value_untagged() {
        let v: HintValue = serde_json::from_str("1500000").unwrap();
        assert_eq!(v, HintValue::Number(1_500_000.0));
        let v: HintValue = serde_json::from_str("\"Open\"").unwrap();
        assert_eq!(v.as_text(), Some("Open"));
    }
}
