//! Mapping attribute bags onto the canonical record schema.
//!
//! Normalization never fails. Each field is taken from the bag's hints when
//! a usable value is there, otherwise from the default policy:
//!
//! | field | default | origin |
//! |-------|---------|--------|
//! | country, region, currency, sector | deployment constant | `Configured` |
//! | map_coordinates | deployment constant | `Configured` |
//! | status, stage, procurement_method, buyer | uniform draw over the enum | `Synthetic` |
//! | budget | uniform draw in [`BUDGET_MIN`], [`BUDGET_MAX`] | `Synthetic` |
//! | subsector | uniform draw over configured subsectors | `Synthetic` |
//! | id, captured_date | fresh UUID, clock date | `Generated` |
//! | url | the source the page was fetched from | `Source` |
//!
//! Draws come from an RNG seeded with the source URL and the bag contents, so
//! the same bag always yields the same synthetic values; only `id` differs
//! between two normalizations.

use chrono::{Local, NaiveDate};
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use std::hash::{DefaultHasher, Hash, Hasher};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::DeploymentDefaults;
use crate::models::{
    AttributeBag, Buyer, CanonicalRecord, FieldOrigin, HintValue, MapCoordinates,
    ProcurementMethod, Provenance, SourceRef, Stage, Status,
};

/// Lower bound of a synthetic budget.
pub const BUDGET_MIN: f64 = 100_000.0;
/// Upper bound of a synthetic budget.
pub const BUDGET_MAX: f64 = 10_000_000.0;

/// Source of the capture date.
pub trait Clock {
    fn today(&self) -> NaiveDate;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

#[cfg(test)]
impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

/// Canonical hint name for a page-supplied key, ignoring case and separators.
///
/// Returns `None` for keys that do not feed any record field.
pub fn canonical_hint_key(raw: &str) -> Option<&'static str> {
    let squashed: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let key = match squashed.as_str() {
        "status" | "projectstatus" | "bidstatus" => "status",
        "stage" | "stages" | "projectstage" => "stage",
        "procurementmethod" | "procurement" => "procurement_method",
        "budget" | "projectbudget" | "estimatedbudget" | "estimatedcost" => "budget",
        "currency" | "budgetcurrency" | "pricecurrency" => "currency",
        "buyer" | "buyertype" | "ownertype" => "buyer",
        "sector" => "sector",
        "subsector" => "subsector",
        "latitude" | "lat" => "latitude",
        "longitude" | "lon" | "lng" => "longitude",
        _ => return None,
    };
    Some(key)
}

static AMOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(-)?(\$)?\s*([0-9][0-9,]*(?:\.[0-9]+)?)(?:\s*(billion|bn|million|mil|m|thousand|k)\b)?",
    )
    .unwrap()
});

/// A bare number, optionally with an ISO currency code before or after it.
static BARE_AMOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[A-Za-z]{3}\s*)?([0-9][0-9,]*(?:\.[0-9]+)?)\s*(?:[A-Za-z]{3})?$").unwrap()
});

/// Parse a money amount such as `$1,250,000`, `2.5 million` or `750k`.
///
/// Inside longer text only a number marked with `$` or a scale word counts,
/// so `FY2024 budget: $3 million` is three million, not 2024. Unmarked
/// numbers are accepted only when they are the whole text. Negative amounts
/// are rejected.
pub fn parse_amount(text: &str) -> Option<f64> {
    let text = text.trim();
    let marked = AMOUNT
        .captures_iter(text)
        .find(|caps| caps.get(2).is_some() || caps.get(4).is_some());

    let (number, scale) = match marked {
        Some(caps) => {
            if caps.get(1).is_some() {
                return None;
            }
            (caps.get(3)?.as_str(), caps.get(4).map(|m| m.as_str()))
        }
        None => (BARE_AMOUNT.captures(text)?.get(1)?.as_str(), None),
    };

    let number: f64 = number.replace(',', "").parse().ok()?;
    let scale = match scale.map(str::to_ascii_lowercase).as_deref() {
        Some("billion" | "bn") => 1e9,
        Some("million" | "mil" | "m") => 1e6,
        Some("thousand" | "k") => 1e3,
        _ => 1.0,
    };
    let amount = number * scale;
    amount.is_finite().then_some(amount)
}

fn round_cents(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Applies hint parsing and the default policy for one deployment.
#[derive(Debug, Clone)]
pub struct Normalizer {
    defaults: DeploymentDefaults,
}

/// Values the default policy would use, drawn up front in a fixed order so a
/// hint on one field never shifts the draws for another.
struct Draws {
    status: Status,
    stage: Stage,
    procurement_method: ProcurementMethod,
    budget: f64,
    buyer: Buyer,
    subsector: String,
}

impl Normalizer {
    pub fn new(defaults: DeploymentDefaults) -> Self {
        Self { defaults }
    }

    /// Build a complete record from `bag`. Total: every field is always set.
    #[instrument(level = "debug", skip_all, fields(url = %source))]
    pub fn normalize(
        &self,
        bag: &AttributeBag,
        source: &SourceRef,
        clock: &dyn Clock,
    ) -> CanonicalRecord {
        let mut provenance = Provenance::default();
        let draws = self.draw(bag, source);

        provenance.set("url", FieldOrigin::Source);
        for field in ["country_name", "country_code", "region_name", "region_code"] {
            provenance.set(field, FieldOrigin::Configured);
        }
        provenance.set("id", FieldOrigin::Generated);
        provenance.set("captured_date", FieldOrigin::Generated);
        provenance.set(
            "title",
            if bag.title == AttributeBag::NO_TITLE {
                FieldOrigin::Generated
            } else {
                FieldOrigin::Scraped
            },
        );
        provenance.set("description", FieldOrigin::Scraped);

        let status = pick(
            &mut provenance,
            "status",
            lookup_text(bag, "status").and_then(Status::parse_loose),
            draws.status,
        );
        let stage = pick(
            &mut provenance,
            "stage",
            lookup_text(bag, "stage").and_then(Stage::parse_loose),
            draws.stage,
        );
        let procurement_method = pick(
            &mut provenance,
            "procurement_method",
            lookup_text(bag, "procurement_method").and_then(ProcurementMethod::parse_loose),
            draws.procurement_method,
        );
        let budget = pick(&mut provenance, "budget", scraped_budget(bag), draws.budget);
        let buyer = pick(
            &mut provenance,
            "buyer",
            lookup_text(bag, "buyer").and_then(Buyer::parse_loose),
            draws.buyer,
        );
        let subsector = pick(
            &mut provenance,
            "subsector",
            lookup_text(bag, "subsector").map(str::to_string),
            draws.subsector,
        );

        let currency = configured(
            &mut provenance,
            "currency",
            lookup_text(bag, "currency")
                .filter(|c| c.len() == 3 && c.chars().all(|ch| ch.is_ascii_alphabetic()))
                .map(str::to_ascii_uppercase),
            || self.defaults.currency.clone(),
        );
        let sector = configured(
            &mut provenance,
            "sector",
            lookup_text(bag, "sector").map(str::to_string),
            || self.defaults.sector.clone(),
        );
        let map_coordinates = configured(
            &mut provenance,
            "map_coordinates",
            scraped_coordinates(bag),
            || self.defaults.map_coordinates(),
        );

        let record = CanonicalRecord {
            id: Uuid::new_v4(),
            country_name: self.defaults.country_name.clone(),
            country_code: self.defaults.country_code.clone(),
            map_coordinates,
            url: source.as_str().to_string(),
            region_name: self.defaults.region_name.clone(),
            region_code: self.defaults.region_code.clone(),
            title: bag.title.clone(),
            description: bag.description.clone(),
            status,
            stage,
            captured_date: clock.today(),
            procurement_method,
            budget,
            currency,
            buyer,
            sector,
            subsector,
            provenance,
        };

        debug!(
            id = %record.id,
            synthetic = ?record.provenance.synthetic_fields(),
            "Normalized record"
        );
        record
    }

    fn draw(&self, bag: &AttributeBag, source: &SourceRef) -> Draws {
        let mut rng = StdRng::seed_from_u64(seed_for(bag, source));
        let status = Status::ALL[rng.random_range(0..Status::ALL.len())];
        let stage = Stage::ALL[rng.random_range(0..Stage::ALL.len())];
        let procurement_method =
            ProcurementMethod::ALL[rng.random_range(0..ProcurementMethod::ALL.len())];
        let budget = round_cents(rng.random_range(BUDGET_MIN..=BUDGET_MAX));
        let buyer = Buyer::ALL[rng.random_range(0..Buyer::ALL.len())];
        let subsectors = &self.defaults.subsectors;
        let subsector = if subsectors.is_empty() {
            String::new()
        } else {
            subsectors[rng.random_range(0..subsectors.len())].clone()
        };
        Draws {
            status,
            stage,
            procurement_method,
            budget,
            buyer,
            subsector,
        }
    }
}

/// Scraped value if present, otherwise the synthetic draw.
fn pick<T>(provenance: &mut Provenance, field: &'static str, scraped: Option<T>, drawn: T) -> T {
    match scraped {
        Some(v) => {
            provenance.set(field, FieldOrigin::Scraped);
            v
        }
        None => {
            provenance.set(field, FieldOrigin::Synthetic);
            drawn
        }
    }
}

/// Scraped value if present, otherwise the deployment constant.
fn configured<T>(
    provenance: &mut Provenance,
    field: &'static str,
    scraped: Option<T>,
    fallback: impl FnOnce() -> T,
) -> T {
    match scraped {
        Some(v) => {
            provenance.set(field, FieldOrigin::Scraped);
            v
        }
        None => {
            provenance.set(field, FieldOrigin::Configured);
            fallback()
        }
    }
}

fn seed_for(bag: &AttributeBag, source: &SourceRef) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.as_str().hash(&mut hasher);
    bag.title.hash(&mut hasher);
    bag.description.hash(&mut hasher);
    for (key, value) in &bag.hints {
        key.hash(&mut hasher);
        value.to_string().hash(&mut hasher);
    }
    hasher.finish()
}

fn lookup<'a>(bag: &'a AttributeBag, key: &str) -> Option<&'a HintValue> {
    bag.hints.get(key).or_else(|| {
        bag.hints
            .iter()
            .find(|(k, _)| canonical_hint_key(k) == Some(key))
            .map(|(_, v)| v)
    })
}

fn lookup_text<'a>(bag: &'a AttributeBag, key: &str) -> Option<&'a str> {
    lookup(bag, key)
        .and_then(HintValue::as_text)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn lookup_number(bag: &AttributeBag, key: &str) -> Option<f64> {
    match lookup(bag, key)? {
        HintValue::Number(n) => Some(*n),
        HintValue::Text(s) => s.trim().parse().ok(),
    }
}

fn scraped_budget(bag: &AttributeBag) -> Option<f64> {
    let amount = match lookup(bag, "budget")? {
        HintValue::Number(n) => *n,
        HintValue::Text(s) => parse_amount(s)?,
    };
    (amount.is_finite() && amount >= 0.0).then(|| round_cents(amount))
}

fn scraped_coordinates(bag: &AttributeBag) -> Option<MapCoordinates> {
    let lat = lookup_number(bag, "latitude")?;
    let lon = lookup_number(bag, "longitude")?;
    ((-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon))
        .then(|| MapCoordinates::point(lon, lat))
}
