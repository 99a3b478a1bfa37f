//! Attribute extraction from fetched markup.
//!
//! Pages come from unrelated sites, so everything here is best effort: a
//! title and description are looked up in a couple of conventional places,
//! and a small set of structured hints is recovered from `<meta>` tags,
//! JSON-LD blocks and geo tags. Only payloads that are not markup at all are
//! rejected.

use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};

use crate::error::ExtractError;
use crate::models::{AttributeBag, HintValue, RawPage};
use crate::normalize::canonical_hint_key;

/// Anything that opens a tag, comment or doctype.
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[A-Za-z!/?]").unwrap());
static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());
static OG_TITLE: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[property="og:title"]"#).unwrap());
static DESCRIPTION: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[name="description"]"#).unwrap());
static OG_DESCRIPTION: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[property="og:description"]"#).unwrap());
static META: Lazy<Selector> = Lazy::new(|| Selector::parse("meta[content]").unwrap());
static JSON_LD: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"script[type="application/ld+json"]"#).unwrap());

/// Parse a fetched page into an [`AttributeBag`].
///
/// # Errors
///
/// [`ExtractError::Unparseable`] when the payload is blank or contains no
/// markup at all. A well-formed page with nothing useful in it still yields a
/// bag; missing titles, descriptions or hints are never errors.
#[instrument(level = "debug", skip_all, fields(url = %page.url))]
pub fn extract(page: &RawPage) -> Result<AttributeBag, ExtractError> {
    if page.body.trim().is_empty() {
        return Err(ExtractError::Unparseable("empty payload".to_string()));
    }
    if !TAG.is_match(&page.body) {
        return Err(ExtractError::Unparseable("no markup in payload".to_string()));
    }

    let document = Html::parse_document(&page.body);

    let title = document
        .select(&TITLE)
        .next()
        .map(element_text)
        .filter(|t| !t.is_empty())
        .or_else(|| first_content(&document, &OG_TITLE))
        .unwrap_or_default();

    let description = first_content(&document, &DESCRIPTION)
        .or_else(|| first_content(&document, &OG_DESCRIPTION))
        .unwrap_or_default();

    let mut bag = AttributeBag::new(title, description);
    bag.hints = collect_hints(&document);

    debug!(
        title = %bag.title,
        description_len = bag.description.len(),
        hints = bag.hints.len(),
        "Extracted attributes"
    );
    Ok(bag)
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().flat_map(str::split_whitespace).join(" ")
}

fn first_content(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .filter_map(|el| el.value().attr("content"))
        .map(|c| c.split_whitespace().join(" "))
        .find(|c| !c.is_empty())
}

fn collect_hints(document: &Html) -> BTreeMap<String, HintValue> {
    let mut hints = BTreeMap::new();

    for el in document.select(&META) {
        let Some(content) = el.value().attr("content") else {
            continue;
        };
        let Some(name) = el
            .value()
            .attr("name")
            .or_else(|| el.value().attr("property"))
        else {
            continue;
        };

        match name.to_ascii_lowercase().as_str() {
            "geo.position" => insert_position(&mut hints, content, ';'),
            "icbm" => insert_position(&mut hints, content, ','),
            _ => {
                let local = name.rsplit(':').next().unwrap_or(name);
                if let Some(key) = canonical_hint_key(local) {
                    insert_hint(&mut hints, key, text_hint(content));
                }
            }
        }
    }

    for script in document.select(&JSON_LD) {
        let raw = script.text().collect::<String>();
        match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(value) => collect_json_ld(&mut hints, &value, 0),
            Err(e) => warn!(error = %e, "Ignoring malformed JSON-LD block"),
        }
    }

    hints
}

/// Walk top-level JSON-LD objects (and `@graph` members, and `geo` blocks).
fn collect_json_ld(hints: &mut BTreeMap<String, HintValue>, value: &serde_json::Value, depth: u8) {
    use serde_json::Value;

    if depth > 2 {
        return;
    }
    match value {
        Value::Array(items) => {
            for item in items {
                collect_json_ld(hints, item, depth + 1);
            }
        }
        Value::Object(map) => {
            for (key, v) in map {
                match (key.as_str(), v) {
                    ("@graph", _) | ("geo", Value::Object(_)) => {
                        collect_json_ld(hints, v, depth + 1)
                    }
                    (_, Value::String(s)) => {
                        if let Some(canonical) = canonical_hint_key(key) {
                            insert_hint(hints, canonical, text_hint(s));
                        }
                    }
                    (_, Value::Number(n)) => {
                        if let (Some(canonical), Some(n)) = (canonical_hint_key(key), n.as_f64()) {
                            insert_hint(hints, canonical, HintValue::Number(n));
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

fn insert_hint(hints: &mut BTreeMap<String, HintValue>, key: &str, value: HintValue) {
    hints.entry(key.to_string()).or_insert(value);
}

/// Numbers stay numbers; anything else is kept as trimmed text.
fn text_hint(raw: &str) -> HintValue {
    let trimmed = raw.trim();
    match trimmed.parse::<f64>() {
        Ok(n) if n.is_finite() => HintValue::Number(n),
        _ => HintValue::Text(trimmed.to_string()),
    }
}

/// `"lat<sep>lon"` as used by `geo.position` and `ICBM` tags.
fn insert_position(hints: &mut BTreeMap<String, HintValue>, content: &str, sep: char) {
    let parts = content
        .split(sep)
        .map(|p| p.trim().parse::<f64>())
        .collect::<Vec<_>>();
    if let [Ok(lat), Ok(lon)] = parts.as_slice() {
        insert_hint(hints, "latitude", HintValue::Number(*lat));
        insert_hint(hints, "longitude", HintValue::Number(*lon));
    }
}
