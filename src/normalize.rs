//! Normalization and ranking of raw records.
//!
//! Upstream field names have drifted between snapshot generations, so each
//! canonical field is resolved through an ordered [`AliasTable`]: the first
//! alias present with a non-empty value wins. The table is plain data and
//! can be overridden from the `[aliases]` config section without a code
//! change.
//!
//! Records without a resolvable title are dropped. When only an id is
//! present, the title falls back to `"Incident {id}"`.
//!
//! Ranking is a stable sort on date, newest first; records whose date is
//! missing or unparseable sort as if dated at the Unix epoch.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;

use crate::config::SourceConfig;
use crate::models::NormalizedIncident;
use crate::parse::RawRecord;

/// Ordered source field names for each canonical field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AliasTable {
    #[serde(default = "default_id_aliases")]
    pub id: Vec<String>,
    #[serde(default = "default_title_aliases")]
    pub title: Vec<String>,
    #[serde(default = "default_date_aliases")]
    pub date: Vec<String>,
}

impl Default for AliasTable {
    fn default() -> Self {
        Self {
            id: default_id_aliases(),
            title: default_title_aliases(),
            date: default_date_aliases(),
        }
    }
}

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn default_id_aliases() -> Vec<String> {
    strings(&["incident_id", "incidentId", "id", "_id"])
}
fn default_title_aliases() -> Vec<String> {
    strings(&["title", "incident_title", "name"])
}
fn default_date_aliases() -> Vec<String> {
    strings(&[
        "incident_date",
        "date",
        "publishedAt",
        "published_date",
        "created_at",
        "updated_at",
    ])
}

/// Normalize every record, dropping those without a title. Input order is kept.
pub fn normalize_records(
    records: &[RawRecord],
    aliases: &AliasTable,
    source: &SourceConfig,
) -> Vec<NormalizedIncident> {
    records
        .iter()
        .filter_map(|record| normalize_record(record, aliases, source))
        .collect()
}

pub fn normalize_record(
    record: &RawRecord,
    aliases: &AliasTable,
    source: &SourceConfig,
) -> Option<NormalizedIncident> {
    let id = pick(record, &aliases.id).and_then(scalar_text);
    let title = pick(record, &aliases.title)
        .and_then(scalar_text)
        .or_else(|| id.as_ref().map(|id| format!("Incident {}", id)))?;
    let (date, timestamp_ms) = match pick(record, &aliases.date) {
        Some(value) => resolve_date(value),
        None => (None, None),
    };

    Some(NormalizedIncident {
        detail_url: detail_url(source, id.as_deref()),
        id,
        title,
        date,
        source_label: source.source_label.clone(),
        timestamp_ms,
    })
}

/// Sort newest first (stable; unknown dates count as the epoch) and keep `max`.
pub fn rank_and_truncate(
    mut incidents: Vec<NormalizedIncident>,
    max: usize,
) -> Vec<NormalizedIncident> {
    incidents.sort_by(|a, b| {
        b.timestamp_ms
            .unwrap_or(0)
            .cmp(&a.timestamp_ms.unwrap_or(0))
    });
    incidents.truncate(max);
    incidents
}

/// First alias whose value renders as non-empty text.
fn pick<'a>(record: &'a RawRecord, aliases: &[String]) -> Option<&'a Value> {
    aliases
        .iter()
        .filter_map(|alias| record.get(alias))
        .find(|value| scalar_text(value).is_some())
}

/// Render a scalar as trimmed text. MongoDB extended-JSON wrappers
/// (`{"$oid": ...}`, `{"$numberInt": ...}`) are unwrapped.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(map) => extended_json_inner(map).and_then(scalar_text),
        Value::Null | Value::Array(_) => None,
    }
}

fn extended_json_inner(map: &serde_json::Map<String, Value>) -> Option<&Value> {
    if map.len() != 1 {
        return None;
    }
    ["$oid", "$date", "$numberInt", "$numberLong", "$numberDouble"]
        .iter()
        .find_map(|key| map.get(*key))
}

/// Resolve a date value to its display string and epoch milliseconds.
///
/// ISO-8601 strings are kept as written. Numbers are epoch milliseconds and
/// RFC 2822 strings are re-rendered as RFC 3339. Anything else is unknown.
fn resolve_date(value: &Value) -> (Option<String>, Option<i64>) {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(|dt| {
                (
                    Some(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
                    Some(dt.timestamp_millis()),
                )
            })
            .unwrap_or((None, None)),
        Value::String(s) => {
            let s = s.trim();
            if let Some(dt) = parse_iso_date(s) {
                return (Some(s.to_string()), Some(dt.timestamp_millis()));
            }
            match DateTime::parse_from_rfc2822(s) {
                Ok(dt) => {
                    let dt = dt.with_timezone(&Utc);
                    (
                        Some(dt.to_rfc3339_opts(SecondsFormat::Secs, true)),
                        Some(dt.timestamp_millis()),
                    )
                }
                Err(_) => (None, None),
            }
        }
        Value::Object(map) => match extended_json_inner(map) {
            // `{"$date": {"$numberLong": "1700000000000"}}`
            Some(Value::String(digits)) if map.contains_key("$numberLong") => digits
                .trim()
                .parse::<i64>()
                .map(|ms| resolve_date(&Value::from(ms)))
                .unwrap_or((None, None)),
            Some(inner) => resolve_date(inner),
            None => (None, None),
        },
        _ => (None, None),
    }
}

/// Parse the ISO-8601 shapes seen across snapshot generations.
pub fn parse_iso_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// `{detail_base_url}/{id}`, or the fallback URL when there is no id.
fn detail_url(source: &SourceConfig, id: Option<&str>) -> String {
    if let (Some(id), Ok(mut url)) = (id, Url::parse(&source.detail_base_url)) {
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(id);
        }
        return url.to_string();
    }
    source.fallback_url.clone()
}
