//! Format detection and record parsing for the selected archive entry.
//!
//! The format is chosen from the entry name alone:
//!
//! | Extension | Format | Record |
//! |-----------|--------|--------|
//! | `.json` | [`RecordFormat::Json`] | each object in the top-level array |
//! | `.jsonl`, `.ndjson` | [`RecordFormat::JsonLines`] | each non-blank line |
//! | `.csv` | [`RecordFormat::Csv`] | each row, keyed by the header row |
//!
//! Any syntax error fails the whole entry; there is no partial recovery.
//! A JSON document that is not an array is a shape error. Both are reported
//! the same way by the pipeline.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::models::ArchiveEntry;

/// One parsed record: field name to value. CSV cells are always strings.
pub type RawRecord = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    Json,
    JsonLines,
    Csv,
}

impl RecordFormat {
    /// Detect the format from a file name's extension (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_lowercase();
        let ext = lower.rsplit_once('.').map(|(_, ext)| ext)?;
        match ext {
            "json" => Some(RecordFormat::Json),
            "jsonl" | "ndjson" => Some(RecordFormat::JsonLines),
            "csv" => Some(RecordFormat::Csv),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordFormat::Json => "json",
            RecordFormat::JsonLines => "jsonlines",
            RecordFormat::Csv => "csv",
        }
    }
}

#[derive(Debug)]
pub struct ParsedEntry {
    pub format: RecordFormat,
    pub records: Vec<RawRecord>,
}

#[derive(Debug)]
pub enum ParseError {
    UnknownFormat(String),
    Encoding(String),
    Syntax(String),
    Shape(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::UnknownFormat(name) => write!(f, "unrecognized data format: {}", name),
            ParseError::Encoding(e) => write!(f, "payload is not UTF-8: {}", e),
            ParseError::Syntax(e) => write!(f, "syntax error: {}", e),
            ParseError::Shape(e) => write!(f, "unexpected document shape: {}", e),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse an entry's payload according to its name.
pub fn parse_entry(entry: &ArchiveEntry) -> Result<ParsedEntry, ParseError> {
    let format = RecordFormat::from_name(&entry.name)
        .ok_or_else(|| ParseError::UnknownFormat(entry.name.clone()))?;
    // A capped payload usually ends mid-record; line formats keep only
    // complete lines. A truncated JSON document cannot be salvaged.
    let payload: &[u8] = if entry.truncated && format != RecordFormat::Json {
        complete_lines(&entry.payload)
    } else {
        &entry.payload
    };
    let text =
        std::str::from_utf8(payload).map_err(|e| ParseError::Encoding(e.to_string()))?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let records = match format {
        RecordFormat::Json => parse_json(text)?,
        RecordFormat::JsonLines => parse_json_lines(text)?,
        RecordFormat::Csv => parse_csv(text)?,
    };
    Ok(ParsedEntry { format, records })
}

/// Everything up to and including the last newline.
fn complete_lines(payload: &[u8]) -> &[u8] {
    match payload.iter().rposition(|&b| b == b'\n') {
        Some(last) => &payload[..=last],
        None => &[],
    }
}

fn parse_json(text: &str) -> Result<Vec<RawRecord>, ParseError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ParseError::Syntax(e.to_string()))?;
    match value {
        Value::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect()),
        Value::Object(_) => Err(ParseError::Shape("expected an array, found an object".into())),
        other => Err(ParseError::Shape(format!(
            "expected an array, found {}",
            json_kind(&other)
        ))),
    }
}

fn parse_json_lines(text: &str) -> Result<Vec<RawRecord>, ParseError> {
    let mut records = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .map_err(|e| ParseError::Syntax(format!("line {}: {}", idx + 1, e)))?;
        if let Value::Object(map) = value {
            records.push(map);
        }
    }
    Ok(records)
}

fn parse_csv(text: &str) -> Result<Vec<RawRecord>, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| ParseError::Syntax(e.to_string()))?
        .clone();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| ParseError::Syntax(e.to_string()))?;
        let record: RawRecord = headers
            .iter()
            .zip(row.iter())
            .map(|(key, cell)| (key.to_string(), Value::String(cell.to_string())))
            .collect();
        records.push(record);
    }
    Ok(records)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
