//! Pipeline progress reporting.
//!
//! Reports what a run is doing (locating, downloading, which archive entry
//! was picked, how many records parsed) so an operator can tell a slow
//! download from a stuck one. Progress is emitted on **stderr** so stdout
//! remains parseable for scripts that consume the JSON result.

use std::io::Write;

use crate::error::ReasonCode;
use crate::parse::RecordFormat;

/// A single progress event for one pipeline run.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Fetching the index page.
    Locating { index_url: String },
    /// Index page scanned; this archive is the newest published snapshot.
    Located { archive_url: String },
    /// Archive transfer and decompression started.
    Downloading { archive_url: String },
    /// An archive entry did not satisfy the selection rule.
    EntrySkipped { name: String },
    /// An archive entry was kept as a parse candidate.
    EntrySelected {
        name: String,
        bytes: u64,
        truncated: bool,
    },
    /// Archive walk finished.
    Downloaded { compressed_bytes: u64 },
    /// A candidate entry parsed successfully.
    Parsed { format: RecordFormat, records: usize },
    /// A cached result for this archive is still fresh; download skipped.
    CacheHit { archive_url: String },
    /// Run complete.
    Finished {
        ok: bool,
        incidents: usize,
        reason: Option<ReasonCode>,
    },
}

/// Reports pipeline progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the pipeline driver and its stages.
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "incsnap  selected  incidents.csv (1,234,567 bytes)".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Locating { index_url } => {
                format!("incsnap  locating  {}\n", index_url)
            }
            ProgressEvent::Located { archive_url } => {
                format!("incsnap  located  {}\n", archive_url)
            }
            ProgressEvent::Downloading { archive_url } => {
                format!("incsnap  downloading  {}\n", archive_url)
            }
            // Skips are only interesting in the JSON stream.
            ProgressEvent::EntrySkipped { .. } => return,
            ProgressEvent::EntrySelected {
                name,
                bytes,
                truncated,
            } => {
                let suffix = if *truncated { ", truncated" } else { "" };
                format!(
                    "incsnap  selected  {} ({} bytes{})\n",
                    name,
                    format_number(*bytes),
                    suffix
                )
            }
            ProgressEvent::Downloaded { compressed_bytes } => {
                format!(
                    "incsnap  downloaded  {} compressed bytes\n",
                    format_number(*compressed_bytes)
                )
            }
            ProgressEvent::Parsed { format, records } => {
                format!(
                    "incsnap  parsed  {} records ({})\n",
                    format_number(*records as u64),
                    format.as_str()
                )
            }
            ProgressEvent::CacheHit { archive_url } => {
                format!("incsnap  cached  {}\n", archive_url)
            }
            ProgressEvent::Finished {
                ok,
                incidents,
                reason,
            } => match (ok, reason) {
                (true, None) => format!(
                    "incsnap  done  {} incidents\n",
                    format_number(*incidents as u64)
                ),
                (_, Some(reason)) => format!(
                    "incsnap  done  {} incidents ({})\n",
                    format_number(*incidents as u64),
                    reason
                ),
                (false, None) => "incsnap  failed\n".to_string(),
            },
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Locating { index_url } => serde_json::json!({
                "event": "locating",
                "index_url": index_url
            }),
            ProgressEvent::Located { archive_url } => serde_json::json!({
                "event": "located",
                "archive_url": archive_url
            }),
            ProgressEvent::Downloading { archive_url } => serde_json::json!({
                "event": "downloading",
                "archive_url": archive_url
            }),
            ProgressEvent::EntrySkipped { name } => serde_json::json!({
                "event": "entry_skipped",
                "name": name
            }),
            ProgressEvent::EntrySelected {
                name,
                bytes,
                truncated,
            } => serde_json::json!({
                "event": "entry_selected",
                "name": name,
                "bytes": bytes,
                "truncated": truncated
            }),
            ProgressEvent::Downloaded { compressed_bytes } => serde_json::json!({
                "event": "downloaded",
                "compressed_bytes": compressed_bytes
            }),
            ProgressEvent::Parsed { format, records } => serde_json::json!({
                "event": "parsed",
                "format": format.as_str(),
                "records": records
            }),
            ProgressEvent::CacheHit { archive_url } => serde_json::json!({
                "event": "cache_hit",
                "archive_url": archive_url
            }),
            ProgressEvent::Finished {
                ok,
                incidents,
                reason,
            } => serde_json::json!({
                "event": "finished",
                "ok": ok,
                "incidents": incidents,
                "reason": reason.map(|r| r.as_str())
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
