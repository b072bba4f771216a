//! Core data types that flow through the snapshot pipeline.
//!
//! Stages hand these to each other strictly in order:
//! [`SnapshotReference`] → archive bytes → [`ArchiveEntry`] → raw records →
//! [`NormalizedIncident`] → [`PipelineResult`].

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ReasonCode;
use crate::parse::RecordFormat;

/// The currently published archive, as found on the index page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotReference {
    /// File name matching `{prefix}{14 digits}{extension}`.
    pub archive_name: String,
    /// The 14-digit `YYYYMMDDHHMMSS` stamp embedded in the name.
    pub timestamp: u64,
    pub resolved_url: String,
}

/// One file pulled out of the archive.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Path of the entry inside the archive.
    pub name: String,
    /// Payload bytes, at most `archive.max_entry_bytes` long.
    pub payload: Vec<u8>,
    /// Size declared by the entry header.
    pub size_bytes: u64,
    /// True when the declared size exceeded the cap and the tail was dropped.
    pub truncated: bool,
}

/// Canonical incident record emitted by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedIncident {
    pub id: Option<String>,
    pub title: String,
    pub date: Option<String>,
    pub detail_url: String,
    pub source_label: String,
    /// Milliseconds since the epoch for `date`, used only for ranking.
    #[serde(skip)]
    pub(crate) timestamp_ms: Option<i64>,
}

/// Why a result is not ok, or why an ok result is empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub reason_code: ReasonCode,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMeta {
    pub ok: bool,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<Diagnostic>,
    /// The index page the snapshot was located from.
    pub source_url: String,
    pub archive_url: Option<String>,
    pub entry_name: Option<String>,
    pub format: Option<RecordFormat>,
    /// Number of raw records read before dropping and truncation.
    pub parsed_count: usize,
    /// The chosen entry exceeded `archive.max_entry_bytes`; only its
    /// complete leading records were used.
    pub truncated: bool,
    pub generated_at: DateTime<Utc>,
}

/// The only artifact a pipeline run hands back. Always produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineResult {
    pub meta: ResultMeta,
    pub incidents: Vec<NormalizedIncident>,
}

impl PipelineResult {
    pub fn ok(&self) -> bool {
        self.meta.ok
    }

    pub fn reason_code(&self) -> Option<ReasonCode> {
        self.meta.diagnostic.as_ref().map(|d| d.reason_code)
    }
}
