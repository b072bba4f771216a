//! TOML configuration for the snapshot pipeline.
//!
//! Every field has a default, so a config file only needs to name what it
//! overrides. When `incsnap` is run without `--config`, [`Config::default`]
//! is used as-is.
//!
//! ```toml
//! [source]
//! index_url = "https://incidentdatabase.ai/research/snapshots/"
//!
//! [archive]
//! max_entry_bytes = 20971520
//! max_candidates = 2
//!
//! [output]
//! max_incidents = 200
//! path = "public/aiid-latest.json"
//!
//! [aliases]
//! id = ["incident_id", "incidentId", "id", "_id"]
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::normalize::AliasTable;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub aliases: AliasTable,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Where the snapshot is published and how incidents link back to it.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_index_url")]
    pub index_url: String,
    #[serde(default = "default_archive_prefix")]
    pub archive_prefix: String,
    #[serde(default = "default_archive_extension")]
    pub archive_extension: String,
    #[serde(default = "default_detail_base_url")]
    pub detail_base_url: String,
    #[serde(default = "default_fallback_url")]
    pub fallback_url: String,
    #[serde(default = "default_source_label")]
    pub source_label: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            index_url: default_index_url(),
            archive_prefix: default_archive_prefix(),
            archive_extension: default_archive_extension(),
            detail_base_url: default_detail_base_url(),
            fallback_url: default_fallback_url(),
            source_label: default_source_label(),
        }
    }
}

fn default_index_url() -> String {
    "https://incidentdatabase.ai/research/snapshots/".to_string()
}
fn default_archive_prefix() -> String {
    "backup-".to_string()
}
fn default_archive_extension() -> String {
    ".tar.bz2".to_string()
}
fn default_detail_base_url() -> String {
    "https://incidentdatabase.ai/cite".to_string()
}
fn default_fallback_url() -> String {
    "https://incidentdatabase.ai/".to_string()
}
fn default_source_label() -> String {
    "AI Incident Database (snapshot)".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    /// Read timeout: bounds the wait for response headers and then each
    /// body read separately, not the whole download. `deadline_secs`
    /// bounds a whole run.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Upper bound on one whole pipeline run. `None` disables the deadline.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: Option<u64>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            deadline_secs: default_deadline_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    120
}
fn default_connect_timeout_secs() -> u64 {
    15
}
fn default_deadline_secs() -> Option<u64> {
    Some(600)
}
fn default_user_agent() -> String {
    format!("incsnap/{}", env!("CARGO_PKG_VERSION"))
}

/// Archive walking limits and the entry selection predicate.
#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    #[serde(default = "default_max_entry_bytes")]
    pub max_entry_bytes: u64,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default = "default_marker")]
    pub marker: String,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            max_entry_bytes: default_max_entry_bytes(),
            max_candidates: default_max_candidates(),
            marker: default_marker(),
            extensions: default_extensions(),
            exclude: default_exclude(),
        }
    }
}

fn default_max_entry_bytes() -> u64 {
    20 * 1024 * 1024
}
fn default_max_candidates() -> usize {
    2
}
fn default_marker() -> String {
    "incident".to_string()
}
fn default_extensions() -> Vec<String> {
    vec![
        "csv".to_string(),
        "json".to_string(),
        "jsonl".to_string(),
        "ndjson".to_string(),
    ]
}
fn default_exclude() -> Vec<String> {
    vec![
        "readme".to_string(),
        "schema".to_string(),
        "metadata".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_max_incidents")]
    pub max_incidents: usize,
    #[serde(default = "default_output_path")]
    pub path: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_incidents: default_max_incidents(),
            path: default_output_path(),
        }
    }
}

fn default_max_incidents() -> usize {
    200
}
fn default_output_path() -> PathBuf {
    PathBuf::from("public/aiid-latest.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    3600
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate source
    reqwest::Url::parse(&config.source.index_url).with_context(|| {
        format!(
            "source.index_url is not an absolute URL: '{}'",
            config.source.index_url
        )
    })?;
    let detail_base = reqwest::Url::parse(&config.source.detail_base_url).with_context(|| {
        format!(
            "source.detail_base_url is not an absolute URL: '{}'",
            config.source.detail_base_url
        )
    })?;
    if detail_base.cannot_be_a_base() {
        anyhow::bail!(
            "source.detail_base_url cannot take an incident id path segment: '{}'",
            config.source.detail_base_url
        );
    }
    reqwest::Url::parse(&config.source.fallback_url).with_context(|| {
        format!(
            "source.fallback_url is not an absolute URL: '{}'",
            config.source.fallback_url
        )
    })?;
    if config.source.archive_prefix.is_empty() || config.source.archive_extension.is_empty() {
        anyhow::bail!("source.archive_prefix and source.archive_extension must not be empty");
    }

    // Validate archive
    if config.archive.max_entry_bytes == 0 {
        anyhow::bail!("archive.max_entry_bytes must be > 0");
    }
    if config.archive.max_candidates == 0 {
        anyhow::bail!("archive.max_candidates must be >= 1");
    }
    if config.archive.marker.trim().is_empty() {
        anyhow::bail!("archive.marker must not be empty");
    }
    if config.archive.extensions.is_empty() {
        anyhow::bail!("archive.extensions must list at least one extension");
    }

    // Validate output
    if config.output.max_incidents == 0 {
        anyhow::bail!("output.max_incidents must be >= 1");
    }

    // Validate aliases
    for (field, aliases) in [
        ("id", &config.aliases.id),
        ("title", &config.aliases.title),
        ("date", &config.aliases.date),
    ] {
        if aliases.is_empty() {
            anyhow::bail!("aliases.{} must list at least one field name", field);
        }
    }

    Ok(())
}
