//! Snapshot locator.
//!
//! Finds the published archive on the snapshot index page. The page is
//! scanned as plain text for file names of the form
//! `{prefix}{YYYYMMDDHHMMSS}{extension}` (e.g. `backup-20250301093000.tar.bz2`);
//! no HTML parsing is involved.
//!
//! When several archives are listed, the one with the numerically greatest
//! timestamp wins, so the result does not depend on the order the page
//! renders them in. If the page carries an `href` that ends with the chosen
//! file name, that link is used (it may point to another directory or host);
//! otherwise the bare file name is resolved against the index URL.

use regex::Regex;
use reqwest::Url;

use crate::config::SourceConfig;
use crate::error::PipelineError;
use crate::models::SnapshotReference;
use crate::transport::{CancelToken, Transport};

/// Archive naming convention: literal prefix, 14-digit stamp, literal extension.
#[derive(Debug, Clone)]
pub struct ArchiveNaming {
    pub prefix: String,
    pub extension: String,
}

impl ArchiveNaming {
    pub fn from_config(source: &SourceConfig) -> Self {
        Self {
            prefix: source.archive_prefix.clone(),
            extension: source.archive_extension.clone(),
        }
    }

    fn pattern(&self) -> Result<Regex, PipelineError> {
        let pattern = format!(
            r"{}(\d{{14}}){}",
            regex::escape(&self.prefix),
            regex::escape(&self.extension)
        );
        Regex::new(&pattern).map_err(|e| PipelineError::UnexpectedFailure {
            message: format!("invalid archive naming pattern: {}", e),
        })
    }
}

/// Fetch the index page and locate the newest archive on it.
pub fn fetch_snapshot_reference(
    transport: &dyn Transport,
    source: &SourceConfig,
    cancel: &CancelToken,
) -> Result<SnapshotReference, PipelineError> {
    cancel.check()?;
    let html = transport.fetch_text(&source.index_url)?;
    locate(&html, &source.index_url, &ArchiveNaming::from_config(source))
}

/// Scan index-page markup for the newest archive and resolve its URL.
pub fn locate(
    html: &str,
    index_url: &str,
    naming: &ArchiveNaming,
) -> Result<SnapshotReference, PipelineError> {
    let not_found = || PipelineError::NoSnapshotFound {
        index_url: index_url.to_string(),
    };

    let mut newest: Option<(u64, &str)> = None;
    for caps in naming.pattern()?.captures_iter(html) {
        let (Some(whole), Some(stamp)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let Ok(timestamp) = stamp.as_str().parse::<u64>() else {
            continue;
        };
        // Strictly greater: on equal stamps the first listing stays.
        if newest.map_or(true, |(best, _)| timestamp > best) {
            newest = Some((timestamp, whole.as_str()));
        }
    }
    let (timestamp, archive_name) = newest.ok_or_else(not_found)?;

    let base = Url::parse(index_url).map_err(|e| PipelineError::UnexpectedFailure {
        message: format!("index URL '{}' is not absolute: {}", index_url, e),
    })?;

    let target = find_href(html, archive_name).unwrap_or(archive_name);
    let resolved = match Url::parse(target) {
        Ok(absolute) => absolute,
        Err(_) => base.join(target).map_err(|e| PipelineError::UnexpectedFailure {
            message: format!("cannot resolve '{}' against {}: {}", target, index_url, e),
        })?,
    };

    Ok(SnapshotReference {
        archive_name: archive_name.to_string(),
        timestamp,
        resolved_url: resolved.to_string(),
    })
}

/// First `href="..."` (or single-quoted) value ending in `file_name`.
fn find_href<'a>(html: &'a str, file_name: &str) -> Option<&'a str> {
    let pattern = format!(
        r#"href\s*=\s*["']([^"']*{})["']"#,
        regex::escape(file_name)
    );
    let re = Regex::new(&pattern).ok()?;
    re.captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}
