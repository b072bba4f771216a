//! Pipeline driver.
//!
//! Chains the stages in order and turns every outcome into a
//! [`PipelineResult`]:
//!
//! ```text
//! locator ──▶ transport ──▶ bzip2 ──▶ demux ──▶ parse ──▶ normalize/rank
//! (index)     (stream)     (stream)  (entries) (records)  (incidents)
//! ```
//!
//! The driver never returns an error. Each [`PipelineError`], and any
//! panic inside a stage, becomes `ok = false` with a reason code so that a
//! recurring job degrades to "no new data" instead of crashing.
//!
//! # Candidate fallback
//!
//! The demultiplexer keeps up to `archive.max_candidates` matching entries.
//! They are parsed in archive order and the first one that parses wins; if
//! none does, the last parse error is reported.

use std::io::Read;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::cache::{cache_key, ResultCache};
use crate::config::Config;
use crate::demux::{collect_candidates, SelectionRule};
use crate::error::{PipelineError, ReasonCode};
use crate::locator::fetch_snapshot_reference;
use crate::models::{Diagnostic, NormalizedIncident, PipelineResult, ResultMeta};
use crate::normalize::{normalize_records, rank_and_truncate};
use crate::parse::{parse_entry, RecordFormat};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::transport::{decompress, CancelToken, CountedRead, GuardedRead, HttpTransport, Transport};

/// What a run has learned so far, reported even when a later stage fails.
#[derive(Default)]
struct RunState {
    archive_url: Option<String>,
    entry_name: Option<String>,
    format: Option<RecordFormat>,
    parsed_count: usize,
    truncated: bool,
}

/// Locate, download and process the current snapshot.
pub fn run_pipeline(
    transport: &dyn Transport,
    config: &Config,
    progress: &dyn ProgressReporter,
    cancel: &CancelToken,
) -> PipelineResult {
    run_pipeline_with_cache(transport, config, None, progress, cancel)
}

/// [`run_pipeline`], consulting `cache` after the snapshot is located.
pub fn run_pipeline_with_cache(
    transport: &dyn Transport,
    config: &Config,
    cache: Option<&dyn ResultCache>,
    progress: &dyn ProgressReporter,
    cancel: &CancelToken,
) -> PipelineResult {
    let mut state = RunState::default();
    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<Completed, PipelineError> {
        progress.report(ProgressEvent::Locating {
            index_url: config.source.index_url.clone(),
        });
        let snapshot = fetch_snapshot_reference(transport, &config.source, cancel)?;
        let archive_url = snapshot.resolved_url;
        state.archive_url = Some(archive_url.clone());
        progress.report(ProgressEvent::Located {
            archive_url: archive_url.clone(),
        });

        let key = cache.map(|_| cache_key(&archive_url, config));
        if let (Some(cache), Some(key)) = (cache, key.as_deref()) {
            if let Some(hit) = cache.get(key) {
                progress.report(ProgressEvent::CacheHit { archive_url });
                return Ok(Completed::Cached(hit));
            }
        }

        cancel.check()?;
        let stream = transport.open_stream(&archive_url)?;
        let incidents = process_archive(stream, &archive_url, config, progress, cancel, &mut state)?;
        Ok(Completed::Fresh(incidents))
    }));

    let result = match outcome {
        Ok(Ok(Completed::Cached(hit))) => {
            report_finished(progress, &hit);
            return hit;
        }
        Ok(Ok(Completed::Fresh(incidents))) => Ok(incidents),
        Ok(Err(err)) => Err(err),
        Err(panic) => Err(PipelineError::UnexpectedFailure {
            message: panic_message(panic.as_ref()),
        }),
    };

    let result = build_result(config, state, result);
    if let (Some(cache), Some(archive_url)) = (cache, result.meta.archive_url.as_deref()) {
        if result.ok() {
            cache.put(&cache_key(archive_url, config), &result);
        }
    }
    report_finished(progress, &result);
    result
}

/// Process an already-open compressed archive (stages 2-5).
///
/// `archive_url` is only used for diagnostics; a local path works too.
pub fn run_archive<R: Read>(
    compressed: R,
    archive_url: &str,
    config: &Config,
    progress: &dyn ProgressReporter,
    cancel: &CancelToken,
) -> PipelineResult {
    let mut state = RunState {
        archive_url: Some(archive_url.to_string()),
        ..RunState::default()
    };
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        process_archive(compressed, archive_url, config, progress, cancel, &mut state)
    }));
    let outcome = outcome.unwrap_or_else(|panic| {
        Err(PipelineError::UnexpectedFailure {
            message: panic_message(panic.as_ref()),
        })
    });
    let result = build_result(config, state, outcome);
    report_finished(progress, &result);
    result
}

/// Run on a blocking thread so async callers are never stalled.
///
/// The HTTP client is built on that thread too, and the run is bounded by
/// `http.deadline_secs` on top of whatever `cancel` already carries.
pub async fn run_pipeline_async(
    config: Arc<Config>,
    cache: Option<Arc<dyn ResultCache>>,
    progress: Arc<dyn ProgressReporter>,
    cancel: CancelToken,
) -> PipelineResult {
    let fallback_config = Arc::clone(&config);
    let handle = tokio::task::spawn_blocking(move || {
        let cancel = cancel.with_deadline(config.http.deadline_secs.map(Duration::from_secs));
        match HttpTransport::new(&config.http) {
            Ok(transport) => run_pipeline_with_cache(
                &transport,
                &config,
                cache.as_deref(),
                &*progress,
                &cancel,
            ),
            Err(e) => build_result(
                &config,
                RunState::default(),
                Err(PipelineError::UnexpectedFailure {
                    message: format!("failed to build HTTP client: {}", e),
                }),
            ),
        }
    });

    match handle.await {
        Ok(result) => result,
        Err(join_err) => build_result(
            &fallback_config,
            RunState::default(),
            Err(PipelineError::UnexpectedFailure {
                message: join_err.to_string(),
            }),
        ),
    }
}

enum Completed {
    Cached(PipelineResult),
    Fresh(Vec<NormalizedIncident>),
}

fn process_archive<R: Read>(
    compressed: R,
    archive_url: &str,
    config: &Config,
    progress: &dyn ProgressReporter,
    cancel: &CancelToken,
    state: &mut RunState,
) -> Result<Vec<NormalizedIncident>, PipelineError> {
    progress.report(ProgressEvent::Downloading {
        archive_url: archive_url.to_string(),
    });

    let counted = CountedRead::new(compressed);
    let compressed_bytes = counted.counter();
    let decoded = GuardedRead::new(decompress(counted), cancel.clone());

    let rule = SelectionRule::from_config(&config.archive);
    let candidates = collect_candidates(
        decoded,
        &rule,
        config.archive.max_entry_bytes,
        config.archive.max_candidates,
        progress,
    )
    .map_err(|e| PipelineError::from_stream_io(archive_url, e))?;

    progress.report(ProgressEvent::Downloaded {
        compressed_bytes: compressed_bytes.load(Ordering::Relaxed),
    });

    let mut last_error = PipelineError::NoMatchingEntry;
    for entry in &candidates {
        state.entry_name = Some(entry.name.clone());
        match parse_entry(entry) {
            Ok(parsed) => {
                state.format = Some(parsed.format);
                state.parsed_count = parsed.records.len();
                state.truncated = entry.truncated;
                progress.report(ProgressEvent::Parsed {
                    format: parsed.format,
                    records: parsed.records.len(),
                });
                let incidents =
                    normalize_records(&parsed.records, &config.aliases, &config.source);
                return Ok(rank_and_truncate(incidents, config.output.max_incidents));
            }
            Err(e) => {
                let message = if entry.truncated {
                    format!("{} (entry truncated at {} bytes)", e, entry.payload.len())
                } else {
                    e.to_string()
                };
                last_error = PipelineError::ParseFailed {
                    entry: entry.name.clone(),
                    message,
                };
            }
        }
    }
    Err(last_error)
}

fn build_result(
    config: &Config,
    state: RunState,
    outcome: Result<Vec<NormalizedIncident>, PipelineError>,
) -> PipelineResult {
    let (ok, diagnostic, incidents) = match outcome {
        Ok(incidents) if incidents.is_empty() => {
            let entry = state.entry_name.as_deref().unwrap_or("the selected entry");
            let details = if state.parsed_count == 0 {
                format!("{} contains no records", entry)
            } else {
                format!(
                    "{} records read from {}; none had a resolvable title",
                    state.parsed_count, entry
                )
            };
            let diagnostic = Diagnostic {
                reason_code: ReasonCode::EmptyResult,
                details,
            };
            (true, Some(diagnostic), incidents)
        }
        Ok(incidents) => (true, None, incidents),
        Err(err) => {
            let diagnostic = Diagnostic {
                reason_code: err.reason_code(),
                details: err.to_string(),
            };
            (false, Some(diagnostic), Vec::new())
        }
    };

    PipelineResult {
        meta: ResultMeta {
            ok,
            diagnostic,
            source_url: config.source.index_url.clone(),
            archive_url: state.archive_url,
            entry_name: state.entry_name,
            format: state.format,
            parsed_count: state.parsed_count,
            truncated: state.truncated,
            generated_at: Utc::now(),
        },
        incidents,
    }
}

fn report_finished(progress: &dyn ProgressReporter, result: &PipelineResult) {
    progress.report(ProgressEvent::Finished {
        ok: result.ok(),
        incidents: result.incidents.len(),
        reason: result.reason_code(),
    });
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic in pipeline stage".to_string()
    }
}
