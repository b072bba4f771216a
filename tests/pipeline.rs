mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{archive, bzip2, index_page, tar_entries, MemoryTransport, RecordingProgress, INDEX_URL};
use incident_snapshot::cache::MemoryCache;
use incident_snapshot::config::Config;
use incident_snapshot::error::ReasonCode;
use incident_snapshot::parse::RecordFormat;
use incident_snapshot::pipeline::{run_pipeline, run_pipeline_with_cache};
use incident_snapshot::progress::{NoProgress, ProgressEvent};
use incident_snapshot::transport::CancelToken;

const NEWEST: &str = "backup-20250301120000.tar.bz2";
const OLDER: &str = "backup-20240101000000.tar.bz2";

fn config() -> Config {
    let mut cfg = Config::default();
    cfg.source.index_url = INDEX_URL.to_string();
    cfg
}

fn newest_url() -> String {
    format!("{}{}", INDEX_URL, NEWEST)
}

const INCIDENTS_JSON: &[u8] = br#"[
  {"incident_id": 1, "title": "Oldest", "date": "2019-05-01"},
  {"incident_id": 3, "title": "Newest", "date": "2024-11-20T08:30:00Z"},
  {"incident_id": 2, "title": "Middle", "date": "2022-02-02"},
  {"description": "no title or id, dropped"},
  "not an object"
]"#;

fn transport_with(entries: &[(&str, &[u8])]) -> MemoryTransport {
    MemoryTransport::new()
        .page(INDEX_URL, index_page(&[NEWEST, OLDER]))
        .blob(&newest_url(), archive(entries))
}

#[test]
fn newest_snapshot_end_to_end() {
    let transport = transport_with(&[
        ("mongodump/README.md", b"docs"),
        ("mongodump/aiidprod/reports.csv", b"title\nnot an incident\n"),
        ("mongodump/aiidprod/incidents.json", INCIDENTS_JSON),
    ]);
    let progress = RecordingProgress::default();

    let result = run_pipeline(&transport, &config(), &progress, &CancelToken::new());

    assert!(result.ok(), "unexpected failure: {:?}", result.meta.diagnostic);
    assert_eq!(result.meta.archive_url.as_deref(), Some(newest_url().as_str()));
    assert_eq!(
        result.meta.entry_name.as_deref(),
        Some("mongodump/aiidprod/incidents.json")
    );
    assert_eq!(result.meta.format, Some(RecordFormat::Json));
    assert_eq!(result.meta.parsed_count, 4);

    let titles: Vec<&str> = result.incidents.iter().map(|i| i.title.as_str()).collect();
    assert_eq!(titles, vec!["Newest", "Middle", "Oldest"]);
    assert_eq!(result.incidents[0].id.as_deref(), Some("3"));
    assert_eq!(result.incidents[0].date.as_deref(), Some("2024-11-20T08:30:00Z"));
    assert_eq!(
        result.incidents[0].detail_url,
        "https://incidentdatabase.ai/cite/3"
    );

    let events = progress.events.lock().unwrap();
    assert!(matches!(events.first(), Some(ProgressEvent::Locating { .. })));
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::Finished { ok: true, incidents: 3, reason: None })
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::EntrySkipped { name } if name.ends_with("reports.csv"))));
}

#[test]
fn index_without_archives_is_no_snapshot_found() {
    let transport = MemoryTransport::new().page(INDEX_URL, index_page(&["notes.txt"]));
    let result = run_pipeline(&transport, &config(), &NoProgress, &CancelToken::new());

    assert!(!result.ok());
    assert_eq!(result.reason_code(), Some(ReasonCode::NoSnapshotFound));
    assert!(result.incidents.is_empty());
    assert_eq!(result.meta.source_url, INDEX_URL);
    assert_eq!(result.meta.archive_url, None);
}

#[test]
fn unreachable_index_degrades_to_empty() {
    let transport = MemoryTransport::new().status(INDEX_URL, 503);
    let result = run_pipeline(&transport, &config(), &NoProgress, &CancelToken::new());

    assert!(!result.ok());
    assert_eq!(result.reason_code(), Some(ReasonCode::TransportFailed));
    let details = &result.meta.diagnostic.as_ref().unwrap().details;
    assert!(details.contains("503"), "details: {}", details);
}

#[test]
fn missing_archive_reports_transport_failure_with_url() {
    let transport = MemoryTransport::new().page(INDEX_URL, index_page(&[NEWEST]));
    let result = run_pipeline(&transport, &config(), &NoProgress, &CancelToken::new());

    assert_eq!(result.reason_code(), Some(ReasonCode::TransportFailed));
    assert_eq!(result.meta.archive_url.as_deref(), Some(newest_url().as_str()));
    assert_eq!(transport.streams_opened.load(Ordering::SeqCst), 0);
}

#[test]
fn archive_without_incident_file_is_no_matching_entry() {
    let transport = transport_with(&[
        ("dump/reports.json", b"[]"),
        ("dump/incidents.bson", b"\x00\x01"),
    ]);
    let result = run_pipeline(&transport, &config(), &NoProgress, &CancelToken::new());

    assert!(!result.ok());
    assert_eq!(result.reason_code(), Some(ReasonCode::NoMatchingEntry));
    assert_eq!(result.meta.entry_name, None);
}

#[test]
fn unparseable_candidates_report_parse_failure() {
    let transport = transport_with(&[
        ("a/incidents.json", b"{\"incidents\": []}"),
        ("b/incidents.jsonl", b"{\"title\": \"ok\"}\nnot json\n"),
    ]);
    let result = run_pipeline(&transport, &config(), &NoProgress, &CancelToken::new());

    assert_eq!(result.reason_code(), Some(ReasonCode::ParseFailed));
    assert_eq!(result.meta.entry_name.as_deref(), Some("b/incidents.jsonl"));
    assert!(result.incidents.is_empty());
}

#[test]
fn oversized_entry_is_capped() {
    let mut csv = String::from("incident_id,title,date\n");
    for i in 0..500 {
        csv.push_str(&format!("{},Incident number {},2023-01-01\n", i, i));
    }
    let transport = transport_with(&[("incidents.csv", csv.as_bytes())]);
    let mut cfg = config();
    cfg.archive.max_entry_bytes = 1024;
    let progress = RecordingProgress::default();

    let result = run_pipeline(&transport, &cfg, &progress, &CancelToken::new());

    assert!(result.ok());
    assert!(result.meta.parsed_count > 0);
    assert!(result.meta.parsed_count < 500);
    assert!(result.meta.truncated);
    for incident in &result.incidents {
        let id = incident.id.as_deref().unwrap();
        assert_eq!(incident.title, format!("Incident number {}", id));
        assert_eq!(incident.date.as_deref(), Some("2023-01-01"));
    }
    let events = progress.events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::EntrySelected { bytes: 1024, truncated: true, .. }
    )));
}

#[test]
fn walk_stops_once_candidates_are_collected() {
    // A valid first bzip2 stream followed by bytes that cannot be decoded.
    let mut blob = bzip2(&tar_entries(&[("incidents.csv", b"title\nOnly one\n")]));
    blob.extend_from_slice(b"this is not a bzip2 stream");

    let transport = MemoryTransport::new()
        .page(INDEX_URL, index_page(&[NEWEST]))
        .blob(&newest_url(), blob);

    let mut single = config();
    single.archive.max_candidates = 1;
    let result = run_pipeline(&transport, &single, &NoProgress, &CancelToken::new());
    assert!(result.ok(), "unexpected failure: {:?}", result.meta.diagnostic);
    assert_eq!(result.incidents.len(), 1);

    // Looking for a second candidate reaches the corrupt tail.
    let result = run_pipeline(&transport, &config(), &NoProgress, &CancelToken::new());
    assert_eq!(result.reason_code(), Some(ReasonCode::TransportFailed));
}

#[test]
fn cancelled_run_stops_before_fetching() {
    let transport = transport_with(&[("incidents.json", INCIDENTS_JSON)]);
    let cancel = CancelToken::new();
    cancel.cancel();

    let result = run_pipeline(&transport, &config(), &NoProgress, &cancel);

    assert!(!result.ok());
    assert_eq!(result.reason_code(), Some(ReasonCode::Cancelled));
    assert_eq!(transport.streams_opened.load(Ordering::SeqCst), 0);
}

#[test]
fn max_incidents_truncates_ranked_list() {
    let transport = transport_with(&[("incidents.json", INCIDENTS_JSON)]);
    let mut cfg = config();
    cfg.output.max_incidents = 2;

    let result = run_pipeline(&transport, &cfg, &NoProgress, &CancelToken::new());

    let titles: Vec<&str> = result.incidents.iter().map(|i| i.title.as_str()).collect();
    assert_eq!(titles, vec!["Newest", "Middle"]);
    assert_eq!(result.meta.parsed_count, 4);
}

#[test]
fn fresh_cache_entry_skips_download() {
    let transport = transport_with(&[("incidents.json", INCIDENTS_JSON)]);
    let cache = MemoryCache::new(Duration::from_secs(600));
    let cfg = config();

    let first = run_pipeline_with_cache(
        &transport,
        &cfg,
        Some(&cache),
        &NoProgress,
        &CancelToken::new(),
    );
    let progress = RecordingProgress::default();
    let second = run_pipeline_with_cache(
        &transport,
        &cfg,
        Some(&cache),
        &progress,
        &CancelToken::new(),
    );

    assert!(first.ok());
    assert_eq!(first, second);
    assert_eq!(transport.streams_opened.load(Ordering::SeqCst), 1);
    let events = progress.events.lock().unwrap();
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::CacheHit { .. })));
}

#[test]
fn failed_runs_are_not_cached() {
    let transport = transport_with(&[("dump/reports.json", b"[]")]);
    let cache = MemoryCache::new(Duration::from_secs(600));

    for _ in 0..2 {
        let result = run_pipeline_with_cache(
            &transport,
            &config(),
            Some(&cache),
            &NoProgress,
            &CancelToken::new(),
        );
        assert_eq!(result.reason_code(), Some(ReasonCode::NoMatchingEntry));
    }
    assert!(cache.is_empty());
    assert_eq!(transport.streams_opened.load(Ordering::SeqCst), 2);
}
