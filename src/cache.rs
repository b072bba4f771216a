//! Result cache for repeated runs.
//!
//! The pipeline itself is stateless. A caller that runs it on a schedule
//! can inject a [`ResultCache`]; the driver then locates the snapshot
//! first and skips the download when a fresh result for the same archive
//! is already cached.
//!
//! Keys are derived by [`cache_key`] from the archive URL plus every
//! setting that changes the output, so a config change never serves a
//! stale shape. Only `ok` results are stored.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::models::PipelineResult;

pub trait ResultCache: Send + Sync {
    /// A fresh result for `key`, if one is stored.
    fn get(&self, key: &str) -> Option<PipelineResult>;

    fn put(&self, key: &str, result: &PipelineResult);
}

/// In-process cache with a fixed time-to-live.
pub struct MemoryCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, PipelineResult)>>,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_at(&self, key: &str, now: Instant) -> Option<PipelineResult> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .filter(|(stored_at, _)| now.saturating_duration_since(*stored_at) < self.ttl)
            .map(|(_, result)| result.clone())
    }

    pub fn put_at(&self, key: &str, result: &PipelineResult, now: Instant) {
        if !result.ok() {
            return;
        }
        if let Ok(mut entries) = self.entries.lock() {
            let ttl = self.ttl;
            entries.retain(|_, (stored_at, _)| now.saturating_duration_since(*stored_at) < ttl);
            entries.insert(key.to_string(), (now, result.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultCache for MemoryCache {
    fn get(&self, key: &str) -> Option<PipelineResult> {
        self.get_at(key, Instant::now())
    }

    fn put(&self, key: &str, result: &PipelineResult) {
        self.put_at(key, result, Instant::now())
    }
}

/// Hex SHA-256 over the archive URL and the output-shaping settings.
pub fn cache_key(archive_url: &str, config: &Config) -> String {
    let mut hasher = Sha256::new();
    let mut field = |value: &str| {
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value.as_bytes());
    };

    field(archive_url);
    field(&config.output.max_incidents.to_string());
    field(&config.archive.max_entry_bytes.to_string());
    field(&config.archive.max_candidates.to_string());
    field(&config.archive.marker);
    field(&config.archive.extensions.join(","));
    field(&config.archive.exclude.join(","));
    field(&config.aliases.id.join(","));
    field(&config.aliases.title.join(","));
    field(&config.aliases.date.join(","));
    field(&config.source.detail_base_url);
    field(&config.source.fallback_url);
    field(&config.source.source_label);

    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResultMeta;

    fn result(ok: bool) -> PipelineResult {
        PipelineResult {
            meta: ResultMeta {
                ok,
                diagnostic: None,
                source_url: "https://example.org/".to_string(),
                archive_url: Some("https://example.org/backup-20250101000000.tar.bz2".into()),
                entry_name: None,
                format: None,
                parsed_count: 0,
                truncated: false,
                generated_at: chrono::Utc::now(),
            },
            incidents: Vec::new(),
        }
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        let t0 = Instant::now();
        cache.put_at("k", &result(true), t0);
        assert!(cache.get_at("k", t0 + Duration::from_secs(59)).is_some());
        assert!(cache.get_at("k", t0 + Duration::from_secs(60)).is_none());
    }

    #[test]
    fn failed_results_are_not_cached() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        cache.put("k", &result(false));
        assert!(cache.is_empty());
    }

    #[test]
    fn key_depends_on_url_and_output_settings() {
        let config = Config::default();
        let a = cache_key("https://x/backup-1.tar.bz2", &config);
        assert_eq!(a, cache_key("https://x/backup-1.tar.bz2", &config));
        assert_ne!(a, cache_key("https://x/backup-2.tar.bz2", &config));

        let mut smaller = Config::default();
        smaller.output.max_incidents = 10;
        assert_ne!(a, cache_key("https://x/backup-1.tar.bz2", &smaller));
        assert_eq!(a.len(), 64);
    }
}
