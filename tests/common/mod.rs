#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use incident_snapshot::error::PipelineError;
use incident_snapshot::progress::{ProgressEvent, ProgressReporter};
use incident_snapshot::transport::Transport;

pub const INDEX_URL: &str = "https://snapshots.test/research/snapshots/";

/// Raw tar bytes for regular-file entries, without the end-of-archive
/// marker.
pub fn tar_entries(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, body) in entries {
        let mut h = [0u8; 512];
        h[..name.len()].copy_from_slice(name.as_bytes());
        h[100..108].copy_from_slice(b"0000644\0");
        h[108..116].copy_from_slice(b"0000000\0");
        h[116..124].copy_from_slice(b"0000000\0");
        h[124..136].copy_from_slice(format!("{:011o}\0", body.len()).as_bytes());
        h[136..148].copy_from_slice(b"00000000000\0");
        h[156] = b'0';
        h[257..263].copy_from_slice(b"ustar\0");
        h[263..265].copy_from_slice(b"00");
        h[148..156].copy_from_slice(b"        ");
        let sum: u32 = h.iter().map(|&b| u32::from(b)).sum();
        h[148..156].copy_from_slice(format!("{:06o}\0 ", sum).as_bytes());

        out.extend_from_slice(&h);
        out.extend_from_slice(body);
        out.resize(out.len().div_ceil(512) * 512, 0);
    }
    out
}

pub fn bzip2(data: &[u8]) -> Vec<u8> {
    let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::fast());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// A complete `.tar.bz2` archive.
pub fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut tar = tar_entries(entries);
    tar.extend_from_slice(&[0u8; 1024]);
    bzip2(&tar)
}

pub fn index_page(links: &[&str]) -> String {
    let items: String = links
        .iter()
        .map(|href| format!("<li><a href=\"{}\">{}</a></li>\n", href, href))
        .collect();
    format!("<html><body><h1>Snapshots</h1><ul>\n{}</ul></body></html>", items)
}

/// Serves canned bodies by URL; anything else is a 404.
#[derive(Default)]
pub struct MemoryTransport {
    pages: HashMap<String, String>,
    blobs: HashMap<String, Vec<u8>>,
    statuses: HashMap<String, u16>,
    pub streams_opened: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, html: String) -> Self {
        self.pages.insert(url.to_string(), html);
        self
    }

    pub fn blob(mut self, url: &str, bytes: Vec<u8>) -> Self {
        self.blobs.insert(url.to_string(), bytes);
        self
    }

    pub fn status(mut self, url: &str, status: u16) -> Self {
        self.statuses.insert(url.to_string(), status);
        self
    }

    fn check_status(&self, url: &str) -> Result<(), PipelineError> {
        if let Some(&status) = self.statuses.get(url) {
            return Err(PipelineError::TransportFailed {
                url: url.to_string(),
                status: Some(status),
                message: "canned failure".to_string(),
            });
        }
        Ok(())
    }

    fn not_found(url: &str) -> PipelineError {
        PipelineError::TransportFailed {
            url: url.to_string(),
            status: Some(404),
            message: "Not Found".to_string(),
        }
    }
}

impl Transport for MemoryTransport {
    fn fetch_text(&self, url: &str) -> Result<String, PipelineError> {
        self.check_status(url)?;
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| Self::not_found(url))
    }

    fn open_stream(&self, url: &str) -> Result<Box<dyn Read + Send>, PipelineError> {
        self.check_status(url)?;
        let bytes = self.blobs.get(url).ok_or_else(|| Self::not_found(url))?;
        self.streams_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Cursor::new(bytes.clone())))
    }
}

/// Records every event for later assertions.
#[derive(Default)]
pub struct RecordingProgress {
    pub events: Mutex<Vec<ProgressEvent>>,
}

impl ProgressReporter for RecordingProgress {
    fn report(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}
