//! Transport and decompression stage.
//!
//! Opens the archive as a pull-based byte stream and decompresses it on the
//! fly. Nothing here buffers the whole archive: [`HttpTransport`] hands back
//! the live `reqwest` blocking response (which implements [`Read`]), and
//! [`decompress`] wraps it in a bzip2 decoder that only pulls more
//! compressed bytes when its consumer asks for more output. Backpressure is
//! therefore just the call stack of `read()`.
//!
//! # Cancellation
//!
//! A [`CancelToken`] carries a shared cancel flag and an optional deadline.
//! [`GuardedRead`] checks it before every read, so a caller can bound a run
//! or abort it from another thread; the socket itself is bounded by the
//! client's connect/read timeouts.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bzip2::read::MultiBzDecoder;

use crate::config::HttpConfig;
use crate::error::PipelineError;

/// Byte source for the index page and the archive.
///
/// [`HttpTransport`] is the production implementation; tests inject an
/// in-memory one.
pub trait Transport: Send + Sync {
    /// Fetch a small text document (the index page).
    fn fetch_text(&self, url: &str) -> Result<String, PipelineError>;

    /// Open a large binary resource as a stream. The body must not be
    /// materialized before returning.
    fn open_stream(&self, url: &str) -> Result<Box<dyn Read + Send>, PipelineError>;
}

/// HTTP transport backed by `reqwest::blocking`.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Build a client with the configured timeouts and user agent.
    ///
    /// Must not be called from inside an async context: the blocking client
    /// owns its own runtime. The pipeline constructs it on a blocking thread.
    pub fn new(http: &HttpConfig) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(http.user_agent.clone())
            .connect_timeout(Duration::from_secs(http.connect_timeout_secs))
            .timeout(Duration::from_secs(http.timeout_secs))
            .build()?;
        Ok(Self { client })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response, PipelineError> {
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| PipelineError::transport(url, None, e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PipelineError::transport(
                url,
                Some(status.as_u16()),
                status.canonical_reason().unwrap_or("request failed"),
            ));
        }
        Ok(resp)
    }
}

impl Transport for HttpTransport {
    fn fetch_text(&self, url: &str) -> Result<String, PipelineError> {
        let resp = self.get(url)?;
        let status = resp.status().as_u16();
        resp.text()
            .map_err(|e| PipelineError::transport(url, Some(status), e.to_string()))
    }

    fn open_stream(&self, url: &str) -> Result<Box<dyn Read + Send>, PipelineError> {
        let resp = self.get(url)?;
        if resp.content_length() == Some(0) {
            return Err(PipelineError::transport(
                url,
                Some(resp.status().as_u16()),
                "response has no body",
            ));
        }
        Ok(Box::new(resp))
    }
}

/// Incrementally decompress a bzip2 stream (multi-stream archives included).
pub fn decompress<R: Read>(compressed: R) -> MultiBzDecoder<R> {
    MultiBzDecoder::new(compressed)
}

/// Shared cancel flag plus an optional deadline.
///
/// Clones share the flag. [`CancelToken::with_deadline`] derives a token
/// that shares the flag and may tighten the deadline, so one Ctrl-C handler
/// can abort every run while each run keeps its own time bound.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same flag; the deadline becomes the earlier of the existing one and
    /// `now + timeout`.
    pub fn with_deadline(&self, timeout: Option<Duration>) -> Self {
        let own = timeout.map(|t| Instant::now() + t);
        let deadline = match (self.deadline, own) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            flag: Arc::clone(&self.flag),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), PipelineError> {
        self.check_io().map_err(|e| PipelineError::Cancelled {
            message: e.to_string(),
        })
    }

    // Not `Interrupted`: `read_exact` would retry that forever.
    fn check_io(&self) -> io::Result<()> {
        if self.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                StreamCancelled("cancelled by caller"),
            ));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    StreamCancelled("deadline exceeded"),
                ));
            }
        }
        Ok(())
    }
}

/// Payload of the I/O errors raised by [`GuardedRead`].
#[derive(Debug)]
pub struct StreamCancelled(&'static str);

impl std::fmt::Display for StreamCancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for StreamCancelled {}

/// True when `err` came from a fired [`CancelToken`] rather than the stream.
pub fn is_cancellation(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.is::<StreamCancelled>())
}

/// Read wrapper that fails once its [`CancelToken`] fires.
pub struct GuardedRead<R> {
    inner: R,
    cancel: CancelToken,
}

impl<R> GuardedRead<R> {
    pub fn new(inner: R, cancel: CancelToken) -> Self {
        Self { inner, cancel }
    }
}

impl<R: Read> Read for GuardedRead<R> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        self.cancel.check_io()?;
        self.inner.read(dst)
    }
}

/// Read wrapper that counts bytes pulled through it.
///
/// The counter is shared so it can still be read after the wrapper has been
/// moved into a decoder.
pub struct CountedRead<R> {
    inner: R,
    bytes: Arc<AtomicU64>,
}

impl<R> CountedRead<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.bytes)
    }
}

impl<R: Read> Read for CountedRead<R> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(dst)?;
        self.bytes.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn bz2(data: &[u8]) -> Vec<u8> {
        let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::fast());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn decompress_streams_concatenated_members() {
        let mut compressed = bz2(b"first ");
        compressed.extend(bz2(b"second"));
        let mut out = String::new();
        decompress(compressed.as_slice())
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "first second");
    }

    #[test]
    fn counted_read_tracks_bytes() {
        let data = vec![7u8; 10_000];
        let counted = CountedRead::new(data.as_slice());
        let counter = counted.counter();
        let mut sink = Vec::new();
        let mut reader = counted;
        reader.read_to_end(&mut sink).unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 10_000);
    }

    #[test]
    fn guarded_read_stops_after_cancel() {
        let token = CancelToken::new();
        let mut reader = GuardedRead::new(&b"abcdef"[..], token.clone());
        let mut buf = [0u8; 3];
        assert_eq!(reader.read(&mut buf).unwrap(), 3);

        token.cancel();
        let err = reader.read(&mut buf).unwrap_err();
        assert!(is_cancellation(&err));

        let mut rest = Vec::new();
        assert!(reader.read_to_end(&mut rest).is_err());
    }

    #[test]
    fn expired_deadline_fails_check() {
        let token = CancelToken::new().with_deadline(Some(Duration::ZERO));
        let err = token.check().unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { .. }));
    }

    #[test]
    fn derived_deadline_never_extends_parent() {
        let tight = CancelToken::new().with_deadline(Some(Duration::ZERO));
        let derived = tight.with_deadline(Some(Duration::from_secs(3600)));
        assert!(derived.check().is_err());
        assert!(tight.with_deadline(None).check().is_err());
    }

    #[test]
    fn derived_tokens_share_the_flag() {
        let root = CancelToken::new();
        let run = root.with_deadline(None);
        root.cancel();
        assert!(run.is_cancelled());
    }
}
