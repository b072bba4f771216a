//! Archive demultiplexer.
//!
//! Walks a decompressed tar stream entry by entry and keeps only the
//! entries that look like the incident data file.
//!
//! # Invariants
//! - Parsing is sequential; no seeks are performed.
//! - Every payload is consumed (kept or drained) so the 512-byte framing of
//!   the next header is never lost.
//! - Non-matching payloads are drained through a fixed scratch buffer and
//!   never retained.
//! - A kept payload holds at most `max_entry_bytes`; the remainder is read
//!   and dropped, and the entry is flagged `truncated`.
//! - Size fields are untrusted: a header whose checksum does not match, or
//!   a stream that ends inside a header or payload, is an I/O error.
//!
//! # Algorithm
//! - Read 512-byte header blocks until two zero blocks or a clean EOF.
//! - Resolve GNU long names (`L`) and PAX `path=` records (`x`) for the
//!   next entry; global PAX headers (`g`) are skipped.
//! - Test each regular file's name against the [`SelectionRule`].
//! - Stop once `max_candidates` entries have been kept.

use std::io::{self, Read};

use crate::config::ArchiveConfig;
use crate::models::ArchiveEntry;
use crate::progress::{ProgressEvent, ProgressReporter};

pub const BLOCK_LEN: usize = 512;
const USTAR_MAGIC_OFFSET: usize = 257;
/// Upper bound on GNU long-name and PAX records we are willing to buffer.
const MAX_META_BYTES: u64 = 1024 * 1024;

/// Case-insensitive name predicate for the incident data file.
///
/// A name is selected when it contains the marker, ends in one of the
/// structured-data extensions, and contains none of the excluded
/// substrings. The archive layout is not stable across snapshots, so this
/// is deliberately looser than an exact path.
#[derive(Debug, Clone)]
pub struct SelectionRule {
    marker: String,
    extensions: Vec<String>,
    exclude: Vec<String>,
}

impl SelectionRule {
    pub fn new(marker: &str, extensions: &[String], exclude: &[String]) -> Self {
        Self {
            marker: marker.to_lowercase(),
            extensions: extensions
                .iter()
                .map(|e| format!(".{}", e.trim_start_matches('.').to_lowercase()))
                .collect(),
            exclude: exclude.iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    pub fn from_config(archive: &ArchiveConfig) -> Self {
        Self::new(&archive.marker, &archive.extensions, &archive.exclude)
    }

    pub fn matches(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        name.contains(&self.marker)
            && self.extensions.iter().any(|ext| name.ends_with(ext.as_str()))
            && !self.exclude.iter().any(|ex| name.contains(ex.as_str()))
    }
}

/// Walk the archive and keep up to `max_candidates` matching entries, in
/// archive order.
///
/// The first element, if any, is the entry a single-winner walk would pick.
/// Later elements are fallbacks for when the first one fails to parse.
pub fn collect_candidates<R: Read>(
    input: R,
    rule: &SelectionRule,
    max_entry_bytes: u64,
    max_candidates: usize,
    progress: &dyn ProgressReporter,
) -> io::Result<Vec<ArchiveEntry>> {
    let mut walker = TarWalker::new(input);
    let mut candidates = Vec::new();

    while candidates.len() < max_candidates {
        let Some(header) = walker.next_header()? else {
            break;
        };

        if !header.is_regular() || !rule.matches(&header.name) {
            if header.is_regular() {
                progress.report(ProgressEvent::EntrySkipped {
                    name: header.name.clone(),
                });
            }
            walker.skip_payload(header.size)?;
            continue;
        }

        let payload = walker.read_payload_bounded(header.size, max_entry_bytes)?;
        let truncated = (payload.len() as u64) < header.size;
        progress.report(ProgressEvent::EntrySelected {
            name: header.name.clone(),
            bytes: payload.len() as u64,
            truncated,
        });
        candidates.push(ArchiveEntry {
            name: header.name,
            payload,
            size_bytes: header.size,
            truncated,
        });
    }

    Ok(candidates)
}

/// Single-winner walk: the first entry that satisfies `rule`, if any.
pub fn select_entry<R: Read>(
    input: R,
    rule: &SelectionRule,
    max_entry_bytes: u64,
    progress: &dyn ProgressReporter,
) -> io::Result<Option<ArchiveEntry>> {
    Ok(collect_candidates(input, rule, max_entry_bytes, 1, progress)?
        .into_iter()
        .next())
}

/// A header after GNU/PAX overrides have been applied.
#[derive(Debug)]
pub struct EntryHeader {
    pub name: String,
    pub size: u64,
    pub typeflag: u8,
}

impl EntryHeader {
    pub fn is_regular(&self) -> bool {
        matches!(self.typeflag, 0 | b'0' | b'7')
    }
}

/// Sequential tar header reader.
///
/// Callers must consume every entry's payload with [`skip_payload`] or
/// [`read_payload_bounded`] before asking for the next header.
///
/// [`skip_payload`]: TarWalker::skip_payload
/// [`read_payload_bounded`]: TarWalker::read_payload_bounded
pub struct TarWalker<R> {
    input: R,
    header: [u8; BLOCK_LEN],
    discard: Vec<u8>,
    long_name: Option<String>,
    pax_path: Option<String>,
    done: bool,
}

impl<R: Read> TarWalker<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            header: [0; BLOCK_LEN],
            discard: vec![0; 8192],
            long_name: None,
            pax_path: None,
            done: false,
        }
    }

    /// Next file-like entry, or `None` at the end of the archive.
    pub fn next_header(&mut self) -> io::Result<Option<EntryHeader>> {
        if self.done {
            return Ok(None);
        }
        let mut zero_blocks = 0u8;
        loop {
            if !read_exact_or_eof(&mut self.input, &mut self.header)? {
                self.done = true;
                return Ok(None);
            }

            if self.header.iter().all(|&b| b == 0) {
                zero_blocks += 1;
                if zero_blocks >= 2 {
                    self.done = true;
                    return Ok(None);
                }
                continue;
            }
            zero_blocks = 0;

            verify_checksum(&self.header)?;
            let typeflag = self.header[156];
            let size = parse_size(&self.header[124..136])?;

            match typeflag {
                b'L' => {
                    let raw = self.read_meta(size)?;
                    self.long_name = Some(cstr_lossy(&raw));
                }
                b'x' => {
                    let raw = self.read_meta(size)?;
                    if let Some(path) = pax_path(&raw) {
                        self.pax_path = Some(path);
                    }
                }
                // Global PAX records never rename a single entry.
                b'g' => self.skip_payload(size)?,
                _ => {
                    let base = ustar_name(&self.header);
                    // Overrides apply to exactly one real entry.
                    let name = self
                        .pax_path
                        .take()
                        .or(self.long_name.take())
                        .unwrap_or(base);
                    return Ok(Some(EntryHeader {
                        name,
                        size,
                        typeflag,
                    }));
                }
            }
        }
    }

    /// Drain `size` payload bytes plus block padding without keeping them.
    pub fn skip_payload(&mut self, size: u64) -> io::Result<()> {
        self.drain(size.saturating_add(pad(size)))
    }

    /// Keep the first `cap` payload bytes and drain the rest plus padding.
    pub fn read_payload_bounded(&mut self, size: u64, cap: u64) -> io::Result<Vec<u8>> {
        let keep = size.min(cap);
        let mut payload = Vec::new();
        (&mut self.input).take(keep).read_to_end(&mut payload)?;
        if (payload.len() as u64) < keep {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "tar truncated payload",
            ));
        }
        self.drain(size - keep + pad(size))?;
        Ok(payload)
    }

    fn read_meta(&mut self, size: u64) -> io::Result<Vec<u8>> {
        if size > MAX_META_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("tar metadata record too large ({} bytes)", size),
            ));
        }
        self.read_payload_bounded(size, size)
    }

    fn drain(&mut self, mut n: u64) -> io::Result<()> {
        while n > 0 {
            let step = (self.discard.len() as u64).min(n) as usize;
            let got = self.input.read(&mut self.discard[..step])?;
            if got == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "tar truncated payload",
                ));
            }
            n -= got as u64;
        }
        Ok(())
    }
}

fn pad(size: u64) -> u64 {
    let rem = size % BLOCK_LEN as u64;
    if rem == 0 {
        0
    } else {
        BLOCK_LEN as u64 - rem
    }
}

/// Fill `dst` completely, or report a clean EOF if nothing was read.
fn read_exact_or_eof<R: Read>(r: &mut R, dst: &mut [u8]) -> io::Result<bool> {
    let mut off = 0;
    while off < dst.len() {
        let n = match r.read(&mut dst[off..]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            if off == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "tar truncated header",
            ));
        }
        off += n;
    }
    Ok(true)
}

/// Size field: NUL/space padded octal, or GNU base-256 when the high bit is set.
fn parse_size(field: &[u8]) -> io::Result<u64> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidData, "tar size field out of range");

    if field[0] & 0x80 != 0 {
        let mut v: u64 = u64::from(field[0] & 0x7f);
        for &b in &field[1..] {
            v = v
                .checked_mul(256)
                .and_then(|v| v.checked_add(u64::from(b)))
                .ok_or_else(invalid)?;
        }
        return Ok(v);
    }

    parse_octal(field).ok_or_else(invalid)
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let mut i = 0;
    while i < field.len() && (field[i] == 0 || field[i] == b' ') {
        i += 1;
    }
    let mut end = i;
    while end < field.len() && (b'0'..=b'7').contains(&field[end]) {
        end += 1;
    }
    let mut v: u64 = 0;
    for &d in &field[i..end] {
        v = v.checked_mul(8)?.checked_add(u64::from(d - b'0'))?;
    }
    Some(v)
}

fn verify_checksum(header: &[u8; BLOCK_LEN]) -> io::Result<()> {
    let stored = parse_octal(&header[148..156]);
    let unsigned: u64 = header
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { b' ' } else { b })
        .map(u64::from)
        .sum();
    if stored == Some(unsigned) {
        return Ok(());
    }
    // Some old writers summed signed bytes.
    let signed: i64 = header
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { b' ' as i8 } else { b as i8 })
        .map(i64::from)
        .sum();
    if stored.map(|s| s as i64) == Some(signed) {
        return Ok(());
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "tar header checksum mismatch",
    ))
}

fn ustar_name(header: &[u8; BLOCK_LEN]) -> String {
    let name = cstr_lossy(&header[0..100]);
    let is_ustar = &header[USTAR_MAGIC_OFFSET..USTAR_MAGIC_OFFSET + 5] == b"ustar";
    if is_ustar {
        let prefix = cstr_lossy(&header[345..500]);
        if !prefix.is_empty() {
            return format!("{}/{}", prefix.trim_end_matches('/'), name);
        }
    }
    name
}

fn cstr_lossy(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Extract `path=` from PAX extended-header records (`"<len> key=value\n"`).
fn pax_path(records: &[u8]) -> Option<String> {
    let mut rest = records;
    let mut path = None;
    while !rest.is_empty() {
        let space = rest.iter().position(|&b| b == b' ')?;
        let len: usize = std::str::from_utf8(&rest[..space]).ok()?.parse().ok()?;
        if len <= space || len > rest.len() {
            return path;
        }
        let record = &rest[space + 1..len];
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        if let Some(value) = record.strip_prefix(b"path=") {
            path = Some(String::from_utf8_lossy(value).into_owned());
        }
        rest = &rest[len..];
    }
    path
}
