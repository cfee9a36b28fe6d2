//! High-level [`Archive`] API: the read-only face of an LPAK file.
//!
//! ```no_run
//! use lpak::archive::Archive;
//! use std::io::Read;
//!
//! let ar = Archive::open("tenta.cle")?;
//! for name in ar.iglob("*.fsb")?.iter() {
//!     let mut member = ar.open_member(name)?;
//!     let mut head = [0u8; 4];
//!     member.read_exact(&mut head)?;
//!     println!("{name}: {:?}", head);
//! }
//! ar.extract_all("out", "*.txt")?;
//! ar.close();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Member streams borrow the archive.  Every stream must be dropped before
//! [`Archive::close`] can be called, and nothing can be opened afterwards.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::header::{ArchiveHeader, FormatError, Version};
use crate::index::{ArchiveIndex, Entry};
use crate::io_stream::{copy_buffered, ProgressFn, WindowedStream, DEFAULT_BUFFER_SIZE};
use crate::path::{escapes_root, normalize, MemberPattern, PatternError, SEP};

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Malformed archive: {0}")]
    Format(#[from] FormatError),
    #[error("No such member: {0}")]
    NoSuchMember(String),
    #[error(transparent)]
    InvalidPattern(#[from] PatternError),
    #[error("Refusing to extract {0:?} outside the destination directory")]
    UnsafePath(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── ExtractOptions ───────────────────────────────────────────────────────────

/// Configuration for [`Archive::extract_all_with`].
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Copy buffer size per member.
    pub buffer_size: usize,
    /// Stop at the first failing member instead of recording it and moving on.
    pub fail_fast:   bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self { buffer_size: DEFAULT_BUFFER_SIZE, fail_fast: false }
    }
}

impl ExtractOptions {
    /// Set the copy buffer in KiB.  Zero is raised to one; huge values
    /// saturate.
    pub fn buffer_kib(mut self, kib: usize) -> Self {
        self.buffer_size = kib.max(1).saturating_mul(1024);
        self
    }
}

/// Output directory → member patterns, for [`Archive::extract_map`].
pub type ExtractMap = BTreeMap<PathBuf, Vec<String>>;

/// Outcome of a bulk extraction.
#[derive(Debug, Default)]
pub struct ExtractReport {
    /// Members written, in index order.
    pub extracted: Vec<String>,
    /// Members that could not be written, with the reason.
    pub failed:    Vec<(String, ArchiveError)>,
    pub bytes:     u64,
}

impl ExtractReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

// ── Glob ─────────────────────────────────────────────────────────────────────

/// Member names matching a pattern.  Iterating never touches the source and
/// can be repeated; each pass yields names in index order.
#[derive(Debug, Clone)]
pub struct Glob<'a> {
    index:   &'a ArchiveIndex,
    pattern: MemberPattern,
}

impl<'a> Glob<'a> {
    pub fn pattern(&self) -> &MemberPattern {
        &self.pattern
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a str> + '_ {
        let index: &'a ArchiveIndex = self.index;
        index.names().filter(move |name| self.pattern.matches(name))
    }
}

impl<'g, 'a> IntoIterator for &'g Glob<'a> {
    type Item = &'a str;
    type IntoIter = Box<dyn Iterator<Item = &'a str> + 'g>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

// ── Archive ──────────────────────────────────────────────────────────────────

pub struct Archive<R = File> {
    source: Mutex<R>,
    header: ArchiveHeader,
    index:  ArchiveIndex,
    path:   Option<PathBuf>,
}

impl Archive<File> {
    /// Open and fully index the archive at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ArchiveError> {
        let path = path.as_ref().to_owned();
        let mut archive = Self::from_reader(File::open(&path)?)?;
        debug!(path = %path.display(), members = archive.len(), "opened archive");
        archive.path = Some(path);
        Ok(archive)
    }
}

impl<R: Read + Seek> Archive<R> {
    /// Index an archive held by any seekable source.  Either the whole
    /// header and index are valid or nothing is returned.
    pub fn from_reader(mut reader: R) -> Result<Self, ArchiveError> {
        let header = ArchiveHeader::read(&mut reader)?;
        let source = Mutex::new(reader);
        let index  = ArchiveIndex::read(&source, &header)?;
        Ok(Self { source, header, index, path: None })
    }

    // ── Lookup ───────────────────────────────────────────────────────────────

    pub fn entry(&self, name: &str) -> Result<&Entry, ArchiveError> {
        self.index.get(name).ok_or_else(|| ArchiveError::NoSuchMember(name.to_owned()))
    }

    /// Open a member as an independent, seekable byte stream.
    ///
    /// The window starts at `data_offset` within the data section and spans
    /// `decompressed_size` bytes, clamped to the data section.
    pub fn open_member(&self, name: &str) -> Result<WindowedStream<'_, R>, ArchiveError> {
        let entry = self.entry(name)?;
        Ok(self.window(entry))
    }

    /// Open a member for line-oriented text reading.
    pub fn open_text(&self, name: &str) -> Result<BufReader<WindowedStream<'_, R>>, ArchiveError> {
        Ok(BufReader::new(self.open_member(name)?))
    }

    /// Read a whole member into memory.
    pub fn read(&self, name: &str) -> Result<Vec<u8>, ArchiveError> {
        Ok(self.open_member(name)?.read_remaining()?)
    }

    /// Read a whole member as UTF-8 text.
    pub fn read_to_string(&self, name: &str) -> Result<String, ArchiveError> {
        let mut out = String::new();
        self.open_member(name)?.read_to_string(&mut out)?;
        Ok(out)
    }

    /// Copy a member into `writer` through a bounded buffer.
    pub fn copy_member<W: Write>(&self, name: &str, writer: W) -> Result<u64, ArchiveError> {
        let member = self.open_member(name)?;
        let size = member.size();
        Ok(copy_buffered(member, writer, DEFAULT_BUFFER_SIZE, size, None)?)
    }

    fn window(&self, entry: &Entry) -> WindowedStream<'_, R> {
        let data = self.index.data();
        WindowedStream::new(&self.source, data.offset, data.size)
            .sub_window(entry.data_offset, u64::from(entry.decompressed_size))
    }

    // ── Enumeration ──────────────────────────────────────────────────────────

    /// Member names matching `pattern` (`Path.match` rules: relative patterns
    /// match trailing components, `*` matches every member).
    pub fn iglob(&self, pattern: &str) -> Result<Glob<'_>, ArchiveError> {
        Ok(Glob { index: &self.index, pattern: MemberPattern::new(pattern)? })
    }

    /// Member names under `prefix`.  An empty or root prefix lists every
    /// member.
    pub fn listdir(&self, prefix: &str) -> Vec<String> {
        let prefix = normalize(prefix);
        if prefix.is_empty() {
            return self.index.names().map(str::to_owned).collect();
        }
        let prefix = format!("{prefix}/");
        self.index
            .names()
            .filter(|name| name.starts_with(&prefix))
            .map(str::to_owned)
            .collect()
    }

    /// Every member with a fresh stream, in index order.
    pub fn members(&self) -> impl Iterator<Item = (&str, WindowedStream<'_, R>)> + '_ {
        self.index.iter().map(move |(name, entry)| (name, self.window(entry)))
    }

    // ── Extraction ───────────────────────────────────────────────────────────

    /// Extract every member matching `pattern` below `dest` with default
    /// options.
    pub fn extract_all<P: AsRef<Path>>(
        &self,
        dest: P,
        pattern: &str,
    ) -> Result<ExtractReport, ArchiveError> {
        self.extract_all_with(dest, pattern, &ExtractOptions::default(), None)
    }

    /// Extract every member matching `pattern` below `dest`.
    ///
    /// Parent directories are created as needed.  A member that fails (I/O
    /// error, or a name resolving outside `dest`) is recorded in the report
    /// and skipped, unless `opts.fail_fast` is set.  `progress` receives
    /// `(members_done, members_total)`.
    pub fn extract_all_with<P: AsRef<Path>>(
        &self,
        dest: P,
        pattern: &str,
        opts: &ExtractOptions,
        mut progress: Option<&mut ProgressFn<'_>>,
    ) -> Result<ExtractReport, ArchiveError> {
        let dest = dest.as_ref();
        let glob = self.iglob(pattern)?;
        let names: Vec<&str> = glob.iter().collect();
        let total = names.len() as u64;

        let mut report = ExtractReport::default();
        for (done, name) in names.into_iter().enumerate() {
            match self.extract_member(dest, name, opts.buffer_size) {
                Ok(n) => {
                    report.bytes += n;
                    report.extracted.push(name.to_owned());
                }
                Err(e) if opts.fail_fast => return Err(e),
                Err(e) => {
                    warn!(member = name, error = %e, "skipping member");
                    report.failed.push((name.to_owned(), e));
                }
            }
            if let Some(ref mut cb) = progress {
                cb(done as u64 + 1, total);
            }
        }
        debug!(
            dest = %dest.display(),
            extracted = report.extracted.len(),
            failed = report.failed.len(),
            bytes = report.bytes,
            "extraction finished"
        );
        Ok(report)
    }

    fn extract_member(&self, dest: &Path, name: &str, buffer_size: usize) -> Result<u64, ArchiveError> {
        if name.is_empty() || escapes_root(name) {
            return Err(ArchiveError::UnsafePath(name.to_owned()));
        }
        self.write_member(name, &dest.join(name), buffer_size, None)
    }

    /// Extract members into flat output directories.
    ///
    /// For each directory in `map`, every member matching any of its patterns
    /// is written once, as `dir/<basename>`.  Members sharing a basename
    /// overwrite each other in index order.  `progress` receives
    /// `(bytes_done, bytes_total)`; the total is the summed size of every
    /// selected member.
    pub fn extract_map(
        &self,
        map: &ExtractMap,
        opts: &ExtractOptions,
        mut progress: Option<&mut ProgressFn<'_>>,
    ) -> Result<ExtractReport, ArchiveError> {
        let mut plan: Vec<(&Path, Vec<&str>)> = Vec::with_capacity(map.len());
        for (dir, patterns) in map {
            let patterns = patterns
                .iter()
                .map(|p| MemberPattern::new(p))
                .collect::<Result<Vec<_>, _>>()?;
            let names = self
                .index
                .names()
                .filter(|name| patterns.iter().any(|p| p.matches(name)))
                .collect();
            plan.push((dir.as_path(), names));
        }
        let total: u64 = plan
            .iter()
            .flat_map(|(_, names)| names)
            .filter_map(|name| self.index.get(name))
            .map(|e| u64::from(e.decompressed_size))
            .sum();
        debug!(dirs = plan.len(), bytes = total, "extracting by map");

        let mut report = ExtractReport::default();
        for (dir, names) in plan {
            for name in names {
                let base = report.bytes;
                let result = match progress.as_deref_mut() {
                    Some(cb) => {
                        let mut member_cb = |done: u64, _: u64| cb(base + done, total);
                        self.extract_flat(dir, name, opts.buffer_size, Some(&mut member_cb))
                    }
                    None => self.extract_flat(dir, name, opts.buffer_size, None),
                };
                match result {
                    Ok(n) => {
                        report.bytes += n;
                        report.extracted.push(name.to_owned());
                    }
                    Err(e) if opts.fail_fast => return Err(e),
                    Err(e) => {
                        warn!(member = name, dir = %dir.display(), error = %e, "skipping member");
                        report.failed.push((name.to_owned(), e));
                    }
                }
            }
        }
        Ok(report)
    }

    fn extract_flat(
        &self,
        dir: &Path,
        name: &str,
        buffer_size: usize,
        progress: Option<&mut ProgressFn<'_>>,
    ) -> Result<u64, ArchiveError> {
        let base = name.rsplit(SEP).next().unwrap_or_default();
        if base.is_empty() || escapes_root(base) {
            return Err(ArchiveError::UnsafePath(name.to_owned()));
        }
        fs::create_dir_all(dir)?;
        self.write_member(name, &dir.join(base), buffer_size, progress)
    }

    fn write_member(
        &self,
        name: &str,
        target: &Path,
        buffer_size: usize,
        progress: Option<&mut ProgressFn<'_>>,
    ) -> Result<u64, ArchiveError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let member = self.open_member(name)?;
        let size = member.size();
        let out = File::create(target)?;
        Ok(copy_buffered(member, out, buffer_size, size, progress)?)
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    pub fn version(&self) -> Version {
        self.header.version
    }

    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    pub fn index(&self) -> &ArchiveIndex {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Path the archive was opened from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Release the source and hand it back.
    pub fn into_inner(self) -> R {
        self.source.into_inner()
    }

    /// Release the source.
    pub fn close(self) {
        debug!(path = ?self.path, "closing archive");
        drop(self.into_inner());
    }
}
