//! Windowed access to a shared seekable source, and bounded buffered copies.
//!
//! # Windows
//! A [`WindowedStream`] exposes `[start, start + size)` of an underlying
//! source as if it were a standalone stream: its cursor is relative to the
//! window, `SeekFrom::End` is relative to the end of the window, and reads
//! stop at the window boundary.  Many windows may share one source.  Every
//! read locks the source, repositions it to `start + cursor`, reads, and
//! unlocks, so interleaved reads from different windows never observe each
//! other's position.
//!
//! # Copies
//! [`CopyChunks`] is a pull-based copy: each call to `next()` moves at most
//! one buffer of data from a reader to a writer and yields the number of
//! bytes moved.  `None` is the completion signal.  Dropping the iterator
//! early abandons the copy and releases both ends.

use std::io::{self, Read, Seek, SeekFrom, Write};

use parking_lot::Mutex;
use tracing::trace;

/// Default buffer for member extraction and container finalisation: 64 KiB.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Progress callback: `(bytes_done, bytes_total)`.  `bytes_total` is 0 when
/// unknown.
pub type ProgressFn<'a> = dyn FnMut(u64, u64) + 'a;

// ── WindowedStream ───────────────────────────────────────────────────────────

/// A bounded, independently positioned view over a shared source.
///
/// Invariant: `0 <= tell() <= size()`.
pub struct WindowedStream<'a, R> {
    source: &'a Mutex<R>,
    start:  u64,
    size:   u64,
    pos:    u64,
}

impl<'a, R> Clone for WindowedStream<'a, R> {
    fn clone(&self) -> Self {
        Self { source: self.source, start: self.start, size: self.size, pos: self.pos }
    }
}

impl<'a, R> std::fmt::Debug for WindowedStream<'a, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowedStream")
            .field("start", &self.start)
            .field("size", &self.size)
            .field("pos", &self.pos)
            .finish()
    }
}

impl<'a, R: Read + Seek> WindowedStream<'a, R> {
    pub fn new(source: &'a Mutex<R>, start: u64, size: u64) -> Self {
        Self { source, start, size, pos: 0 }
    }

    /// Absolute offset of the first byte of the window in the source.
    pub fn start(&self) -> u64 { self.start }

    pub fn size(&self) -> u64 { self.size }

    /// Window-relative cursor.
    pub fn tell(&self) -> u64 { self.pos }

    pub fn remaining(&self) -> u64 { self.size - self.pos }

    /// Carve a nested window at `offset` (relative to this window).  The
    /// child never extends past the parent's end.
    pub fn sub_window(&self, offset: u64, size: u64) -> WindowedStream<'a, R> {
        let offset = offset.min(self.size);
        let size   = size.min(self.size - offset);
        WindowedStream::new(self.source, self.start + offset, size)
    }

    /// Read everything from the cursor to the end of the window.
    pub fn read_remaining(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(usize::try_from(self.remaining()).unwrap_or(0));
        self.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl<'a, R: Read + Seek> Read for WindowedStream<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.size - self.pos;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));

        let mut source = self.source.lock();
        source.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = source.read(&mut buf[..want])?;
        drop(source);

        trace!(start = self.start, pos = self.pos, n, "window read");
        self.pos += n as u64;
        Ok(n)
    }
}

impl<'a, R: Read + Seek> Seek for WindowedStream<'a, R> {
    /// Seeking before the start of the window is an error; seeking past the
    /// end clamps to the end.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target: i128 = match pos {
            SeekFrom::Start(n)   => i128::from(n),
            SeekFrom::End(d)     => i128::from(self.size) + i128::from(d),
            SeekFrom::Current(d) => i128::from(self.pos) + i128::from(d),
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative position",
            ));
        }
        self.pos = target.min(i128::from(self.size)) as u64;
        Ok(self.pos)
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.pos)
    }
}

// ── Buffered copy ────────────────────────────────────────────────────────────

/// Pull-based bounded copy from `R` to `W`.
pub struct CopyChunks<R, W> {
    reader: R,
    writer: W,
    buf:    Vec<u8>,
    done:   bool,
}

impl<R: Read, W: Write> CopyChunks<R, W> {
    pub fn new(reader: R, writer: W, buffer_size: usize) -> Self {
        Self { reader, writer, buf: vec![0u8; buffer_size.max(1)], done: false }
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

impl<R: Read, W: Write> Iterator for CopyChunks<R, W> {
    type Item = io::Result<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.reader.read(&mut self.buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(n) => {
                    if let Err(e) = self.writer.write_all(&self.buf[..n]) {
                        self.done = true;
                        return Some(Err(e));
                    }
                    return Some(Ok(n));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Copy all of `reader` into `writer` through a buffer of `buffer_size`
/// bytes, reporting progress after each chunk.  Returns bytes copied.
pub fn copy_buffered<R: Read, W: Write>(
    reader:      R,
    writer:      W,
    buffer_size: usize,
    total_hint:  u64,
    mut progress: Option<&mut ProgressFn<'_>>,
) -> io::Result<u64> {
    let mut copied = 0u64;
    for chunk in CopyChunks::new(reader, writer, buffer_size) {
        copied += chunk? as u64;
        if let Some(ref mut cb) = progress {
            cb(copied, total_hint);
        }
    }
    Ok(copied)
}
