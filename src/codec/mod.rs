//! Audio formats and the transcoding boundary.
//!
//! # Formats
//! Sample banks carry Ogg Vorbis, FLAC or MP3 streams.  Each format has a
//! fixed container extension used for the exported monster file:
//!
//! | format | muxer  | container |
//! |--------|--------|-----------|
//! | Ogg    | `ogg`  | `.sog`    |
//! | Flac   | `flac` | `.sof`    |
//! | Mp3    | `mp3`  | `.so3`    |
//!
//! # Transcoders
//! Conversion is delegated to a [`Transcoder`].  [`Ffmpeg`] drives an
//! external `ffmpeg` through pipes; [`Passthrough`] only accepts identity
//! conversions.  Availability is checked once, before any stream is
//! converted.  A missing tool fails immediately; there is no silent
//! fallback to another format.

use std::ffi::OsStr;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};

// ── AudioFormat ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AudioFormat {
    Ogg,
    Flac,
    Mp3,
}

impl AudioFormat {
    pub const ALL: [AudioFormat; 3] = [AudioFormat::Ogg, AudioFormat::Flac, AudioFormat::Mp3];

    /// Short name, also the ffmpeg muxer name.
    pub fn name(self) -> &'static str {
        match self {
            AudioFormat::Ogg  => "ogg",
            AudioFormat::Flac => "flac",
            AudioFormat::Mp3  => "mp3",
        }
    }

    /// Extension of the exported container.
    pub fn container_ext(self) -> &'static str {
        match self {
            AudioFormat::Ogg  => "sog",
            AudioFormat::Flac => "sof",
            AudioFormat::Mp3  => "so3",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ogg"  => Some(AudioFormat::Ogg),
            "flac" => Some(AudioFormat::Flac),
            "mp3"  => Some(AudioFormat::Mp3),
            _      => None,
        }
    }

    /// Format of a loose sample file, from its extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension().and_then(OsStr::to_str).and_then(Self::from_name)
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AudioFormat {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| CodecError::UnsupportedFormat(s.to_owned()))
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unsupported audio format: {0} (available: ogg|flac|mp3)")]
    UnsupportedFormat(String),
    /// The external tool is missing or cannot produce the requested format.
    /// Raised before any conversion starts.
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },
    #[error("{transcoder} cannot {op} {from} -> {to}")]
    Unsupported { transcoder: &'static str, op: &'static str, from: AudioFormat, to: AudioFormat },
    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailed { tool: String, status: String, stderr: String },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Transcoder trait ─────────────────────────────────────────────────────────

pub trait Transcoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fail unless this transcoder can produce `target`.
    fn check_available(&self, target: AudioFormat) -> Result<(), CodecError>;

    fn convert(&self, data: &[u8], from: AudioFormat, to: AudioFormat) -> Result<Vec<u8>, CodecError>;

    /// Copy `length` of audio starting at `start` without re-encoding.
    fn cut(
        &self,
        _data: &[u8],
        format: AudioFormat,
        _start: Duration,
        _length: Duration,
    ) -> Result<Vec<u8>, CodecError> {
        Err(CodecError::Unsupported { transcoder: self.name(), op: "cut", from: format, to: format })
    }
}

/// Identity transcoder.  Any actual conversion is refused.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Transcoder for Passthrough {
    fn name(&self) -> &'static str { "passthrough" }

    fn check_available(&self, _: AudioFormat) -> Result<(), CodecError> { Ok(()) }

    fn convert(&self, data: &[u8], from: AudioFormat, to: AudioFormat) -> Result<Vec<u8>, CodecError> {
        if from != to {
            return Err(CodecError::Unsupported { transcoder: self.name(), op: "convert", from, to });
        }
        Ok(data.to_vec())
    }
}

// ── Ffmpeg ───────────────────────────────────────────────────────────────────

/// Transcoder backed by an `ffmpeg` executable.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    program: PathBuf,
}

impl Ffmpeg {
    /// Find `ffmpeg` on `PATH`.
    pub fn locate() -> Result<Self, CodecError> {
        let path = std::env::var_os("PATH").unwrap_or_default();
        std::env::split_paths(&path)
            .flat_map(|dir| executable_names().map(move |exe| dir.join(exe)))
            .find(|candidate| candidate.is_file())
            .map(|program| {
                debug!(program = %program.display(), "found ffmpeg");
                Self { program }
            })
            .ok_or_else(|| CodecError::ToolUnavailable {
                tool:   "ffmpeg".to_owned(),
                reason: "not found in PATH".to_owned(),
            })
    }

    /// Use a specific executable.
    pub fn with_program<P: Into<PathBuf>>(program: P) -> Self {
        Self { program: program.into() }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn tool(&self) -> String {
        self.program.display().to_string()
    }

    /// Run ffmpeg with `args`, feeding `input` on stdin and collecting stdout.
    fn run(&self, args: &[&str], input: &[u8]) -> Result<Vec<u8>, CodecError> {
        trace!(program = %self.program.display(), ?args, input_len = input.len(), "running ffmpeg");
        let mut child = Command::new(&self.program)
            .args(["-hide_banner", "-loglevel", "error"])
            .args(args)
            .stdin(if input.is_empty() { Stdio::null() } else { Stdio::piped() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CodecError::ToolUnavailable { tool: self.tool(), reason: e.to_string() })?;

        // stdin is fed on its own thread while stdout is drained here.
        let stdin = child.stdin.take();
        let (fed, output) = std::thread::scope(|s| {
            let feeder = s.spawn(move || match stdin {
                Some(mut pipe) => pipe.write_all(input),
                None => Ok(()),
            });
            let output = child.wait_with_output();
            (feeder.join(), output)
        });
        let output = output?;

        if !output.status.success() {
            return Err(CodecError::ToolFailed {
                tool:   self.tool(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        match fed {
            Ok(Err(e)) if e.kind() != io::ErrorKind::BrokenPipe => return Err(e.into()),
            _ => {}
        }
        Ok(output.stdout)
    }
}

#[cfg(windows)]
fn executable_names() -> impl Iterator<Item = &'static str> {
    ["ffmpeg.exe", "ffmpeg"].into_iter()
}

#[cfg(not(windows))]
fn executable_names() -> impl Iterator<Item = &'static str> {
    ["ffmpeg"].into_iter()
}

fn seconds(d: Duration) -> String {
    format!("{:.3}", d.as_secs_f64())
}

impl Transcoder for Ffmpeg {
    fn name(&self) -> &'static str { "ffmpeg" }

    /// Encode zero seconds of silence into `target`.  Fails if the binary
    /// cannot be started or lacks an encoder for the format.
    fn check_available(&self, target: AudioFormat) -> Result<(), CodecError> {
        self.run(
            &["-f", "lavfi", "-i", "anullsrc", "-t", "0", "-f", target.name(), "pipe:1"],
            &[],
        )
        .map_err(|e| match e {
            CodecError::ToolFailed { tool, stderr, .. } => CodecError::ToolUnavailable {
                tool,
                reason: format!("cannot encode {target}: {stderr}"),
            },
            other => other,
        })?;
        debug!(%target, "ffmpeg can encode");
        Ok(())
    }

    fn convert(&self, data: &[u8], from: AudioFormat, to: AudioFormat) -> Result<Vec<u8>, CodecError> {
        if from == to {
            return Ok(data.to_vec());
        }
        self.run(&["-f", from.name(), "-i", "pipe:0", "-f", to.name(), "pipe:1"], data)
    }

    fn cut(
        &self,
        data: &[u8],
        format: AudioFormat,
        start: Duration,
        length: Duration,
    ) -> Result<Vec<u8>, CodecError> {
        let (start, length) = (seconds(start), seconds(length));
        self.run(
            &[
                "-f", format.name(), "-i", "pipe:0",
                "-ss", &start, "-t", &length,
                "-c", "copy", "-f", format.name(), "pipe:1",
            ],
            data,
        )
    }
}

// ── Batch conversion ─────────────────────────────────────────────────────────

/// Convert every stream from `from` to `to`, preserving order.
///
/// Identity conversions return the input untouched without consulting the
/// transcoder.  Otherwise availability is checked once up front, then the
/// streams are converted (in parallel with the `parallel` feature).  The
/// first error is returned.
pub fn convert_all(
    transcoder: &dyn Transcoder,
    streams:    Vec<Vec<u8>>,
    from:       AudioFormat,
    to:         AudioFormat,
) -> Result<Vec<Vec<u8>>, CodecError> {
    if from == to {
        return Ok(streams);
    }
    transcoder.check_available(to)?;
    debug!(count = streams.len(), %from, %to, transcoder = transcoder.name(), "converting streams");

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;

        let results: Vec<Result<Vec<u8>, CodecError>> = streams
            .par_iter()
            .map(|s| transcoder.convert(s, from, to))
            .collect();

        let mut out = Vec::with_capacity(results.len());
        for r in results {
            out.push(r?);
        }
        Ok(out)
    }

    #[cfg(not(feature = "parallel"))]
    {
        streams.iter().map(|s| transcoder.convert(s, from, to)).collect()
    }
}
