//! Monster export: tables + sample banks → `monster.<ext>`.
//!
//! 1. Each table row is resolved to a sample.  A sample the banks lack may be
//!    rebuilt from another one by a [`Substitution`] (a clip cut out of a
//!    longer recording).
//! 2. Every payload is converted to the target format.
//! 3. The records are written through a [`ContainerBuilder`].

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::archive::Archive;
use crate::bank::{BankDecoder, BankError, SampleSet};
use crate::codec::{convert_all, AudioFormat, CodecError, Transcoder};
use crate::container::{ContainerBuilder, ContainerError};
use crate::io_stream::DEFAULT_BUFFER_SIZE;
use crate::tables::{read_audiomap, read_tables, TableEntry, TableError, TAG_LEN};

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Sample {0} is missing and has no substitution")]
    MissingSample(String),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Bank(#[from] BankError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error("Cannot write {}: {source}", .path.display())]
    Output { path: PathBuf, source: io::Error },
}

// ── Substitutions ────────────────────────────────────────────────────────────

/// Rebuild a missing sample by clipping `source` without re-encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    pub source: String,
    pub start:  Duration,
    pub length: Duration,
}

/// Missing sample name → how to rebuild it.
#[derive(Debug, Clone, Default)]
pub struct Substitutions(HashMap<String, Substitution>);

impl Substitutions {
    /// No substitutions: every sample must be present.
    pub fn none() -> Self {
        Self::default()
    }

    /// Substitutions for samples known to be absent from the shipped banks.
    pub fn builtin() -> Self {
        let mut subs = Self::default();
        subs.insert(
            "ben_OFFICE-LINE2019",
            Substitution {
                source: "ben_BIG-DOOR-LINE2015".to_owned(),
                start:  Duration::from_millis(20),
                length: Duration::from_millis(1200),
            },
        );
        subs
    }

    pub fn insert(&mut self, name: impl Into<String>, sub: Substitution) {
        self.0.insert(name.into(), sub);
    }

    pub fn get(&self, name: &str) -> Option<&Substitution> {
        self.0.get(name)
    }
}

// ── Records ──────────────────────────────────────────────────────────────────

/// One container record, resolved from a table row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRecord {
    pub name:    String,
    pub tag:     [u8; TAG_LEN],
    pub aux:     Vec<u8>,
    pub payload: Vec<u8>,
}

/// Resolve every table row against `samples`.
///
/// A missing (or empty) sample is rebuilt through `subs` using
/// `transcoder.cut`; the substitution source itself must be present.
pub fn collect_records(
    table:      &[TableEntry],
    samples:    &SampleSet,
    subs:       &Substitutions,
    transcoder: &dyn Transcoder,
) -> Result<Vec<ExportRecord>, ExportError> {
    table
        .iter()
        .map(|row| {
            let payload = match samples.get(&row.name) {
                Some(data) if !data.is_empty() => data.to_vec(),
                _ => substitute(&row.name, samples, subs, transcoder)?,
            };
            Ok(ExportRecord { name: row.name.clone(), tag: row.tag, aux: row.aux.clone(), payload })
        })
        .collect()
}

fn is_present(samples: &SampleSet, name: &str) -> bool {
    samples.get(name).is_some_and(|data| !data.is_empty())
}

/// Whether any row of `table` will be rebuilt through a substitution, and so
/// needs a transcoder able to cut even when no conversion happens.
pub fn needs_cut(table: &[TableEntry], samples: &SampleSet, subs: &Substitutions) -> bool {
    table
        .iter()
        .any(|row| !is_present(samples, &row.name) && subs.get(&row.name).is_some())
}

fn substitute(
    name:       &str,
    samples:    &SampleSet,
    subs:       &Substitutions,
    transcoder: &dyn Transcoder,
) -> Result<Vec<u8>, ExportError> {
    let sub = subs.get(name).ok_or_else(|| ExportError::MissingSample(name.to_owned()))?;
    let source = samples
        .get(&sub.source)
        .ok_or_else(|| ExportError::MissingSample(sub.source.clone()))?;
    warn!(sample = name, source = %sub.source, "rebuilding missing sample");
    Ok(transcoder.cut(source, samples.format(), sub.start, sub.length)?)
}

// ── Export ───────────────────────────────────────────────────────────────────

/// Configuration for [`export`].
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Output format; `None` keeps the format of the sample banks.
    pub target:      Option<AudioFormat>,
    pub buffer_size: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self { target: None, buffer_size: DEFAULT_BUFFER_SIZE }
    }
}

/// Pipeline stage reported to the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStage {
    /// Units are records.
    Collecting,
    /// Units are bytes of output.
    Writing,
}

/// Progress callback: `(stage, done, total)`.
pub type StageProgressFn<'a> = dyn FnMut(ExportStage, u64, u64) + 'a;

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub path:    PathBuf,
    pub format:  AudioFormat,
    pub records: usize,
    pub bytes:   u64,
}

/// Build `out_dir/monster.<ext>` from `table` and `samples`.
pub fn export(
    table:      &[TableEntry],
    samples:    &SampleSet,
    subs:       &Substitutions,
    transcoder: &dyn Transcoder,
    opts:       &ExportOptions,
    out_dir:    &Path,
    mut progress: Option<&mut StageProgressFn<'_>>,
) -> Result<ExportSummary, ExportError> {
    let source = samples.format();
    let target = opts.target.unwrap_or(source);
    let path = out_dir.join(format!("monster.{}", target.container_ext()));
    info!(records = table.len(), %source, %target, path = %path.display(), "exporting");

    let records = collect_records(table, samples, subs, transcoder)?;
    let (heads, payloads): (Vec<_>, Vec<_>) = records
        .into_iter()
        .map(|r| ((r.tag, r.aux), r.payload))
        .unzip();
    let payloads = convert_all(transcoder, payloads, source, target)?;

    let mut builder = ContainerBuilder::with_tag_len(TAG_LEN)
        .map_err(ContainerError::from)?
        .buffer_size(opts.buffer_size);
    let total = heads.len() as u64;
    for (i, ((tag, aux), payload)) in heads.into_iter().zip(payloads).enumerate() {
        builder.add(&tag, &aux, &payload)?;
        if let Some(ref mut cb) = progress {
            cb(ExportStage::Collecting, i as u64 + 1, total);
        }
    }
    let records = builder.len();

    let output = File::create(&path).map_err(|source| ExportError::Output { path: path.clone(), source })?;
    let mut fin = builder.finalize(output)?;
    let total = fin.total();
    while let Some(chunk) = fin.next() {
        chunk?;
        if let Some(ref mut cb) = progress {
            cb(ExportStage::Writing, fin.written(), total);
        }
    }
    let bytes = fin.written();
    fin.into_inner()
        .sync_all()
        .map_err(|source| ExportError::Output { path: path.clone(), source })?;

    debug!(path = %path.display(), records, bytes, "monster container written");
    Ok(ExportSummary { path, format: target, records, bytes })
}

/// Full pipeline: read the tables and audio map from `index_dir`, load the
/// sample banks named in the map from `archive`, and export.
pub fn remonster<R: Read + Seek>(
    archive:    &Archive<R>,
    index_dir:  &Path,
    decoder:    &dyn BankDecoder,
    transcoder: &dyn Transcoder,
    opts:       &ExportOptions,
    out_dir:    &Path,
    progress:   Option<&mut StageProgressFn<'_>>,
) -> Result<ExportSummary, ExportError> {
    let table    = read_tables(index_dir)?;
    let audiomap = read_audiomap(index_dir)?;
    let samples  = SampleSet::from_archive(archive, &audiomap, decoder)?;
    export(&table, &samples, &Substitutions::builtin(), transcoder, opts, out_dir, progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::SampleBank;
    use crate::codec::Passthrough;
    use crate::container::read_index;

    /// Cuts by keeping the first `length` milliseconds as bytes.
    struct ByteCutter;

    impl Transcoder for ByteCutter {
        fn name(&self) -> &'static str { "byte-cutter" }

        fn check_available(&self, _: AudioFormat) -> Result<(), CodecError> { Ok(()) }

        fn convert(&self, data: &[u8], _: AudioFormat, _: AudioFormat) -> Result<Vec<u8>, CodecError> {
            Ok(data.to_ascii_uppercase())
        }

        fn cut(&self, data: &[u8], _: AudioFormat, start: Duration, length: Duration) -> Result<Vec<u8>, CodecError> {
            let start = start.as_millis() as usize;
            let end = start + length.as_millis() as usize;
            Ok(data[start.min(data.len())..end.min(data.len())].to_vec())
        }
    }

    fn row(tag: u8, name: &str) -> TableEntry {
        TableEntry { tag: [0, 0, 0, tag], aux: vec![tag], name: name.to_owned() }
    }

    fn samples() -> SampleSet {
        let mut b = SampleBank::new(AudioFormat::Mp3);
        b.insert("a", b"alpha".to_vec());
        b.insert("long", b"0123456789".to_vec());
        b.insert("empty", Vec::new());
        SampleSet::from(b)
    }

    fn subs() -> Substitutions {
        let mut s = Substitutions::none();
        s.insert(
            "clip",
            Substitution { source: "long".into(), start: Duration::from_millis(2), length: Duration::from_millis(3) },
        );
        s
    }

    #[test]
    fn rows_resolve_in_table_order() {
        let recs = collect_records(&[row(2, "long"), row(1, "a")], &samples(), &subs(), &Passthrough).unwrap();
        assert_eq!(recs[0].payload, b"0123456789");
        assert_eq!(recs[1].tag, [0, 0, 0, 1]);
        assert_eq!(recs[1].aux, vec![1]);
    }

    #[test]
    fn missing_samples_use_substitutions() {
        let recs = collect_records(&[row(1, "clip")], &samples(), &subs(), &ByteCutter).unwrap();
        assert_eq!(recs[0].payload, b"234");
    }

    #[test]
    fn missing_without_substitution_is_an_error() {
        let err = collect_records(&[row(1, "nope")], &samples(), &subs(), &ByteCutter);
        assert!(matches!(err, Err(ExportError::MissingSample(n)) if n == "nope"));

        let err = collect_records(&[row(1, "empty")], &samples(), &subs(), &ByteCutter);
        assert!(matches!(err, Err(ExportError::MissingSample(n)) if n == "empty"));
    }

    #[test]
    fn builtin_substitution_covers_the_office_line() {
        let sub = Substitutions::builtin();
        let office = sub.get("ben_OFFICE-LINE2019").unwrap();
        assert_eq!(office.source, "ben_BIG-DOOR-LINE2015");
        assert_eq!(office.length, Duration::from_millis(1200));
    }

    #[test]
    fn export_writes_a_readable_container() {
        let dir = tempfile::tempdir().unwrap();
        let opts = ExportOptions { target: Some(AudioFormat::Ogg), ..Default::default() };
        let mut stages = Vec::new();
        let mut cb = |stage: ExportStage, done: u64, total: u64| stages.push((stage, done, total));

        let summary = export(
            &[row(1, "a"), row(2, "clip")],
            &samples(),
            &subs(),
            &ByteCutter,
            &opts,
            dir.path(),
            Some(&mut cb),
        )
        .unwrap();

        assert_eq!(summary.path, dir.path().join("monster.sog"));
        assert_eq!(summary.records, 2);
        assert_eq!(stages.last().map(|s| s.1), Some(summary.bytes));
        assert_eq!(stages[..2], [(ExportStage::Collecting, 1, 2), (ExportStage::Collecting, 2, 2)]);

        let bytes = std::fs::read(&summary.path).unwrap();
        assert_eq!(bytes.len() as u64, summary.bytes);
        let index = read_index(&bytes[..], TAG_LEN).unwrap();
        assert_eq!(index[1].payload_offset, 1 + 5);
        let start = 4 + 2 * 16;
        assert_eq!(&bytes[start..], b"\x01ALPHA\x02234");
    }

    fn door_samples() -> SampleSet {
        let mut b = SampleBank::new(AudioFormat::Mp3);
        b.insert("ben_BIG-DOOR-LINE2015", vec![7u8; 2000]);
        b.insert("a", b"alpha".to_vec());
        SampleSet::from(b)
    }

    #[test]
    fn needs_cut_only_for_substituted_rows() {
        let subs = Substitutions::builtin();
        assert!(!needs_cut(&[row(1, "a")], &door_samples(), &subs));
        assert!(needs_cut(&[row(1, "a"), row(2, "ben_OFFICE-LINE2019")], &door_samples(), &subs));
        // Missing with no substitution is an error later, not a cut.
        assert!(!needs_cut(&[row(1, "nope")], &door_samples(), &subs));
    }

    #[test]
    fn same_format_export_still_cuts_substituted_rows() {
        let table = [row(1, "ben_OFFICE-LINE2019")];
        let subs = Substitutions::builtin();
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            export(&table, &door_samples(), &subs, &Passthrough, &ExportOptions::default(), dir.path(), None),
            Err(ExportError::Codec(CodecError::Unsupported { .. }))
        ));

        let summary =
            export(&table, &door_samples(), &subs, &ByteCutter, &ExportOptions::default(), dir.path(), None)
                .unwrap();
        assert_eq!(summary.format, AudioFormat::Mp3);
        assert_eq!(summary.path, dir.path().join("monster.so3"));
        let bytes = std::fs::read(&summary.path).unwrap();
        let index = read_index(&bytes[..], TAG_LEN).unwrap();
        assert_eq!(index[0].payload_len, 1200);
    }
}
