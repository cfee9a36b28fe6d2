//! Sample banks: named audio streams of a single format.
//!
//! A [`BankDecoder`] turns one bank member of the archive into a
//! [`SampleBank`].  The game's sound banks are loaded in the order given by
//! the audio map and chained into a [`SampleSet`]: a lookup returns the
//! sample from the first bank that has it.  Every bank in a set must carry
//! the same format.
//!
//! Bank names are looked up as `prefix + sample_name`, where the prefix comes
//! from the audio map (`"EN_"` for the speech bank, `""` for effects).

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Seek};
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, warn};

use crate::archive::{Archive, ArchiveError};
use crate::codec::AudioFormat;
use crate::tables::AudioMap;

#[derive(Error, Debug)]
pub enum BankError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("Cannot decode sample bank {bank}: {reason}")]
    Decode { bank: String, reason: String },
    #[error("Sample bank {bank} holds {found} samples, expected {expected}")]
    MixedFormats { bank: String, expected: AudioFormat, found: AudioFormat },
    #[error("No sample banks to load")]
    Empty,
    #[error("IO error on {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
}

// ── SampleBank ───────────────────────────────────────────────────────────────

/// One decoded bank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBank {
    format:  AudioFormat,
    samples: BTreeMap<String, Vec<u8>>,
}

impl SampleBank {
    pub fn new(format: AudioFormat) -> Self {
        Self { format, samples: BTreeMap::new() }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn insert(&mut self, name: impl Into<String>, data: Vec<u8>) -> Option<Vec<u8>> {
        self.samples.insert(name.into(), data)
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.samples.get(name).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.samples.keys().map(String::as_str)
    }

    /// Re-key every sample as `prefix + name`.
    pub fn with_prefix(self, prefix: &str) -> Self {
        if prefix.is_empty() {
            return self;
        }
        let samples = self
            .samples
            .into_iter()
            .map(|(name, data)| (format!("{prefix}{name}"), data))
            .collect();
        Self { format: self.format, samples }
    }
}

// ── Decoders ─────────────────────────────────────────────────────────────────

/// Decodes one sample bank from a byte stream.
pub trait BankDecoder {
    /// `bank` names the stream for diagnostics.
    fn decode(&self, bank: &str, stream: &mut dyn Read) -> Result<SampleBank, BankError>;
}

/// Samples stored as loose `name.<ext>` files in one directory.
#[derive(Debug, Clone)]
pub struct LooseSamples {
    dir: PathBuf,
}

impl LooseSamples {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// Load every `.ogg`, `.flac` or `.mp3` file; other files are ignored.
    /// The sample name is the file stem.
    pub fn load(&self) -> Result<SampleBank, BankError> {
        let io_err = |source| BankError::Io { path: self.dir.clone(), source };

        let mut files: Vec<(PathBuf, AudioFormat)> = fs::read_dir(&self.dir)
            .map_err(io_err)?
            .filter_map(|entry| entry.map(|e| e.path()).ok())
            .filter(|path| path.is_file())
            .filter_map(|path| AudioFormat::from_path(&path).map(|format| (path, format)))
            .collect();
        files.sort();

        let mut bank: Option<SampleBank> = None;
        for (path, format) in files {
            let bank = bank.get_or_insert_with(|| SampleBank::new(format));
            if bank.format() != format {
                return Err(BankError::MixedFormats {
                    bank:     path.display().to_string(),
                    expected: bank.format(),
                    found:    format,
                });
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                warn!(path = %path.display(), "skipping sample with a non UTF-8 name");
                continue;
            };
            let data = fs::read(&path).map_err(|source| BankError::Io { path: path.clone(), source })?;
            bank.insert(name, data);
        }
        let bank = bank.ok_or(BankError::Empty)?;
        debug!(dir = %self.dir.display(), samples = bank.len(), format = %bank.format(), "loaded loose samples");
        Ok(bank)
    }
}

// ── SampleSet ────────────────────────────────────────────────────────────────

/// Banks chained in priority order.
#[derive(Debug, Clone)]
pub struct SampleSet {
    format: AudioFormat,
    banks:  Vec<SampleBank>,
}

impl SampleSet {
    /// Chain `banks`, highest priority first.  Fails if the list is empty or
    /// the formats differ.
    pub fn from_banks(banks: Vec<SampleBank>) -> Result<Self, BankError> {
        let format = banks.first().ok_or(BankError::Empty)?.format();
        if let Some((i, odd)) = banks.iter().enumerate().find(|(_, b)| b.format() != format) {
            return Err(BankError::MixedFormats {
                bank:     format!("#{i}"),
                expected: format,
                found:    odd.format(),
            });
        }
        Ok(Self { format, banks })
    }

    /// Decode every bank named in `audiomap` from the archive and chain them.
    pub fn from_archive<R: Read + Seek>(
        archive: &Archive<R>,
        audiomap: &AudioMap,
        decoder: &dyn BankDecoder,
    ) -> Result<Self, BankError> {
        let mut banks = Vec::with_capacity(audiomap.len());
        let mut format = None;
        for (member, prefix) in audiomap.iter() {
            let mut stream = archive.open_member(member)?;
            let bank = decoder.decode(member, &mut stream)?.with_prefix(prefix);
            match format {
                None => format = Some(bank.format()),
                Some(expected) if expected != bank.format() => {
                    return Err(BankError::MixedFormats {
                        bank: member.to_owned(),
                        expected,
                        found: bank.format(),
                    });
                }
                Some(_) => {}
            }
            debug!(bank = member, prefix, samples = bank.len(), "loaded sample bank");
            banks.push(bank);
        }
        Self::from_banks(banks)
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Sample from the first bank that has `name`.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.banks.iter().find_map(|b| b.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn banks(&self) -> &[SampleBank] {
        &self.banks
    }
}

impl From<SampleBank> for SampleSet {
    fn from(bank: SampleBank) -> Self {
        Self { format: bank.format(), banks: vec![bank] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank(format: AudioFormat, samples: &[(&str, &str)]) -> SampleBank {
        let mut b = SampleBank::new(format);
        for (name, data) in samples {
            b.insert(*name, data.as_bytes().to_vec());
        }
        b
    }

    #[test]
    fn first_bank_wins() {
        let set = SampleSet::from_banks(vec![
            bank(AudioFormat::Mp3, &[("a", "first")]),
            bank(AudioFormat::Mp3, &[("a", "second"), ("b", "only")]),
        ])
        .unwrap();
        assert_eq!(set.get("a").unwrap(), b"first");
        assert_eq!(set.get("b").unwrap(), b"only");
        assert!(!set.contains("c"));
    }

    #[test]
    fn prefix_rekeys_samples() {
        let b = bank(AudioFormat::Ogg, &[("line", "x")]).with_prefix("EN_");
        assert_eq!(b.names().collect::<Vec<_>>(), vec!["EN_line"]);
        assert!(b.get("line").is_none());
    }

    #[test]
    fn mixed_formats_are_rejected() {
        assert!(matches!(
            SampleSet::from_banks(vec![bank(AudioFormat::Ogg, &[]), bank(AudioFormat::Flac, &[])]),
            Err(BankError::MixedFormats { expected: AudioFormat::Ogg, found: AudioFormat::Flac, .. })
        ));
        assert!(matches!(SampleSet::from_banks(Vec::new()), Err(BankError::Empty)));
    }

    #[test]
    fn loose_samples_use_file_stems() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ben_01.mp3"), b"one").unwrap();
        fs::write(dir.path().join("ben_02.mp3"), b"two").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let b = LooseSamples::new(dir.path()).load().unwrap();
        assert_eq!(b.format(), AudioFormat::Mp3);
        assert_eq!(b.len(), 2);
        assert_eq!(b.get("ben_02").unwrap(), b"two");

        fs::write(dir.path().join("ben_03.ogg"), b"three").unwrap();
        assert!(matches!(
            LooseSamples::new(dir.path()).load(),
            Err(BankError::MixedFormats { .. })
        ));
    }
}
