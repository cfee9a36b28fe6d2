//! Index tables that drive the monster export.
//!
//! * `monster.tbl`: one line per sound, `TTTTTTTTname` where the first eight
//!   characters are the hex-encoded 4-byte tag.
//! * `tags.tbl`: one line per sound, the hex-encoded aux bytes (may be empty).
//! * `stream.json`: object mapping sample-bank member names to the prefix
//!   their samples are known by.  Key order is bank priority.
//! * extract map: JSON object mapping an output directory to the member
//!   patterns whose matches are copied, flattened, into it.

use std::fmt;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use thiserror::Error;
use tracing::debug;

use crate::archive::ExtractMap;

/// Width of a table tag in bytes.
pub const TAG_LEN: usize = 4;

pub const MONSTER_TABLE: &str = "monster.tbl";
pub const TAGS_TABLE:    &str = "tags.tbl";
pub const AUDIO_MAP:     &str = "stream.json";

#[derive(Error, Debug)]
pub enum TableError {
    #[error("Failed to load {}: {source}", .path.display())]
    Load { path: PathBuf, source: std::io::Error },
    #[error("{file}:{line}: {reason}")]
    Malformed { file: &'static str, line: usize, reason: String },
    #[error("{file}:{line}: invalid hex: {source}")]
    Hex { file: &'static str, line: usize, source: hex::FromHexError },
    #[error("{} has {monster} lines but {} has {tags}", MONSTER_TABLE, TAGS_TABLE)]
    LineCount { monster: usize, tags: usize },
    #[error("Invalid {}: {source}", .path.display())]
    Json { path: PathBuf, source: serde_json::Error },
}

/// One row of the joined tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub tag:  [u8; TAG_LEN],
    pub aux:  Vec<u8>,
    /// Sample name the row refers to.
    pub name: String,
}

/// Read and join `monster.tbl` and `tags.tbl` from `dir`.
pub fn read_tables<P: AsRef<Path>>(dir: P) -> Result<Vec<TableEntry>, TableError> {
    let dir = dir.as_ref();
    let monster = load(&dir.join(MONSTER_TABLE))?;
    let tags    = load(&dir.join(TAGS_TABLE))?;
    let rows = parse_tables(&monster, &tags)?;
    debug!(dir = %dir.display(), rows = rows.len(), "read index tables");
    Ok(rows)
}

/// Join the text of both tables line by line.
pub fn parse_tables(monster: &str, tags: &str) -> Result<Vec<TableEntry>, TableError> {
    let monster: Vec<&str> = monster.lines().collect();
    let tags:    Vec<&str> = tags.lines().collect();
    if monster.len() != tags.len() {
        return Err(TableError::LineCount { monster: monster.len(), tags: tags.len() });
    }

    monster
        .into_iter()
        .zip(tags)
        .enumerate()
        .map(|(i, (sound, aux))| {
            let line = i + 1;
            let (tag_hex, name) = match (sound.get(..TAG_LEN * 2), sound.get(TAG_LEN * 2..)) {
                (Some(t), Some(n)) => (t, n),
                _ => {
                    return Err(TableError::Malformed {
                        file:   MONSTER_TABLE,
                        line,
                        reason: format!("expected {} hex digits and a name", TAG_LEN * 2),
                    })
                }
            };
            let mut tag = [0u8; TAG_LEN];
            hex::decode_to_slice(tag_hex, &mut tag)
                .map_err(|source| TableError::Hex { file: MONSTER_TABLE, line, source })?;
            let aux = hex::decode(aux.trim_end())
                .map_err(|source| TableError::Hex { file: TAGS_TABLE, line, source })?;
            Ok(TableEntry { tag, aux, name: name.to_owned() })
        })
        .collect()
}

fn load(path: &Path) -> Result<String, TableError> {
    fs::read_to_string(path).map_err(|source| TableError::Load { path: path.to_owned(), source })
}

// ── Audio map ────────────────────────────────────────────────────────────────

/// Sample-bank member → sample-name prefix, in priority order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioMap(Vec<(String, String)>);

impl AudioMap {
    pub fn new(banks: Vec<(String, String)>) -> Self {
        Self(banks)
    }

    /// `(member, prefix)` pairs, highest priority first.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.0.iter().map(|(m, p)| (m.as_str(), p.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for AudioMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = AudioMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object mapping bank names to prefixes")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<AudioMap, A::Error> {
                let mut banks = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((bank, prefix)) = access.next_entry::<String, String>()? {
                    banks.push((bank, prefix));
                }
                Ok(AudioMap(banks))
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

/// Read `stream.json` from `dir`.
pub fn read_audiomap<P: AsRef<Path>>(dir: P) -> Result<AudioMap, TableError> {
    let path = dir.as_ref().join(AUDIO_MAP);
    let file = fs::File::open(&path).map_err(|source| TableError::Load { path: path.clone(), source })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| TableError::Json { path, source })
}

/// Load an extract map (`{"out/dir": ["*.fnt", ...], ...}`) from `path`.
pub fn read_extractmap<P: AsRef<Path>>(path: P) -> Result<ExtractMap, TableError> {
    let path = path.as_ref();
    let file = fs::File::open(path).map_err(|source| TableError::Load { path: path.to_owned(), source })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| TableError::Json { path: path.to_owned(), source })
}
