//! LPAK prologue: magic tag, format version and the four section cues.
//!
//! # Layout
//! ```text
//! 0   magic     "KAPL" (the tag "LPAK" stored byte-reversed)
//! 4   version   f32 LE, exactly 1.0 or 1.5
//! 8   offsets   4 × u32 LE
//! 24  sizes     4 × u32 LE
//! 40  (1.5 only) 8 reserved bytes
//! ```
//! The two arrays are zipped into four cues.  Version 1.0 stores them in
//! role order offset-table, entry-table, name-table, data.  Version 1.5
//! stores entry-table first and swaps the first two sizes; its data size is
//! not stored and is derived from the physical file size.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Read, Seek, SeekFrom};
use thiserror::Error;
use tracing::debug;

/// Magic tag as it appears on disk.
pub const MAGIC: &[u8; 4] = b"KAPL";

/// Bytes skipped between the cue arrays and the first section in 1.5 files.
const V15_RESERVED: i64 = 8;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Invalid magic tag {0:?}, expected {:?}", MAGIC)]
    BadMagic([u8; 4]),
    #[error("Unsupported archive version: {0}")]
    UnsupportedVersion(f32),
    #[error("{role} section expected at offset {expected}, stream is at {actual}")]
    CueMismatch { role: SectionRole, expected: u64, actual: u64 },
    #[error("{role} section size {size} is not a multiple of its {record}-byte record")]
    MisalignedSection { role: SectionRole, size: u64, record: u64 },
    #[error("Name table has {names} names but entry table has {entries} entries")]
    CountMismatch { names: usize, entries: usize },
    #[error("Member name #{index} is not valid UTF-8")]
    InvalidName { index: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Version ──────────────────────────────────────────────────────────────────

/// Supported archive versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V1_0,
    V1_5,
}

impl Version {
    pub fn from_f32(v: f32) -> Result<Self, FormatError> {
        if v == 1.0 {
            Ok(Version::V1_0)
        } else if v == 1.5 {
            Ok(Version::V1_5)
        } else {
            Err(FormatError::UnsupportedVersion(v))
        }
    }

    pub fn as_f32(self) -> f32 {
        match self {
            Version::V1_0 => 1.0,
            Version::V1_5 => 1.5,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.1}", self.as_f32())
    }
}

// ── Cues ─────────────────────────────────────────────────────────────────────

/// Logical role of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionRole {
    OffsetTable,
    EntryTable,
    NameTable,
    Data,
}

impl std::fmt::Display for SectionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SectionRole::OffsetTable => "offset table",
            SectionRole::EntryTable  => "entry table",
            SectionRole::NameTable   => "name table",
            SectionRole::Data        => "data",
        })
    }
}

/// Location of one section in the physical file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cue {
    pub offset: u64,
    pub size:   u64,
}

impl Cue {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

// ── Header ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ArchiveHeader {
    pub version:      Version,
    pub offset_table: Cue,
    pub entry_table:  Cue,
    pub name_table:   Cue,
    pub data:         Cue,
    /// Stream position right after the prologue.
    pub header_end:   u64,
}

impl ArchiveHeader {
    /// Parse the prologue from the start of `reader`.  Leaves the reader
    /// positioned at `header_end`.
    pub fn read<R: Read + Seek>(mut reader: R) -> Result<Self, FormatError> {
        let file_size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(FormatError::BadMagic(magic));
        }
        let version = Version::from_f32(reader.read_f32::<LittleEndian>()?)?;

        let offsets = read_u32_x4(&mut reader)?;
        let sizes   = read_u32_x4(&mut reader)?;

        let header = match version {
            Version::V1_0 => Self {
                version,
                offset_table: cue(offsets[0], sizes[0]),
                entry_table:  cue(offsets[1], sizes[1]),
                name_table:   cue(offsets[2], sizes[2]),
                data:         cue(offsets[3], sizes[3]),
                header_end:   reader.stream_position()?,
            },
            Version::V1_5 => {
                reader.seek(SeekFrom::Current(V15_RESERVED))?;
                Self {
                    version,
                    entry_table:  cue(offsets[0], sizes[1]),
                    offset_table: cue(offsets[1], sizes[0]),
                    name_table:   cue(offsets[2], sizes[2]),
                    data: Cue {
                        offset: u64::from(offsets[3]),
                        size:   file_size.saturating_sub(u64::from(offsets[0])),
                    },
                    header_end: reader.stream_position()?,
                }
            }
        };

        debug!(
            version = %header.version,
            file_size,
            offset_table = ?header.offset_table,
            entry_table = ?header.entry_table,
            name_table = ?header.name_table,
            data = ?header.data,
            "parsed archive header"
        );
        Ok(header)
    }

    /// Sections in the order they are laid out and read for this version.
    pub fn sections(&self) -> [(SectionRole, Cue); 4] {
        match self.version {
            Version::V1_0 => [
                (SectionRole::OffsetTable, self.offset_table),
                (SectionRole::EntryTable,  self.entry_table),
                (SectionRole::NameTable,   self.name_table),
                (SectionRole::Data,        self.data),
            ],
            Version::V1_5 => [
                (SectionRole::EntryTable,  self.entry_table),
                (SectionRole::OffsetTable, self.offset_table),
                (SectionRole::NameTable,   self.name_table),
                (SectionRole::Data,        self.data),
            ],
        }
    }
}

fn cue(offset: u32, size: u32) -> Cue {
    Cue { offset: u64::from(offset), size: u64::from(size) }
}

fn read_u32_x4<R: Read>(reader: &mut R) -> io::Result<[u32; 4]> {
    let mut out = [0u32; 4];
    reader.read_u32_into::<LittleEndian>(&mut out)?;
    Ok(out)
}

/// Fail unless the stream is exactly at the start of the next section.
pub(crate) fn expect_position(role: SectionRole, cue: Cue, actual: u64) -> Result<(), FormatError> {
    if actual != cue.offset {
        return Err(FormatError::CueMismatch { role, expected: cue.offset, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::{Cursor, Write};

    fn prologue(version: f32, offsets: [u32; 4], sizes: [u32; 4]) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_all(MAGIC).unwrap();
        out.write_f32::<LittleEndian>(version).unwrap();
        for v in offsets.iter().chain(sizes.iter()) {
            out.write_u32::<LittleEndian>(*v).unwrap();
        }
        out
    }

    #[test]
    fn v10_cues_zip_offsets_with_sizes() {
        let bytes = prologue(1.0, [40, 44, 64, 70], [4, 20, 6, 5]);
        let h = ArchiveHeader::read(Cursor::new(bytes)).unwrap();
        assert_eq!(h.version, Version::V1_0);
        assert_eq!(h.offset_table, Cue { offset: 40, size: 4 });
        assert_eq!(h.entry_table,  Cue { offset: 44, size: 20 });
        assert_eq!(h.name_table,   Cue { offset: 64, size: 6 });
        assert_eq!(h.data,         Cue { offset: 70, size: 5 });
        assert_eq!(h.header_end, 40);
    }

    #[test]
    fn v15_reassigns_roles_and_derives_data_size() {
        let mut bytes = prologue(1.5, [48, 72, 76, 82], [4, 24, 6, 999]);
        bytes.extend_from_slice(&[0u8; 8]);
        bytes.resize(100, 0);
        let h = ArchiveHeader::read(Cursor::new(bytes)).unwrap();
        assert_eq!(h.version, Version::V1_5);
        assert_eq!(h.entry_table,  Cue { offset: 48, size: 24 });
        assert_eq!(h.offset_table, Cue { offset: 72, size: 4 });
        assert_eq!(h.name_table,   Cue { offset: 76, size: 6 });
        assert_eq!(h.data,         Cue { offset: 82, size: 100 - 48 });
        assert_eq!(h.header_end, 48);
        assert_eq!(h.sections()[0].0, SectionRole::EntryTable);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = prologue(1.0, [0; 4], [0; 4]);
        bytes[..4].copy_from_slice(b"LPAK");
        assert!(matches!(
            ArchiveHeader::read(Cursor::new(bytes)),
            Err(FormatError::BadMagic(m)) if &m == b"LPAK"
        ));
    }

    #[test]
    fn rejects_unknown_versions() {
        for v in [2.0f32, 1.25, 0.0, 1.4999] {
            let bytes = prologue(v, [0; 4], [0; 4]);
            assert!(matches!(
                ArchiveHeader::read(Cursor::new(bytes)),
                Err(FormatError::UnsupportedVersion(_))
            ));
        }
    }

    #[test]
    fn truncated_prologue_is_an_io_error() {
        let bytes = prologue(1.0, [0; 4], [0; 4]);
        assert!(matches!(
            ArchiveHeader::read(Cursor::new(bytes[..20].to_vec())),
            Err(FormatError::Io(_))
        ));
    }
}
