//! Section decoding and the member index.
//!
//! The entry table is a packed array of fixed-size records whose layout is
//! chosen once from the header version ([`RecordLayout`]).  The name table is
//! a NUL-separated list of member names in record order.  Names and entries
//! are zipped positionally, names are normalized, and the result is kept in
//! insertion order.

use byteorder::{LittleEndian, ReadBytesExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Seek};
use tracing::{debug, warn};

use crate::header::{expect_position, ArchiveHeader, Cue, FormatError, SectionRole, Version};
use crate::io_stream::WindowedStream;
use crate::path::normalize;

/// Metadata for one archive member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Entry {
    /// Offset of the member relative to the start of the data section.
    pub data_offset:       u64,
    /// Informational only; lookups go through the name table order.
    pub name_offset:       u32,
    pub compressed_size:   u32,
    pub decompressed_size: u32,
    /// Carried through as stored.  Members are always read as
    /// `decompressed_size` raw bytes.
    pub is_compressed:     u32,
}

// ── Record layouts ───────────────────────────────────────────────────────────

/// On-disk entry record layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    /// Version 1.0: five u32 fields.
    Narrow,
    /// Version 1.5: `data_offset` widened to u64, four u32 fields.
    Wide,
}

impl RecordLayout {
    pub fn for_version(version: Version) -> Self {
        match version {
            Version::V1_0 => RecordLayout::Narrow,
            Version::V1_5 => RecordLayout::Wide,
        }
    }

    /// Record size in bytes.
    pub fn size(self) -> u64 {
        match self {
            RecordLayout::Narrow => 20,
            RecordLayout::Wide   => 24,
        }
    }

    pub fn read<R: Read>(self, mut reader: R) -> io::Result<Entry> {
        let data_offset = match self {
            RecordLayout::Narrow => u64::from(reader.read_u32::<LittleEndian>()?),
            RecordLayout::Wide   => reader.read_u64::<LittleEndian>()?,
        };
        Ok(Entry {
            data_offset,
            name_offset:       reader.read_u32::<LittleEndian>()?,
            compressed_size:   reader.read_u32::<LittleEndian>()?,
            decompressed_size: reader.read_u32::<LittleEndian>()?,
            is_compressed:     reader.read_u32::<LittleEndian>()?,
        })
    }
}

// ── ArchiveIndex ─────────────────────────────────────────────────────────────

/// Normalized member path → [`Entry`], in name-table order.
#[derive(Debug, Clone)]
pub struct ArchiveIndex {
    members:      Vec<(String, Entry)>,
    lookup:       HashMap<String, usize>,
    data:         Cue,
    offset_count: usize,
}

impl ArchiveIndex {
    /// Decode the four sections described by `header` from `source`.
    ///
    /// Sections are read in on-disk order.  Before each one, the position
    /// reached so far (the end of the prologue, then the end of the previous
    /// section) must equal the section's declared start.
    pub fn read<R: Read + Seek>(
        source: &Mutex<R>,
        header: &ArchiveHeader,
    ) -> Result<Self, FormatError> {
        let layout = RecordLayout::for_version(header.version);

        let mut position     = header.header_end;
        let mut offset_count = 0;
        let mut entries      = Vec::new();
        let mut names        = Vec::new();

        for (role, cue) in header.sections() {
            expect_position(role, cue, position)?;
            if role == SectionRole::Data {
                break;
            }

            let bytes = WindowedStream::new(source, cue.offset, cue.size).read_remaining()?;
            position = cue.offset + bytes.len() as u64;

            match role {
                SectionRole::OffsetTable => offset_count = read_offset_table(&bytes)?,
                SectionRole::EntryTable  => entries = read_entry_table(&bytes, layout)?,
                SectionRole::NameTable   => names = read_name_table(&bytes)?,
                SectionRole::Data        => {}
            }
        }

        if names.len() != entries.len() {
            return Err(FormatError::CountMismatch { names: names.len(), entries: entries.len() });
        }

        let index = Self::build(names.into_iter().zip(entries), header.data, offset_count);
        debug!(
            members = index.len(),
            offsets = index.offset_count,
            compressed = index.iter().filter(|(_, e)| e.is_compressed != 0).count(),
            "built archive index"
        );
        Ok(index)
    }

    /// Build an index from `(name, entry)` pairs.  A name that normalizes to
    /// an existing key replaces that key's entry in place.
    pub fn build<I>(pairs: I, data: Cue, offset_count: usize) -> Self
    where
        I: IntoIterator<Item = (String, Entry)>,
    {
        let mut members: Vec<(String, Entry)> = Vec::new();
        let mut lookup: HashMap<String, usize> = HashMap::new();
        for (name, entry) in pairs {
            let key = normalize(&name);
            match lookup.get(&key) {
                Some(&i) => {
                    warn!(name = %name, key = %key, "duplicate member name, keeping last entry");
                    members[i].1 = entry;
                }
                None => {
                    lookup.insert(key.clone(), members.len());
                    members.push((key, entry));
                }
            }
        }
        Self { members, lookup, data, offset_count }
    }

    /// Look up a member by any spelling of its path.
    pub fn get(&self, name: &str) -> Option<&Entry> {
        self.lookup.get(&normalize(name)).map(|&i| &self.members[i].1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Entry)> + '_ {
        self.members.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.members.iter().map(|(name, _)| name.as_str())
    }

    /// Location of the data section.
    pub fn data(&self) -> Cue {
        self.data
    }

    /// Number of values in the (otherwise unused) offset table.
    pub fn offset_count(&self) -> usize {
        self.offset_count
    }
}

fn check_alignment(role: SectionRole, bytes: &[u8], record: u64) -> Result<(), FormatError> {
    let size = bytes.len() as u64;
    if size % record != 0 {
        return Err(FormatError::MisalignedSection { role, size, record });
    }
    Ok(())
}

fn read_offset_table(bytes: &[u8]) -> Result<usize, FormatError> {
    check_alignment(SectionRole::OffsetTable, bytes, 4)?;
    let mut values = vec![0u32; bytes.len() / 4];
    Cursor::new(bytes).read_u32_into::<LittleEndian>(&mut values)?;
    Ok(values.len())
}

fn read_entry_table(bytes: &[u8], layout: RecordLayout) -> Result<Vec<Entry>, FormatError> {
    check_alignment(SectionRole::EntryTable, bytes, layout.size())?;
    let count = bytes.len() as u64 / layout.size();
    let mut cursor = Cursor::new(bytes);
    (0..count).map(|_| layout.read(&mut cursor).map_err(FormatError::from)).collect()
}

fn read_name_table(bytes: &[u8]) -> Result<Vec<String>, FormatError> {
    let bytes = bytes.strip_suffix(b"\0").unwrap_or(bytes);
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    bytes
        .split(|b| *b == 0)
        .enumerate()
        .map(|(index, raw)| {
            String::from_utf8(raw.to_vec()).map_err(|_| FormatError::InvalidName { index })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn entry(data_offset: u64, size: u32) -> Entry {
        Entry {
            data_offset,
            name_offset:       0,
            compressed_size:   size,
            decompressed_size: size,
            is_compressed:     0,
        }
    }

    #[test]
    fn narrow_and_wide_records_decode_the_same_fields() {
        let mut narrow = Vec::new();
        for v in [7u32, 1, 2, 3, 4] {
            narrow.write_u32::<LittleEndian>(v).unwrap();
        }
        let mut wide = Vec::new();
        wide.write_u64::<LittleEndian>(7).unwrap();
        for v in [1u32, 2, 3, 4] {
            wide.write_u32::<LittleEndian>(v).unwrap();
        }

        let a = RecordLayout::Narrow.read(&narrow[..]).unwrap();
        let b = RecordLayout::Wide.read(&wide[..]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.decompressed_size, 3);
        assert_eq!(a.is_compressed, 4);
        assert_eq!(narrow.len() as u64, RecordLayout::Narrow.size());
        assert_eq!(wide.len() as u64, RecordLayout::Wide.size());
    }

    #[test]
    fn wide_records_keep_64_bit_offsets() {
        let mut wide = Vec::new();
        wide.write_u64::<LittleEndian>(0x1_0000_0010).unwrap();
        for v in [0u32, 8, 8, 0] {
            wide.write_u32::<LittleEndian>(v).unwrap();
        }
        let e = RecordLayout::Wide.read(&wide[..]).unwrap();
        assert_eq!(e.data_offset, 0x1_0000_0010);
    }

    #[test]
    fn name_table_splits_on_nul() {
        assert_eq!(read_name_table(b"a\0b/c\0d").unwrap(), vec!["a", "b/c", "d"]);
        assert_eq!(read_name_table(b"a\0b\0").unwrap(), vec!["a", "b"]);
        assert!(read_name_table(b"").unwrap().is_empty());
        assert!(matches!(
            read_name_table(b"ok\0\xff\xfe"),
            Err(FormatError::InvalidName { index: 1 })
        ));
    }

    #[test]
    fn misaligned_entry_table_is_rejected() {
        let bytes = vec![0u8; 21];
        assert!(matches!(
            read_entry_table(&bytes, RecordLayout::Narrow),
            Err(FormatError::MisalignedSection { size: 21, record: 20, .. })
        ));
        assert!(read_offset_table(&[0u8; 6]).is_err());
        assert_eq!(read_offset_table(&[0u8; 8]).unwrap(), 2);
    }

    #[test]
    fn build_normalizes_and_keeps_insertion_order() {
        let data = Cue { offset: 0, size: 0 };
        let index = ArchiveIndex::build(
            vec![
                ("z\\last.bin".to_owned(), entry(0, 1)),
                ("./a//first.bin".to_owned(), entry(1, 2)),
                ("m/x/../mid.bin".to_owned(), entry(3, 3)),
            ],
            data,
            3,
        );
        let names: Vec<_> = index.names().collect();
        assert_eq!(names, vec!["z/last.bin", "a/first.bin", "m/mid.bin"]);
        assert_eq!(index.get("a/first.bin").unwrap().data_offset, 1);
        assert_eq!(index.get("z/./last.bin").unwrap().data_offset, 0);
        assert!(index.get("missing").is_none());
    }

    #[test]
    fn duplicate_names_keep_first_position_and_last_entry() {
        let data = Cue { offset: 0, size: 0 };
        let index = ArchiveIndex::build(
            vec![
                ("a".to_owned(), entry(0, 1)),
                ("b".to_owned(), entry(1, 1)),
                ("./a".to_owned(), entry(2, 1)),
            ],
            data,
            0,
        );
        assert_eq!(index.len(), 2);
        assert_eq!(index.names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(index.get("a").unwrap().data_offset, 2);
    }
}
