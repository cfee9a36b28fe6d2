#![allow(dead_code)]

use byteorder::{LittleEndian, WriteBytesExt};

/// Assemble an archive from a raw name table, `(data_offset, size)` entries
/// and a data section.  `version` selects the 1.0 or 1.5 layout.
pub fn raw_archive(version: f32, names: &[u8], entries: &[(u64, u32)], data: &[u8]) -> Vec<u8> {
    let wide       = version == 1.5;
    let record     = if wide { 24 } else { 20 };
    let header_end = if wide { 48 } else { 40 };

    let offsets_len = 4 * entries.len() as u32;
    let entries_len = record * entries.len() as u32;
    let names_len   = names.len() as u32;

    let (first, second) = if wide { (entries_len, offsets_len) } else { (offsets_len, entries_len) };
    let s0 = header_end;
    let s1 = s0 + first;
    let s2 = s1 + second;
    let s3 = s2 + names_len;

    let mut out = Vec::new();
    out.extend_from_slice(b"KAPL");
    out.write_f32::<LittleEndian>(version).unwrap();
    let sizes = if wide {
        [offsets_len, entries_len, names_len, 0]
    } else {
        [offsets_len, entries_len, names_len, data.len() as u32]
    };
    for v in [s0, s1, s2, s3].iter().chain(sizes.iter()) {
        out.write_u32::<LittleEndian>(*v).unwrap();
    }
    if wide {
        out.extend_from_slice(&[0u8; 8]);
    }

    let mut offset_table = Vec::new();
    let mut entry_table = Vec::new();
    for &(offset, size) in entries {
        offset_table.write_u32::<LittleEndian>(offset as u32).unwrap();
        if wide {
            entry_table.write_u64::<LittleEndian>(offset).unwrap();
        } else {
            entry_table.write_u32::<LittleEndian>(offset as u32).unwrap();
        }
        for v in [0, size, size, 0] {
            entry_table.write_u32::<LittleEndian>(v).unwrap();
        }
    }
    if wide {
        out.extend_from_slice(&entry_table);
        out.extend_from_slice(&offset_table);
    } else {
        out.extend_from_slice(&offset_table);
        out.extend_from_slice(&entry_table);
    }
    out.extend_from_slice(names);
    out.extend_from_slice(data);
    out
}

/// Archive holding `members` back to back in the data section.
pub fn build_archive<S, D>(version: f32, members: &[(S, D)]) -> Vec<u8>
where
    S: AsRef<str>,
    D: AsRef<[u8]>,
{
    let mut names = Vec::new();
    let mut entries = Vec::new();
    let mut data = Vec::new();
    for (name, bytes) in members {
        names.extend_from_slice(name.as_ref().as_bytes());
        names.push(0);
        entries.push((data.len() as u64, bytes.as_ref().len() as u32));
        data.extend_from_slice(bytes.as_ref());
    }
    raw_archive(version, &names, &entries, &data)
}
