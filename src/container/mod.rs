//! Monster container builder.
//!
//! # Layout
//! ```text
//! u32 BE      index length in bytes
//! index       N × (tag | payload_offset u32 BE | aux_len u32 BE | payload_len u32 BE)
//! payload     N × (aux | payload)
//! ```
//! `payload_offset` is relative to the start of the payload region and points
//! at the record's aux bytes; the payload itself follows at
//! `payload_offset + aux_len`.  Every tag in a container has the same width.
//!
//! The index is accumulated in memory, the payload region is spooled to an
//! anonymous temporary file, and [`ContainerBuilder::finalize`] streams both
//! into the output through a bounded buffer.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use thiserror::Error;
use tracing::debug;

use crate::io_stream::{CopyChunks, DEFAULT_BUFFER_SIZE};

/// Tag width used by [`ContainerBuilder::new`].
pub const DEFAULT_TAG_LEN: usize = 8;

/// Three u32 fields following the tag in each index record.
const FIELDS_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Tag is {actual} bytes, this container uses {expected}-byte tags")]
    TagLength { expected: usize, actual: usize },
    #[error("{field} value {value} does not fit in 32 bits")]
    Overflow { field: &'static str, value: u64 },
    #[error("Index length {len} is not a multiple of the {record}-byte record")]
    MisalignedIndex { len: u64, record: usize },
    #[error("Payload spool could not be rewound after a failed write")]
    Poisoned,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn to_u32(field: &'static str, value: u64) -> Result<u32, ContainerError> {
    u32::try_from(value).map_err(|_| ContainerError::Overflow { field, value })
}

// ── ContainerBuilder ─────────────────────────────────────────────────────────

/// Accumulates `(tag, aux, payload)` records.
pub struct ContainerBuilder<P = File> {
    index:       Vec<u8>,
    spool:       P,
    cursor:      u64,
    tag_len:     usize,
    records:     usize,
    buffer_size: usize,
    poisoned:    bool,
}

impl ContainerBuilder<File> {
    /// Builder with 8-byte tags spooling to an anonymous temporary file.
    pub fn new() -> io::Result<Self> {
        Self::with_tag_len(DEFAULT_TAG_LEN)
    }

    pub fn with_tag_len(tag_len: usize) -> io::Result<Self> {
        Ok(Self::with_spool(tempfile::tempfile()?, tag_len))
    }
}

impl<P: Read + Write + Seek> ContainerBuilder<P> {
    /// Builder spooling payload bytes into `spool`, which must be empty.
    pub fn with_spool(spool: P, tag_len: usize) -> Self {
        Self {
            index: Vec::new(),
            spool,
            cursor: 0,
            tag_len,
            records: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
            poisoned: false,
        }
    }

    /// Chunk size used when streaming the finished container.
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn tag_len(&self) -> usize {
        self.tag_len
    }

    /// Number of records added so far.
    pub fn len(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Bytes of payload region written so far.
    pub fn payload_len(&self) -> u64 {
        self.cursor
    }

    /// Bytes the finished container will occupy.
    pub fn total_len(&self) -> u64 {
        4 + self.index.len() as u64 + self.cursor
    }

    /// Append one record.  On error the builder is left as it was before
    /// the call.
    pub fn add(&mut self, tag: &[u8], aux: &[u8], payload: &[u8]) -> Result<(), ContainerError> {
        if self.poisoned {
            return Err(ContainerError::Poisoned);
        }
        if tag.len() != self.tag_len {
            return Err(ContainerError::TagLength { expected: self.tag_len, actual: tag.len() });
        }
        let offset      = to_u32("payload offset", self.cursor)?;
        let aux_len     = to_u32("aux length", aux.len() as u64)?;
        let payload_len = to_u32("payload length", payload.len() as u64)?;
        let next        = self.cursor + aux.len() as u64 + payload.len() as u64;
        to_u32("payload region", next)?;

        if let Err(e) = self.spool_record(aux, payload) {
            // Only the first `cursor` spool bytes are ever copied out.
            if self.spool.seek(SeekFrom::Start(self.cursor)).is_err() {
                self.poisoned = true;
            }
            return Err(e.into());
        }

        self.index.extend_from_slice(tag);
        self.index.write_u32::<BigEndian>(offset)?;
        self.index.write_u32::<BigEndian>(aux_len)?;
        self.index.write_u32::<BigEndian>(payload_len)?;

        self.cursor = next;
        self.records += 1;
        Ok(())
    }

    fn spool_record(&mut self, aux: &[u8], payload: &[u8]) -> io::Result<()> {
        self.spool.write_all(aux)?;
        self.spool.write_all(payload)
    }

    /// Start writing the finished container into `output`.
    ///
    /// The length prefix is written immediately; the returned iterator then
    /// copies the index and the payload region one chunk per `next()`.
    pub fn finalize<W: Write>(mut self, mut output: W) -> Result<Finalize<P, W>, ContainerError> {
        if self.poisoned {
            return Err(ContainerError::Poisoned);
        }
        let index_len = to_u32("index length", self.index.len() as u64)?;
        output.write_u32::<BigEndian>(index_len)?;
        self.spool.flush()?;
        self.spool.seek(SeekFrom::Start(0))?;
        debug!(
            records = self.records,
            index_len,
            payload_len = self.cursor,
            "finalizing container"
        );
        let buffer_size = self.buffer_size;
        let index = CopyChunks::new(Cursor::new(self.index), output, buffer_size);
        Ok(Finalize {
            stage:   Some(Stage::Index(index, self.spool.take(self.cursor))),
            written: 4,
            total:   4 + u64::from(index_len) + self.cursor,
            buffer_size,
        })
    }

    /// Write the finished container into `output` in one go.  Returns bytes
    /// written.
    pub fn finish_into<W: Write>(self, output: W) -> Result<u64, ContainerError> {
        let mut fin = self.finalize(output)?;
        for chunk in fin.by_ref() {
            chunk?;
        }
        let written = fin.written();
        let mut output = fin.into_inner();
        output.flush()?;
        Ok(written)
    }
}

// ── Finalize ─────────────────────────────────────────────────────────────────

enum Stage<P, W> {
    Index(CopyChunks<Cursor<Vec<u8>>, W>, io::Take<P>),
    Payload(CopyChunks<io::Take<P>, W>),
    Done(W),
}

/// Pull-based container writer returned by [`ContainerBuilder::finalize`].
///
/// Each `next()` moves at most one buffer and yields its size.  `None` means
/// the container is complete.  Dropping it early leaves a truncated output.
pub struct Finalize<P, W> {
    // `None` only while moving the writer from one stage to the next.
    stage:       Option<Stage<P, W>>,
    written:     u64,
    total:       u64,
    buffer_size: usize,
}

impl<P: Read, W: Write> Finalize<P, W> {
    /// Bytes written so far, including the length prefix.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Size of the finished container.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_done(&self) -> bool {
        matches!(self.stage, Some(Stage::Done(_)))
    }

    /// Hand back the output writer.
    pub fn into_inner(self) -> W {
        match self.stage {
            Some(Stage::Index(c, _)) => c.into_inner().1,
            Some(Stage::Payload(c))  => c.into_inner().1,
            Some(Stage::Done(w))     => w,
            None => unreachable!("finalize stage is restored before returning"),
        }
    }

    fn advance(&mut self) {
        self.stage = match self.stage.take() {
            Some(Stage::Index(chunks, spool)) => {
                let (_, output) = chunks.into_inner();
                Some(Stage::Payload(CopyChunks::new(spool, output, self.buffer_size)))
            }
            Some(Stage::Payload(chunks)) => Some(Stage::Done(chunks.into_inner().1)),
            done => done,
        };
    }
}

impl<P: Read, W: Write> Iterator for Finalize<P, W> {
    type Item = Result<usize, ContainerError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let step = match self.stage.as_mut()? {
                Stage::Index(chunks, _) => chunks.next(),
                Stage::Payload(chunks)  => chunks.next(),
                Stage::Done(_)          => return None,
            };
            match step {
                Some(Ok(n)) => {
                    self.written += n as u64;
                    return Some(Ok(n));
                }
                Some(Err(e)) => return Some(Err(e.into())),
                None => self.advance(),
            }
        }
    }
}

// ── Read-back ────────────────────────────────────────────────────────────────

/// One decoded index record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub tag:            Vec<u8>,
    /// Offset of the aux bytes within the payload region.
    pub payload_offset: u32,
    pub aux_len:        u32,
    pub payload_len:    u32,
}

impl IndexRecord {
    /// Offset of the payload bytes within the payload region.
    pub fn data_offset(&self) -> u64 {
        u64::from(self.payload_offset) + u64::from(self.aux_len)
    }
}

/// Decode the length prefix and index of a container.  Leaves `reader` at
/// the start of the payload region.
pub fn read_index<R: Read>(mut reader: R, tag_len: usize) -> Result<Vec<IndexRecord>, ContainerError> {
    let record = tag_len + FIELDS_LEN;
    let len = reader.read_u32::<BigEndian>()?;
    if len as usize % record != 0 {
        return Err(ContainerError::MisalignedIndex { len: u64::from(len), record });
    }
    (0..len as usize / record)
        .map(|_| {
            let mut tag = vec![0u8; tag_len];
            reader.read_exact(&mut tag)?;
            Ok(IndexRecord {
                tag,
                payload_offset: reader.read_u32::<BigEndian>()?,
                aux_len:        reader.read_u32::<BigEndian>()?,
                payload_len:    reader.read_u32::<BigEndian>()?,
            })
        })
        .collect()
}
