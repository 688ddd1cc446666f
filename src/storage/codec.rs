use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

use super::directory::EntrySnapshot;
use super::page::{Page, PageHeader, Slot, HEADER_SIZE, SLOT_SIZE};
use super::{PageId, PAGE_SIZE};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("truncated buffer: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("invalid UTF-8 in string field: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("{0} trailing bytes after value")]
    Trailing(usize),

    #[error("encoded page must be {expected} bytes, got {actual}")]
    BadPageSize { expected: usize, actual: usize },

    #[error("unknown type tag {0}")]
    UnknownTag(u8),

    #[error("page pointers out of bounds: lower={lower}, upper={upper}")]
    BadPointers { lower: u16, upper: u16 },

    #[error("slot out of bounds: offset={offset}, length={length}")]
    BadSlot { offset: u16, length: u16 },
}

/// A single row: unique id plus an ordered column -> value mapping.
///
/// The table's primary column carries the decimal form of `id`.
/// Serializes to JSON for front-end response bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Row {
    pub id: u64,
    pub values: BTreeMap<String, String>,
}

impl Row {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            values: BTreeMap::new(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.values.get(column).map(String::as_str)
    }
}

/// Little-endian byte sink shared by all on-disk codecs.
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Length-prefixed (u32) string.
    pub fn put_string(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for ByteWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds-checked little-endian reader over a byte slice.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    /// Error unless the whole buffer was consumed.
    pub fn finish(&self) -> Result<(), CodecError> {
        if self.remaining() > 0 {
            return Err(CodecError::Trailing(self.remaining()));
        }
        Ok(())
    }
}

/// Encode a row: id, column count, then (name, value) pairs in map order.
pub fn encode_row(row: &Row) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u64(row.id);
    w.put_u32(row.values.len() as u32);
    for (name, value) in &row.values {
        w.put_string(name);
        w.put_string(value);
    }
    w.into_bytes()
}

pub fn decode_row(bytes: &[u8]) -> Result<Row, CodecError> {
    let mut r = ByteReader::new(bytes);
    let id = r.read_u64()?;
    let count = r.read_u32()?;
    let mut values = BTreeMap::new();
    for _ in 0..count {
        let name = r.read_string()?;
        let value = r.read_string()?;
        values.insert(name, value);
    }
    r.finish()?;
    Ok(Row { id, values })
}

/// Serialize a page to exactly `PAGE_SIZE` bytes: header, slot array,
/// zeroed free gap, heap bytes already in place.
pub fn encode_page(page: &Page) -> Vec<u8> {
    let mut out = page.data.clone();
    out[0..8].copy_from_slice(&page.header.id.to_le_bytes());
    out[8..10].copy_from_slice(&page.header.lower.to_le_bytes());
    out[10..12].copy_from_slice(&page.header.upper.to_le_bytes());

    let mut pos = HEADER_SIZE;
    for slot in &page.slots {
        out[pos..pos + 2].copy_from_slice(&slot.offset.to_le_bytes());
        out[pos + 2..pos + 4].copy_from_slice(&slot.length.to_le_bytes());
        out[pos + 4] = slot.free as u8;
        pos += SLOT_SIZE;
    }

    // Zero the free gap so encoding is deterministic.
    out[page.header.lower as usize..page.header.upper as usize].fill(0);
    out
}

pub fn decode_page(bytes: &[u8]) -> Result<Page, CodecError> {
    if bytes.len() != PAGE_SIZE {
        return Err(CodecError::BadPageSize {
            expected: PAGE_SIZE,
            actual: bytes.len(),
        });
    }

    let mut r = ByteReader::new(&bytes[..HEADER_SIZE]);
    let id = r.read_u64()?;
    let lower = r.read_u16()?;
    let upper = r.read_u16()?;

    let slot_bytes = (lower as usize).wrapping_sub(HEADER_SIZE);
    if (lower as usize) < HEADER_SIZE
        || lower > upper
        || upper as usize > PAGE_SIZE
        || slot_bytes % SLOT_SIZE != 0
    {
        return Err(CodecError::BadPointers { lower, upper });
    }

    let mut slots = Vec::with_capacity(slot_bytes / SLOT_SIZE);
    let mut pos = HEADER_SIZE;
    while pos < lower as usize {
        let offset = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]);
        let length = u16::from_le_bytes([bytes[pos + 2], bytes[pos + 3]]);
        let free = bytes[pos + 4] != 0;
        if (offset as usize) < HEADER_SIZE || offset as usize + length as usize > PAGE_SIZE {
            return Err(CodecError::BadSlot { offset, length });
        }
        slots.push(Slot {
            offset,
            length,
            free,
        });
        pos += SLOT_SIZE;
    }

    Ok(Page {
        header: PageHeader { id, lower, upper },
        slots,
        data: bytes.to_vec(),
    })
}

/// Encode a directory snapshot. The directory file holds exactly one of
/// these, rewritten in place on every write.
pub fn encode_directory(entries: &[EntrySnapshot]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_u32(entries.len() as u32);
    for entry in entries {
        w.put_u64(entry.page_id);
        match entry.offset {
            Some(offset) => {
                w.put_u8(1);
                w.put_u64(offset);
            }
            None => {
                w.put_u8(0);
                w.put_u64(0);
            }
        }
        w.put_u32(entry.slots.len() as u32);
        for slot in &entry.slots {
            w.put_u16(slot.offset);
            w.put_u16(slot.length);
            w.put_u8(slot.free as u8);
        }
        w.put_u16(entry.exact_free);
        w.put_u8(entry.level);
    }
    w.into_bytes()
}

pub fn decode_directory(bytes: &[u8]) -> Result<Vec<EntrySnapshot>, CodecError> {
    let mut r = ByteReader::new(bytes);
    let count = r.read_u32()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let page_id: PageId = r.read_u64()?;
        let has_offset = r.read_u8()? != 0;
        let raw_offset = r.read_u64()?;
        let slot_count = r.read_u32()?;
        let mut slots = Vec::with_capacity(slot_count as usize);
        for _ in 0..slot_count {
            let offset = r.read_u16()?;
            let length = r.read_u16()?;
            let free = r.read_u8()? != 0;
            slots.push(Slot {
                offset,
                length,
                free,
            });
        }
        let exact_free = r.read_u16()?;
        let level = r.read_u8()?;
        entries.push(EntrySnapshot {
            page_id,
            offset: has_offset.then_some(raw_offset),
            slots,
            exact_free,
            level,
        });
    }
    r.finish()?;
    Ok(entries)
}
