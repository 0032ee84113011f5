//! Immutable sorted block codec.
//!
//! A block is the on-disk unit of the leveled index: a sorted run of
//! key-value records produced by flushing the memtable or by compaction.
//!
//! # File Layout
//!
//! ```text
//! +--------------------------+
//! | Header (54 bytes)        |  type, compression, count, sizes,
//! |                          |  created-at, SHA-256 block id
//! +--------------------------+
//! | Stats                    |  reserved numeric min/max,
//! |                          |  length-prefixed min/max key
//! +--------------------------+
//! | Payload                  |  u32 record count, then per record:
//! |                          |  u32 key_len, key, u32 value_len, value
//! +--------------------------+
//! ```
//!
//! All integers are little-endian. A tombstone record stores the sentinel
//! `u32::MAX` as its value length and carries no value bytes; real value
//! lengths stay clear of the sentinel because values are capped at 64MB.
//! The block id is the SHA-256 of the payload as written, so encoding the
//! same records twice yields the same id.

use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};

use crate::config::MAX_ENTRY_SIZE;
use crate::errcorrupt;
use crate::error::Result;

/// Encoded header size in bytes.
pub const HEADER_SIZE: usize = 1 + 1 + 4 + 4 + 4 + 8 + 32;

/// Key-value payload, the only data type currently written.
pub const DATA_TYPE_KV: u8 = 0;

/// No compression; the field is carried for format stability.
pub const COMPRESSION_NONE: u8 = 0;

/// Value-length sentinel marking a tombstone record.
const TOMBSTONE_LEN: u32 = u32::MAX;

/// Fixed-size block metadata, written first in the file.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockHeader {
    pub data_type: u8,
    pub compression_type: u8,
    pub count: u32,
    pub raw_size: u32,
    pub stored_size: u32,
    pub created_at: i64,
    pub block_id: [u8; 32],
}

/// Summary statistics for the records in a block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockStats {
    /// Reserved for numeric column summaries; always zero for KV payloads.
    pub min_numeric: u64,
    pub max_numeric: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
}

/// A record in a block: a value or a tombstone shadowing older values.
pub type BlockRecord = (Vec<u8>, Option<Vec<u8>>);

/// An in-memory block, either being assembled for a write or decoded from
/// disk for a lookup.
#[derive(Debug, Clone)]
pub struct Block {
    pub header: BlockHeader,
    pub stats: BlockStats,
    records: Vec<BlockRecord>,
    payload: Vec<u8>,
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

impl Block {
    /// Creates a new empty block.
    pub fn new() -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as i64);

        Self {
            header: BlockHeader {
                data_type: DATA_TYPE_KV,
                compression_type: COMPRESSION_NONE,
                count: 0,
                raw_size: 0,
                stored_size: 0,
                created_at,
                block_id: [0u8; 32],
            },
            stats: BlockStats::default(),
            records: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Adds a record. `None` records a tombstone for the key.
    pub fn add(&mut self, key: Vec<u8>, value: Option<Vec<u8>>) {
        if self.stats.min_key.is_empty() || key < self.stats.min_key {
            self.stats.min_key = key.clone();
        }
        if key > self.stats.max_key {
            self.stats.max_key = key.clone();
        }
        self.records.push((key, value));
    }

    /// Sorts the records, builds the payload, and computes the header
    /// fields including the SHA-256 block id. Idempotent.
    pub fn finalize(&mut self) -> Result<()> {
        self.records.sort_by(|a, b| a.0.cmp(&b.0));

        let mut payload = Vec::new();
        payload.write_u32::<LittleEndian>(self.records.len() as u32)?;

        for (key, value) in &self.records {
            payload.write_u32::<LittleEndian>(key.len() as u32)?;
            payload.extend_from_slice(key);
            match value {
                Some(v) => {
                    payload.write_u32::<LittleEndian>(v.len() as u32)?;
                    payload.extend_from_slice(v);
                }
                None => payload.write_u32::<LittleEndian>(TOMBSTONE_LEN)?,
            }
        }

        self.header.count = self.records.len() as u32;
        self.header.raw_size = payload.len() as u32;
        self.header.stored_size = payload.len() as u32;
        self.header.block_id = Sha256::digest(&payload).into();
        self.payload = payload;

        Ok(())
    }

    /// Writes the block to `w`, finalizing first if needed.
    pub fn encode<W: Write>(&mut self, w: &mut W) -> Result<()> {
        if self.payload.is_empty() {
            self.finalize()?;
        }

        w.write_u8(self.header.data_type)?;
        w.write_u8(self.header.compression_type)?;
        w.write_u32::<LittleEndian>(self.header.count)?;
        w.write_u32::<LittleEndian>(self.header.raw_size)?;
        w.write_u32::<LittleEndian>(self.header.stored_size)?;
        w.write_i64::<LittleEndian>(self.header.created_at)?;
        w.write_all(&self.header.block_id)?;

        w.write_u64::<LittleEndian>(self.stats.min_numeric)?;
        w.write_u64::<LittleEndian>(self.stats.max_numeric)?;
        w.write_u32::<LittleEndian>(self.stats.min_key.len() as u32)?;
        w.write_all(&self.stats.min_key)?;
        w.write_u32::<LittleEndian>(self.stats.max_key.len() as u32)?;
        w.write_all(&self.stats.max_key)?;

        w.write_all(&self.payload)?;
        Ok(())
    }

    /// Reads the header and stats sections, leaving `r` positioned at the
    /// payload. Used when only block metadata is needed.
    pub fn read_meta<R: Read>(r: &mut R) -> Result<(BlockHeader, BlockStats)> {
        let data_type = r.read_u8()?;
        let compression_type = r.read_u8()?;
        let count = r.read_u32::<LittleEndian>()?;
        let raw_size = r.read_u32::<LittleEndian>()?;
        let stored_size = r.read_u32::<LittleEndian>()?;
        let created_at = r.read_i64::<LittleEndian>()?;
        let mut block_id = [0u8; 32];
        r.read_exact(&mut block_id)?;

        let min_numeric = r.read_u64::<LittleEndian>()?;
        let max_numeric = r.read_u64::<LittleEndian>()?;
        let min_key = read_bytes(r, "stats min key")?;
        let max_key = read_bytes(r, "stats max key")?;

        Ok((
            BlockHeader {
                data_type,
                compression_type,
                count,
                raw_size,
                stored_size,
                created_at,
                block_id,
            },
            BlockStats {
                min_numeric,
                max_numeric,
                min_key,
                max_key,
            },
        ))
    }

    /// Reads a complete block from `r`.
    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let (header, stats) = Self::read_meta(r)?;

        let mut payload = vec![0u8; header.stored_size as usize];
        r.read_exact(&mut payload)
            .map_err(|e| errcorrupt!("block payload shorter than declared: {e}"))?;

        let mut cursor = payload.as_slice();
        let count = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| errcorrupt!("failed to read record count: {e}"))?;
        if count != header.count {
            return Err(errcorrupt!(
                "record count mismatch: header {} payload {}",
                header.count,
                count
            ));
        }

        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key = read_record_bytes(&mut cursor, "record key")?;
            let value_len = cursor
                .read_u32::<LittleEndian>()
                .map_err(|e| errcorrupt!("failed to read value length: {e}"))?;
            let value = if value_len == TOMBSTONE_LEN {
                None
            } else {
                if value_len as usize > cursor.len() {
                    return Err(errcorrupt!(
                        "record value length {} exceeds remaining payload {}",
                        value_len,
                        cursor.len()
                    ));
                }
                let mut v = vec![0u8; value_len as usize];
                cursor
                    .read_exact(&mut v)
                    .map_err(|e| errcorrupt!("failed to read record value: {e}"))?;
                Some(v)
            };
            records.push((key, value));
        }

        Ok(Self {
            header,
            stats,
            records,
            payload,
        })
    }

    /// Looks up a key. Returns `Some(None)` for a tombstone hit, which
    /// shadows any older value in deeper levels.
    pub fn get(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        self.records
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
            .ok()
            .map(|idx| self.records[idx].1.as_deref())
    }

    /// Hex rendering of the block id.
    pub fn id(&self) -> String {
        hex::encode(self.header.block_id)
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn min_key(&self) -> &[u8] {
        &self.stats.min_key
    }

    pub fn max_key(&self) -> &[u8] {
        &self.stats.max_key
    }

    /// Consumes the block, yielding its records in key order. The block
    /// must be finalized or decoded first.
    pub fn into_records(self) -> Vec<BlockRecord> {
        self.records
    }
}

fn read_bytes<R: Read>(r: &mut R, field: &str) -> Result<Vec<u8>> {
    let len = r
        .read_u32::<LittleEndian>()
        .map_err(|e| errcorrupt!("failed to read {field} length: {e}"))?;
    if len as usize > MAX_ENTRY_SIZE {
        return Err(errcorrupt!("{field} length {len} exceeds entry cap"));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)
        .map_err(|e| errcorrupt!("failed to read {field}: {e}"))?;
    Ok(buf)
}

fn read_record_bytes(cursor: &mut &[u8], field: &str) -> Result<Vec<u8>> {
    let len = cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| errcorrupt!("failed to read {field} length: {e}"))?;
    if len as usize > cursor.len() {
        return Err(errcorrupt!(
            "{field} length {} exceeds remaining payload {}",
            len,
            cursor.len()
        ));
    }
    let mut buf = vec![0u8; len as usize];
    cursor
        .read_exact(&mut buf)
        .map_err(|e| errcorrupt!("failed to read {field}: {e}"))?;
    Ok(buf)
}
