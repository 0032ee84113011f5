//! Write-ahead log for durability and recovery.
//!
//! Every mutation is logged and fsynced here before it becomes visible in
//! the memtable, so that no acknowledged write is lost to process
//! termination. The log is a directory of rotating segments named
//! `<unix-nanos>.wal`; segment names give the total order for replay.
//!
//! # Record Format
//!
//! ```text
//! +-----------+-------------+----------------------------------------+
//! | crc32c:u32| payload:u32 | payload                                |
//! +-----------+-------------+----------------------------------------+
//!                           | ts:u64 | op:u8 | klen:u32 | key | vlen:u32 | value? |
//! ```
//!
//! - All integers are little-endian
//! - The CRC32C (Castagnoli) checksum covers the payload only
//! - op 1 = Put, op 2 = Delete; deletes carry `vlen = 0` and no value
//! - Timestamps are strictly increasing within a process
//!
//! # Torn Tails
//!
//! A crash can leave a partially written record at the end of a segment.
//! Replay treats a short read or a checksum mismatch on the final record of
//! a segment as end-of-log truncation and continues recovery; a checksum
//! mismatch with more data following it is real corruption and aborts.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::errcorrupt;
use crate::error::{Error, Result};

pub const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Fixed per-record framing overhead: checksum + payload length.
const FRAME_SIZE: u64 = 8;

/// WAL operation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    Put = 1,
    Delete = 2,
}

impl TryFrom<u8> for WalOp {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WalOp::Put),
            2 => Ok(WalOp::Delete),
            other => Err(errcorrupt!("unknown WAL op type {other}")),
        }
    }
}

/// A single decoded WAL record.
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    pub timestamp: u64,
    pub op: WalOp,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// The currently open segment.
struct Segment {
    path: PathBuf,
    file: File,
    writer: BufWriter<File>,
    size: u64,
}

/// Rotating write-ahead log over a directory of segments.
pub struct Wal {
    dir: PathBuf,
    max_file_size: u64,
    /// Last issued record timestamp; appends clamp to `max(now, last + 1)`.
    clock: AtomicU64,
    /// `None` once closed.
    segment: Mutex<Option<Segment>>,
}

impl Wal {
    /// Opens the log directory, resuming the newest existing segment or
    /// starting a fresh one.
    pub fn open(dir: impl Into<PathBuf>, max_file_size: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let wal = Self {
            dir,
            max_file_size,
            clock: AtomicU64::new(0),
            segment: Mutex::new(None),
        };

        let segment = match wal.list_segments()?.pop() {
            Some((ts, path)) => {
                wal.observe_timestamp(ts);
                Segment::resume(path)?
            }
            None => Segment::create(&wal.dir, wal.next_timestamp())?,
        };
        *wal.segment.lock().unwrap() = Some(segment);

        Ok(wal)
    }

    /// Appends a Put record, fsyncs it, and returns its timestamp.
    pub fn append_put(&self, key: &[u8], value: &[u8]) -> Result<u64> {
        self.append(WalOp::Put, key, Some(value))
    }

    /// Appends a Delete record, fsyncs it, and returns its timestamp.
    pub fn append_delete(&self, key: &[u8]) -> Result<u64> {
        self.append(WalOp::Delete, key, None)
    }

    fn append(&self, op: WalOp, key: &[u8], value: Option<&[u8]>) -> Result<u64> {
        let mut guard = self.segment.lock().unwrap();
        let segment = guard.as_mut().ok_or(Error::Closed)?;

        if segment.size >= self.max_file_size {
            let old = guard.take().expect("segment present");
            old.close()?;
            *guard = Some(Segment::create(&self.dir, self.next_timestamp())?);
        }
        let segment = guard.as_mut().expect("segment present");

        let timestamp = self.next_timestamp();

        let mut payload =
            Vec::with_capacity(8 + 1 + 4 + key.len() + 4 + value.map_or(0, |v| v.len()));
        payload.write_u64::<LittleEndian>(timestamp)?;
        payload.write_u8(op as u8)?;
        payload.write_u32::<LittleEndian>(key.len() as u32)?;
        payload.extend_from_slice(key);
        payload.write_u32::<LittleEndian>(value.map_or(0, |v| v.len()) as u32)?;
        if let Some(v) = value {
            payload.extend_from_slice(v);
        }

        let checksum = CRC32C.checksum(&payload);

        segment.writer.write_u32::<LittleEndian>(checksum)?;
        segment
            .writer
            .write_u32::<LittleEndian>(payload.len() as u32)?;
        segment.writer.write_all(&payload)?;
        segment.writer.flush()?;
        segment.file.sync_all()?;

        segment.size += FRAME_SIZE + payload.len() as u64;

        Ok(timestamp)
    }

    /// Replays all records with `timestamp > from_ts` in log order,
    /// invoking `apply` for each. Records at or below the cutoff are
    /// skipped; whole segments are skipped when the following segment's
    /// name proves every record they hold is covered.
    pub fn replay_from<F>(&self, from_ts: u64, mut apply: F) -> Result<()>
    where
        F: FnMut(WalRecord) -> Result<()>,
    {
        let mut guard = self.segment.lock().unwrap();
        if let Some(segment) = guard.as_mut() {
            segment.writer.flush()?;
            segment.file.sync_all()?;
        }

        let segments = self.list_segments()?;
        for (i, (_, path)) in segments.iter().enumerate() {
            // Records in this segment all predate the next segment's name.
            if let Some((next_ts, _)) = segments.get(i + 1) {
                if *next_ts <= from_ts {
                    continue;
                }
            }
            self.replay_segment(path, from_ts, &mut apply)?;
        }

        Ok(())
    }

    fn replay_segment<F>(&self, path: &Path, from_ts: u64, apply: &mut F) -> Result<()>
    where
        F: FnMut(WalRecord) -> Result<()>,
    {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut offset = 0u64;

        loop {
            let checksum = match reader.read_u32::<LittleEndian>() {
                Ok(crc) => crc,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            let payload_len = match reader.read_u32::<LittleEndian>() {
                Ok(len) => len as u64,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::warn!(path = %path.display(), "Discarding torn WAL record header");
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            // A record reaching past EOF can only be a torn tail.
            if offset + FRAME_SIZE + payload_len > file_size {
                tracing::warn!(
                    path = %path.display(),
                    offset,
                    "Discarding torn WAL record past end of segment"
                );
                break;
            }

            let mut payload = vec![0u8; payload_len as usize];
            reader.read_exact(&mut payload)?;
            offset += FRAME_SIZE + payload_len;

            if CRC32C.checksum(&payload) != checksum {
                if offset == file_size {
                    tracing::warn!(
                        path = %path.display(),
                        "Discarding torn final WAL record with bad checksum"
                    );
                    break;
                }
                return Err(errcorrupt!(
                    "WAL checksum mismatch mid-segment in {} at offset {}",
                    path.display(),
                    offset - FRAME_SIZE - payload_len
                ));
            }

            let record = decode_payload(&payload)?;
            self.observe_timestamp(record.timestamp);

            if record.timestamp <= from_ts {
                continue;
            }
            apply(record)?;
        }

        Ok(())
    }

    /// Removes segments whose entire timestamp range is covered by a
    /// persisted checkpoint. A segment qualifies when the next segment's
    /// name is at or below the cutoff; the current segment never does.
    pub fn remove_obsolete(&self, up_to_ts: u64) -> Result<usize> {
        let guard = self.segment.lock().unwrap();
        let current = guard.as_ref().map(|s| s.path.clone());

        let segments = self.list_segments()?;
        let mut removed = 0;
        for (i, (_, path)) in segments.iter().enumerate() {
            if Some(path) == current.as_ref() {
                continue;
            }
            let covered = match segments.get(i + 1) {
                Some((next_ts, _)) => *next_ts <= up_to_ts,
                None => false,
            };
            if covered {
                match fs::remove_file(path) {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to remove obsolete WAL segment")
                    }
                }
            }
        }

        if removed > 0 {
            tracing::debug!(removed, up_to_ts, "Removed obsolete WAL segments");
        }
        Ok(removed)
    }

    /// Flushes and fsyncs the current segment.
    pub fn sync(&self) -> Result<()> {
        let mut guard = self.segment.lock().unwrap();
        if let Some(segment) = guard.as_mut() {
            segment.writer.flush()?;
            segment.file.sync_all()?;
        }
        Ok(())
    }

    /// Flushes and closes the current segment. Safe to call twice.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.segment.lock().unwrap();
        if let Some(segment) = guard.take() {
            segment.close()?;
        }
        Ok(())
    }

    /// Path of the segment currently being appended to, if open.
    pub fn current_segment(&self) -> Option<PathBuf> {
        self.segment.lock().unwrap().as_ref().map(|s| s.path.clone())
    }

    /// All segments sorted by their filename timestamp, oldest first.
    fn list_segments(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut segments = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("wal") {
                continue;
            }
            let Some(ts) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            segments.push((ts, path));
        }
        segments.sort_by_key(|(ts, _)| *ts);
        Ok(segments)
    }

    /// Issues a timestamp strictly greater than any issued or observed
    /// before it.
    fn next_timestamp(&self) -> u64 {
        let now = unix_nanos();
        let mut last = self.clock.load(Ordering::SeqCst);
        loop {
            let ts = now.max(last + 1);
            match self
                .clock
                .compare_exchange(last, ts, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return ts,
                Err(current) => last = current,
            }
        }
    }

    /// Folds an externally observed timestamp into the clock so later
    /// appends stay strictly increasing across restarts.
    fn observe_timestamp(&self, ts: u64) {
        self.clock.fetch_max(ts, Ordering::SeqCst);
    }
}

impl Segment {
    fn create(dir: &Path, ts: u64) -> Result<Self> {
        let path = dir.join(format!("{ts}.wal"));
        let file = File::options().create(true).append(true).open(&path)?;
        let writer = BufWriter::new(file.try_clone()?);
        tracing::debug!(path = %path.display(), "Opened new WAL segment");
        Ok(Self {
            path,
            file,
            writer,
            size: 0,
        })
    }

    /// Resumes an existing segment for appending. A torn tail left by a
    /// crash is truncated away first; appending after it would otherwise
    /// turn the benign tail into mid-file corruption on the next replay.
    fn resume(path: PathBuf) -> Result<Self> {
        repair_torn_tail(&path)?;

        let file = File::options().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        let writer = BufWriter::new(file.try_clone()?);
        tracing::debug!(path = %path.display(), size, "Resumed WAL segment");
        Ok(Self {
            path,
            file,
            writer,
            size,
        })
    }

    fn close(mut self) -> Result<()> {
        self.writer.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Truncates an incomplete final record off a segment. Only a record that
/// runs past end-of-file, or whose checksum fails right at end-of-file, is
/// a torn tail; a checksum mismatch with more data behind it is left in
/// place for replay to surface as corruption.
fn repair_torn_tail(path: &Path) -> Result<()> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let file_size = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut valid = 0u64;
    let mut truncate = false;
    loop {
        let checksum = match reader.read_u32::<LittleEndian>() {
            Ok(crc) => crc,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // A few stray bytes after the last valid record are a
                // torn tail too.
                truncate = valid < file_size;
                break;
            }
            Err(e) => return Err(e.into()),
        };
        let payload_len = match reader.read_u32::<LittleEndian>() {
            Ok(len) => len as u64,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                truncate = true;
                break;
            }
            Err(e) => return Err(e.into()),
        };

        if valid + FRAME_SIZE + payload_len > file_size {
            truncate = true;
            break;
        }

        let mut payload = vec![0u8; payload_len as usize];
        reader.read_exact(&mut payload)?;

        if CRC32C.checksum(&payload) != checksum {
            if valid + FRAME_SIZE + payload_len == file_size {
                truncate = true;
            }
            // Mid-file mismatch: leave the segment for replay to reject.
            break;
        }

        valid += FRAME_SIZE + payload_len;
    }

    if truncate {
        tracing::warn!(
            path = %path.display(),
            valid,
            file_size,
            "Truncating torn WAL segment tail"
        );
        let file = File::options().write(true).open(path)?;
        file.set_len(valid)?;
        file.sync_all()?;
    }

    Ok(())
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

fn decode_payload(payload: &[u8]) -> Result<WalRecord> {
    let mut cursor = payload;

    let timestamp = cursor
        .read_u64::<LittleEndian>()
        .map_err(|e| errcorrupt!("failed to read WAL timestamp: {e}"))?;
    let op = WalOp::try_from(
        cursor
            .read_u8()
            .map_err(|e| errcorrupt!("failed to read WAL op: {e}"))?,
    )?;

    let key_len = cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| errcorrupt!("failed to read WAL key length: {e}"))? as usize;
    if key_len > cursor.len() {
        return Err(errcorrupt!("WAL key length {key_len} exceeds payload"));
    }
    let mut key = vec![0u8; key_len];
    cursor
        .read_exact(&mut key)
        .map_err(|e| errcorrupt!("failed to read WAL key: {e}"))?;

    let value_len = cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| errcorrupt!("failed to read WAL value length: {e}"))? as usize;

    let value = match op {
        WalOp::Put => {
            if value_len > cursor.len() {
                return Err(errcorrupt!("WAL value length {value_len} exceeds payload"));
            }
            let mut value = vec![0u8; value_len];
            cursor
                .read_exact(&mut value)
                .map_err(|e| errcorrupt!("failed to read WAL value: {e}"))?;
            Some(value)
        }
        WalOp::Delete => {
            if value_len != 0 {
                return Err(errcorrupt!("WAL delete record carries a value length"));
            }
            None
        }
    };

    Ok(WalRecord {
        timestamp,
        op,
        key,
        value,
    })
}
