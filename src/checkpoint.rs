//! Periodic memtable snapshots used to bound WAL replay.
//!
//! A checkpoint is a single JSON document holding the memtable contents
//! and the timestamp of the highest WAL record reflected in them. Recovery
//! loads the snapshot and replays only the WAL records after that
//! timestamp, keeping restart time proportional to recent write volume
//! rather than total log size.
//!
//! The file is replaced atomically: written to `checkpoint.json.tmp`,
//! fsynced, then renamed over `checkpoint.json`. A missing or undecodable
//! checkpoint yields empty state (with a warning for the latter) so a
//! damaged snapshot can never block an otherwise recoverable WAL.

use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::Result;

const CHECKPOINT_FILE: &str = "checkpoint.json";

/// A memtable entry as serialized: base64 key, base64 value, `null` value
/// for tombstones.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointEntry {
    key: String,
    value: Option<String>,
}

/// On-disk checkpoint document.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointData {
    timestamp: u64,
    last_wal_timestamp: u64,
    mem_table: Vec<CheckpointEntry>,
    mem_table_size: u64,
}

/// State reconstructed from a checkpoint file.
#[derive(Debug, Default, PartialEq)]
pub struct CheckpointState {
    pub entries: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    pub size: u64,
    pub last_wal_timestamp: u64,
}

/// Manages the single checkpoint file under `base_dir/checkpoint/`.
pub struct Checkpoint {
    path: PathBuf,
    mu: Mutex<()>,
}

impl Checkpoint {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = base_dir.into().join("checkpoint");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            path: dir.join(CHECKPOINT_FILE),
            mu: Mutex::new(()),
        })
    }

    /// Atomically replaces the checkpoint with the given memtable snapshot.
    /// `last_wal_timestamp` must be the timestamp of the highest WAL record
    /// whose effect is present in `entries`.
    pub fn save(
        &self,
        entries: &[(Vec<u8>, Option<Vec<u8>>)],
        size: u64,
        last_wal_timestamp: u64,
    ) -> Result<()> {
        let _guard = self.mu.lock().unwrap();

        let data = CheckpointData {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_nanos() as u64),
            last_wal_timestamp,
            mem_table: entries
                .iter()
                .map(|(key, value)| CheckpointEntry {
                    key: STANDARD.encode(key),
                    value: value.as_ref().map(|v| STANDARD.encode(v)),
                })
                .collect(),
            mem_table_size: size,
        };

        let tmp_path = self.path.with_extension("json.tmp");
        let file = File::create(&tmp_path)?;
        serde_json::to_writer(&file, &data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, &self.path)?;

        Ok(())
    }

    /// Loads the latest checkpoint. Returns empty state when no checkpoint
    /// exists or the file cannot be decoded.
    pub fn load(&self) -> Result<CheckpointState> {
        let _guard = self.mu.lock().unwrap();

        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CheckpointState::default());
            }
            Err(e) => return Err(e.into()),
        };

        let data: CheckpointData = match serde_json::from_reader(file) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Checkpoint is undecodable, recovering from WAL alone"
                );
                return Ok(CheckpointState::default());
            }
        };

        let mut entries = Vec::with_capacity(data.mem_table.len());
        for entry in &data.mem_table {
            let key = match STANDARD.decode(&entry.key) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "Checkpoint entry is undecodable, recovering from WAL alone"
                    );
                    return Ok(CheckpointState::default());
                }
            };
            let value = match &entry.value {
                Some(v) => match STANDARD.decode(v) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        tracing::warn!(
                            path = %self.path.display(),
                            error = %e,
                            "Checkpoint entry is undecodable, recovering from WAL alone"
                        );
                        return Ok(CheckpointState::default());
                    }
                },
                None => None,
            };
            entries.push((key, value));
        }

        Ok(CheckpointState {
            entries,
            size: data.mem_table_size,
            last_wal_timestamp: data.last_wal_timestamp,
        })
    }
}
