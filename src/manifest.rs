//! Persisted catalog of the leveled index.
//!
//! The manifest records which block files belong to which level, along
//! with the current WAL segment and the last checkpoint timestamp. On open
//! it is the authoritative view: the index is rebuilt from it and any
//! `.blk` file it does not mention is an orphan left behind by a crash
//! mid-flush or mid-compaction, safe to delete because its contents are
//! either still in the WAL or still present in the source blocks the
//! manifest does mention.
//!
//! The file is replaced atomically (temp + fsync + rename) after every
//! flush and compaction commit, so a crash at any instant leaves either
//! the old catalog or the new one, never a torn mixture.

use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::config::NUM_LEVELS;
use crate::error::Result;
use crate::lsm::BlockInfo;

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Serialize, Deserialize)]
struct ManifestBlock {
    /// File name within the level directory.
    file: String,
    size: u64,
    min_key: String,
    max_key: String,
    created_at: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestLevel {
    level: usize,
    blocks: Vec<ManifestBlock>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestData {
    timestamp: u64,
    current_wal: Option<String>,
    last_checkpoint: u64,
    levels: Vec<ManifestLevel>,
}

/// Decoded manifest contents.
#[derive(Debug, Default)]
pub struct ManifestState {
    /// One entry per level; block paths are resolved against the data
    /// directory by the caller.
    pub levels: Vec<Vec<BlockInfo>>,
    pub current_wal: Option<String>,
    pub last_checkpoint: u64,
}

/// Manages the manifest file under `base_dir/manifest/`.
pub struct Manifest {
    path: PathBuf,
    mu: Mutex<()>,
}

impl Manifest {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = base_dir.into().join("manifest");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            path: dir.join(MANIFEST_FILE),
            mu: Mutex::new(()),
        })
    }

    /// Atomically replaces the manifest with the given state.
    pub fn save(&self, state: &ManifestState) -> Result<()> {
        let _guard = self.mu.lock().unwrap();

        let data = ManifestData {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_nanos() as u64),
            current_wal: state.current_wal.clone(),
            last_checkpoint: state.last_checkpoint,
            levels: state
                .levels
                .iter()
                .enumerate()
                .map(|(level, blocks)| ManifestLevel {
                    level,
                    blocks: blocks
                        .iter()
                        .map(|info| ManifestBlock {
                            file: info.file_name(),
                            size: info.size,
                            min_key: STANDARD.encode(&info.min_key),
                            max_key: STANDARD.encode(&info.max_key),
                            created_at: info.created_at,
                        })
                        .collect(),
                })
                .collect(),
        };

        let tmp_path = self.path.with_extension("json.tmp");
        let file = File::create(&tmp_path)?;
        serde_json::to_writer(&file, &data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, &self.path)?;

        Ok(())
    }

    /// Loads the manifest. `None` when the file does not exist or cannot
    /// be decoded; the caller then falls back to scanning the data
    /// directories.
    pub fn load(&self, data_dir: &std::path::Path) -> Result<Option<ManifestState>> {
        let _guard = self.mu.lock().unwrap();

        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let data: ManifestData = match serde_json::from_reader(file) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Manifest is undecodable, rebuilding index from directory scan"
                );
                return Ok(None);
            }
        };

        let mut levels = vec![Vec::new(); NUM_LEVELS];
        for level_data in &data.levels {
            if level_data.level >= NUM_LEVELS {
                tracing::warn!(
                    level = level_data.level,
                    "Manifest names an out-of-range level, rebuilding from directory scan"
                );
                return Ok(None);
            }
            for block in &level_data.blocks {
                let (Ok(min_key), Ok(max_key)) =
                    (STANDARD.decode(&block.min_key), STANDARD.decode(&block.max_key))
                else {
                    tracing::warn!(
                        file = %block.file,
                        "Manifest block keys are undecodable, rebuilding from directory scan"
                    );
                    return Ok(None);
                };
                levels[level_data.level].push(BlockInfo {
                    path: data_dir
                        .join(format!("L{}", level_data.level))
                        .join(&block.file),
                    size: block.size,
                    min_key,
                    max_key,
                    created_at: block.created_at,
                });
            }
        }

        Ok(Some(ManifestState {
            levels,
            current_wal: data.current_wal,
            last_checkpoint: data.last_checkpoint,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn info(name: &str, min: &[u8], max: &[u8], created_at: u64) -> BlockInfo {
        BlockInfo {
            path: PathBuf::from("/data/L0").join(name),
            size: 100,
            min_key: min.to_vec(),
            max_key: max.to_vec(),
            created_at,
        }
    }

    #[test]
    fn test_load_missing_manifest_is_none() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let manifest = Manifest::new(dir.path()).expect("Failed to create manifest");

        let state = manifest
            .load(&dir.path().join("data"))
            .expect("Failed to load");
        assert!(state.is_none());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let manifest = Manifest::new(dir.path()).expect("Failed to create manifest");
        let data_dir = dir.path().join("data");

        let mut levels = vec![Vec::new(); NUM_LEVELS];
        levels[0].push(info("1_aa.blk", b"a", b"m", 1));
        levels[0].push(info("2_bb.blk", b"c", b"z", 2));
        levels[2].push(info("3.blk", b"a", b"z", 3));

        let state = ManifestState {
            levels,
            current_wal: Some("42.wal".to_string()),
            last_checkpoint: 42,
        };
        manifest.save(&state).expect("Failed to save");

        let loaded = manifest
            .load(&data_dir)
            .expect("Failed to load")
            .expect("Manifest should exist");

        assert_eq!(loaded.current_wal.as_deref(), Some("42.wal"));
        assert_eq!(loaded.last_checkpoint, 42);
        assert_eq!(loaded.levels[0].len(), 2);
        assert_eq!(loaded.levels[2].len(), 1);
        assert_eq!(loaded.levels[0][0].min_key, b"a");
        assert_eq!(loaded.levels[0][1].max_key, b"z");
        assert_eq!(
            loaded.levels[0][0].path,
            data_dir.join("L0").join("1_aa.blk")
        );
        assert_eq!(loaded.levels[2][0].path, data_dir.join("L2").join("3.blk"));
    }

    #[test]
    fn test_corrupt_manifest_falls_back_to_scan() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let manifest = Manifest::new(dir.path()).expect("Failed to create manifest");

        let path = dir.path().join("manifest").join(MANIFEST_FILE);
        fs::write(&path, b"not json at all").unwrap();

        let state = manifest
            .load(&dir.path().join("data"))
            .expect("Load should not fail");
        assert!(state.is_none());
    }
}
