//! Leveled index of immutable block files.
//!
//! Blocks are organized into seven levels under `data/L0..L6`. Level 0
//! receives memtable flushes and may hold blocks with overlapping key
//! ranges, ordered by creation time. Levels 1..6 hold range-disjoint
//! blocks sorted by minimum key, so a point lookup binary-searches them.
//! Level `i` is capped at `level_base_size * 4^i` bytes and proposes
//! compaction at 75% of the cap.
//!
//! # Read Order
//!
//! A lookup consults level 0 newest-to-oldest across every block whose
//! `[min_key, max_key]` range contains the key, then levels 1..6 via
//! binary search. The first hit wins; a tombstone hit means the key is
//! deleted and deeper levels are not consulted.
//!
//! # Crash Safety
//!
//! Block files are written to a temporary name, fsynced, and renamed into
//! place. The manifest is persisted after every index mutation; on open it
//! is the authoritative catalog and any block file it does not mention is
//! swept as an orphan. Without a manifest the index is rebuilt by scanning
//! the level directories and reading each block's header.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::block::Block;
use crate::config::{EngineConfig, NUM_LEVELS};
use crate::error::Result;
use crate::manifest::{Manifest, ManifestState};

/// Metadata for one on-disk block file, owned by a level vector.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockInfo {
    pub path: PathBuf,
    pub size: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    /// Unix nanos parsed from the file name; orders level 0 and resolves
    /// duplicate keys during merges (newer wins).
    pub created_at: u64,
}

impl BlockInfo {
    /// File name within its level directory.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Whether `key` falls within this block's `[min_key, max_key]` range.
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.min_key.as_slice() && key <= self.max_key.as_slice()
    }

    /// Whether this block's range intersects `[min, max]`.
    pub fn overlaps(&self, min: &[u8], max: &[u8]) -> bool {
        self.min_key.as_slice() <= max && self.max_key.as_slice() >= min
    }
}

/// Seven-level catalog of block files with point lookup.
pub struct LsmTree {
    data_dir: PathBuf,
    thresholds: [u64; NUM_LEVELS],
    levels: RwLock<Vec<Vec<BlockInfo>>>,
    manifest: Manifest,
    /// Current WAL segment and last checkpoint timestamp, carried into
    /// every manifest save.
    wal_state: Mutex<(Option<String>, u64)>,
}

impl LsmTree {
    /// Opens the index under `base_dir`, rebuilding it from the manifest
    /// when one exists (sweeping orphaned block files), or from a
    /// directory scan otherwise.
    pub fn open(base_dir: &Path, config: &EngineConfig) -> Result<Self> {
        let data_dir = base_dir.join("data");
        fs::create_dir_all(&data_dir)?;

        let mut thresholds = [0u64; NUM_LEVELS];
        for (level, threshold) in thresholds.iter_mut().enumerate() {
            *threshold = config.compaction_threshold(level);
        }

        let manifest = Manifest::new(base_dir)?;

        let levels = match manifest.load(&data_dir)? {
            Some(state) if Self::blocks_present(&state) => {
                Self::sweep_orphans(&data_dir, &state);
                state.levels
            }
            Some(_) => {
                tracing::warn!("Manifest names missing block files, rescanning data directories");
                Self::scan_levels(&data_dir)?
            }
            None => Self::scan_levels(&data_dir)?,
        };

        let block_count: usize = levels.iter().map(|l| l.len()).sum();
        tracing::info!(block_count, "Opened block index");

        Ok(Self {
            data_dir,
            thresholds,
            levels: RwLock::new(levels),
            manifest,
            wal_state: Mutex::new((None, 0)),
        })
    }

    fn blocks_present(state: &ManifestState) -> bool {
        state
            .levels
            .iter()
            .flatten()
            .all(|info| info.path.exists())
    }

    /// Deletes `.blk` files the manifest does not mention. Such files were
    /// left by a crash between a block write and the manifest save; their
    /// contents are still recoverable from the WAL or the source blocks.
    fn sweep_orphans(data_dir: &Path, state: &ManifestState) {
        let known: std::collections::HashSet<&Path> = state
            .levels
            .iter()
            .flatten()
            .map(|info| info.path.as_path())
            .collect();

        for level in 0..NUM_LEVELS {
            let level_dir = data_dir.join(format!("L{level}"));
            let Ok(entries) = fs::read_dir(&level_dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("blk") {
                    continue;
                }
                if !known.contains(path.as_path()) {
                    tracing::warn!(path = %path.display(), "Removing orphaned block file");
                    if let Err(e) = fs::remove_file(&path) {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to remove orphaned block");
                    }
                }
            }
        }
    }

    /// Rebuilds the level vectors by reading block headers off disk.
    fn scan_levels(data_dir: &Path) -> Result<Vec<Vec<BlockInfo>>> {
        let mut levels = vec![Vec::new(); NUM_LEVELS];

        for (level, blocks) in levels.iter_mut().enumerate() {
            let level_dir = data_dir.join(format!("L{level}"));
            let Ok(entries) = fs::read_dir(&level_dir) else {
                continue;
            };

            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("blk") {
                    continue;
                }
                match read_block_info(&path) {
                    Ok(info) => blocks.push(info),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable block file");
                    }
                }
            }

            if level == 0 {
                blocks.sort_by_key(|info| info.created_at);
            } else {
                blocks.sort_by(|a, b| a.min_key.cmp(&b.min_key));
            }
        }

        Ok(levels)
    }

    /// Finalizes and writes a flushed block into level 0. Returns true
    /// when level 0 crossed its compaction threshold.
    pub fn write(&self, mut block: Block) -> Result<bool> {
        if block.is_empty() {
            return Ok(false);
        }
        block.finalize()?;

        let level_dir = self.data_dir.join("L0");
        fs::create_dir_all(&level_dir)?;

        let created_at = unix_nanos();
        let path = level_dir.join(format!("{}_{}.blk", created_at, block.id()));
        let tmp_path = path.with_extension("blk.tmp");

        let mut file = File::create(&tmp_path)?;
        block.encode(&mut file)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, &path)?;

        let size = fs::metadata(&path)?.len();
        let info = BlockInfo {
            path,
            size,
            min_key: block.min_key().to_vec(),
            max_key: block.max_key().to_vec(),
            created_at,
        };

        let mut levels = self.levels.write().unwrap();
        levels[0].push(info);
        self.persist_manifest(&levels)?;
        let hot = self.level_size(&levels[0]) >= self.thresholds[0];
        drop(levels);

        tracing::debug!(records = block.count(), "Wrote block to L0");
        Ok(hot)
    }

    /// Point lookup across all levels. A tombstone hit answers `None`
    /// without consulting deeper levels.
    pub fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let levels = self.levels.read().unwrap();

        // Level 0 blocks may overlap; scan newest first.
        for info in levels[0].iter().rev() {
            if !info.contains(key) {
                continue;
            }
            if let Some(value) = read_key_from_block(&info.path, key)? {
                return Ok(value);
            }
        }

        // Deeper levels are range-disjoint and sorted by min_key.
        for blocks in levels.iter().skip(1) {
            let idx = blocks.partition_point(|info| info.min_key.as_slice() <= key);
            if idx == 0 {
                continue;
            }
            let info = &blocks[idx - 1];
            if !info.contains(key) {
                continue;
            }
            if let Some(value) = read_key_from_block(&info.path, key)? {
                return Ok(value);
            }
        }

        Ok(None)
    }

    /// Whether the level's byte total has reached its compaction
    /// threshold (75% of the level cap).
    pub fn should_compact(&self, level: usize) -> bool {
        let levels = self.levels.read().unwrap();
        self.level_size(&levels[level]) >= self.thresholds[level]
    }

    /// Snapshot of one level's block metadata.
    pub fn level_blocks(&self, level: usize) -> Vec<BlockInfo> {
        self.levels.read().unwrap()[level].clone()
    }

    /// Blocks in `level` whose ranges intersect `[min, max]`.
    pub fn overlapping_blocks(&self, level: usize, min: &[u8], max: &[u8]) -> Vec<BlockInfo> {
        self.levels.read().unwrap()[level]
            .iter()
            .filter(|info| info.overlaps(min, max))
            .cloned()
            .collect()
    }

    /// Per-level byte sums and block counts, for stats.
    pub fn level_totals(&self) -> ([u64; NUM_LEVELS], [usize; NUM_LEVELS]) {
        let levels = self.levels.read().unwrap();
        let mut sizes = [0u64; NUM_LEVELS];
        let mut counts = [0usize; NUM_LEVELS];
        for (level, blocks) in levels.iter().enumerate() {
            sizes[level] = self.level_size(blocks);
            counts[level] = blocks.len();
        }
        (sizes, counts)
    }

    /// Commits a finished compaction: removes the merged source blocks
    /// from the index, inserts the output (if the merge produced one) into
    /// the target level in min-key order, and persists the manifest. The
    /// caller deletes the source files only after this returns, so
    /// concurrent reads never lose sight of live data.
    pub fn apply_compaction(
        &self,
        removed: &[BlockInfo],
        target_level: usize,
        added: Option<BlockInfo>,
    ) -> Result<()> {
        let mut levels = self.levels.write().unwrap();

        // Stage the swap on a copy: a rejected commit must leave the live
        // index exactly as it was, or every later lookup would binary
        // search over ranges that no longer hold.
        let mut candidate = levels.clone();
        for blocks in candidate.iter_mut() {
            blocks.retain(|info| !removed.iter().any(|r| r.path == info.path));
        }
        if let Some(info) = added {
            let blocks = &mut candidate[target_level];
            let idx = blocks.partition_point(|b| b.min_key < info.min_key);
            blocks.insert(idx, info);
        }
        self.validate_levels(&candidate)?;

        *levels = candidate;
        self.persist_manifest(&levels)?;
        Ok(())
    }

    /// Records the current WAL segment and checkpoint timestamp in the
    /// manifest.
    pub fn record_wal_state(&self, current_wal: Option<String>, last_checkpoint: u64) -> Result<()> {
        *self.wal_state.lock().unwrap() = (current_wal, last_checkpoint);
        let levels = self.levels.read().unwrap();
        self.persist_manifest(&levels)
    }

    /// Persists the manifest one final time.
    pub fn close(&self) -> Result<()> {
        let levels = self.levels.read().unwrap();
        self.persist_manifest(&levels)
    }

    fn level_size(&self, blocks: &[BlockInfo]) -> u64 {
        blocks.iter().map(|info| info.size).sum()
    }

    fn persist_manifest(&self, levels: &[Vec<BlockInfo>]) -> Result<()> {
        let (current_wal, last_checkpoint) = self.wal_state.lock().unwrap().clone();
        self.manifest.save(&ManifestState {
            levels: levels.to_vec(),
            current_wal,
            last_checkpoint,
        })
    }

    /// Checks the structural invariants: ordered min/max per block, and
    /// sorted, pairwise-disjoint ranges in levels 1..6.
    fn validate_levels(&self, levels: &[Vec<BlockInfo>]) -> Result<()> {
        for (level, blocks) in levels.iter().enumerate() {
            for info in blocks {
                if info.min_key > info.max_key {
                    return Err(crate::errcorrupt!(
                        "block {} has min_key above max_key",
                        info.path.display()
                    ));
                }
            }
            if level == 0 {
                continue;
            }
            for pair in blocks.windows(2) {
                if pair[0].max_key >= pair[1].min_key {
                    return Err(crate::errcorrupt!(
                        "overlapping blocks in L{level}: {} and {}",
                        pair[0].path.display(),
                        pair[1].path.display()
                    ));
                }
            }
        }
        Ok(())
    }

    /// Directory a level's blocks live in.
    pub fn level_dir(&self, level: usize) -> PathBuf {
        self.data_dir.join(format!("L{level}"))
    }
}

/// Reads one block's metadata off disk for index reconstruction.
fn read_block_info(path: &Path) -> Result<BlockInfo> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    let mtime_nanos = file
        .metadata()?
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos() as u64);

    let mut reader = BufReader::new(file);
    let (_, stats) = Block::read_meta(&mut reader)?;

    Ok(BlockInfo {
        path: path.to_path_buf(),
        size,
        min_key: stats.min_key,
        max_key: stats.max_key,
        created_at: parse_created_at(path).unwrap_or(mtime_nanos),
    })
}

/// Extracts the creation nanos prefix from a block file name
/// (`<nanos>.blk` or `<nanos>_<id>.blk`).
pub(crate) fn parse_created_at(path: &Path) -> Option<u64> {
    path.file_stem()?
        .to_str()?
        .split('_')
        .next()?
        .parse::<u64>()
        .ok()
}

fn read_key_from_block(path: &Path, key: &[u8]) -> Result<Option<Option<Vec<u8>>>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let block = Block::decode(&mut reader)?;
    Ok(block.get(key).map(|value| value.map(|v| v.to_vec())))
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}
