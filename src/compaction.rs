//! Background compaction of the leveled index.
//!
//! A pool of worker threads consumes merge tasks from a bounded queue.
//! Each task covers one over-threshold level: its blocks plus the blocks
//! in the level below whose key ranges they overlap, so that the merged
//! output can replace them all and keep the deeper level range-disjoint.
//!
//! Scheduling never blocks the write path: enqueueing waits at most the
//! configured deadline (10ms by default) and then drops the task; the
//! next cycle re-observes the level and proposes it again. A cycle is
//! also skipped outright when the queue is already deep.
//!
//! Workers merge records newest-wins (a duplicate key keeps the record
//! from the block with the larger creation timestamp), preserve tombstones
//! until a merge targets the deepest level, write one output block, commit
//! the index swap through the manifest, and only then delete the source
//! files, so concurrent reads never lose sight of live data.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::{bounded, Receiver, Sender};
use itertools::Itertools;

use crate::block::Block;
use crate::config::{CompactionConfig, NUM_LEVELS};
use crate::error::Result;
use crate::lsm::{parse_created_at, BlockInfo, LsmTree};

/// A unit of compaction work: merge `blocks` into one output block at
/// `target_level`.
#[derive(Debug, Clone)]
pub struct CompactionTask {
    pub source_level: usize,
    pub target_level: usize,
    pub blocks: Vec<BlockInfo>,
}

/// Aggregate compaction statistics.
#[derive(Debug, Clone, Default)]
pub struct CompactionStats {
    /// Number of completed compactions.
    pub compaction_count: u64,
    /// Number of source blocks merged.
    pub blocks_compacted: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Total wall time spent merging.
    pub total_time: Duration,
    /// Tasks currently waiting in the queue.
    pub tasks_in_queue: usize,
    /// Tasks currently being executed by workers.
    pub tasks_in_flight: usize,
    /// Tasks dropped because the queue stayed full past the deadline.
    pub tasks_dropped: u64,
    pub last_compaction: Option<SystemTime>,
    /// Bytes read + written per second over the most recent task.
    pub throughput: f64,
}

/// Worker pool performing level merges in the background.
pub struct CompactionManager {
    lsm: Arc<LsmTree>,
    config: CompactionConfig,
    sender: Mutex<Option<Sender<CompactionTask>>>,
    receiver: Mutex<Option<Receiver<CompactionTask>>>,
    cancel: Arc<AtomicBool>,
    stats: Arc<Mutex<CompactionStats>>,
    in_flight: Arc<AtomicUsize>,
    /// Per-level count of scheduled-but-unfinished tasks; a level is not
    /// proposed again while one of its tasks is outstanding.
    pending: Arc<Vec<AtomicUsize>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CompactionManager {
    pub fn new(lsm: Arc<LsmTree>, config: CompactionConfig) -> Self {
        let (sender, receiver) = bounded(config.queue_depth);
        Self {
            lsm,
            config,
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            cancel: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(CompactionStats::default())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            pending: Arc::new((0..NUM_LEVELS).map(|_| AtomicUsize::new(0)).collect()),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the worker threads. Called once by the engine during open.
    pub fn start(&self) {
        let receiver = match self.receiver.lock().unwrap().take() {
            Some(receiver) => receiver,
            None => return,
        };

        let mut workers = self.workers.lock().unwrap();
        for id in 0..self.config.workers {
            let receiver = receiver.clone();
            let lsm = Arc::clone(&self.lsm);
            let cancel = Arc::clone(&self.cancel);
            let stats = Arc::clone(&self.stats);
            let in_flight = Arc::clone(&self.in_flight);
            let pending = Arc::clone(&self.pending);

            let handle = std::thread::Builder::new()
                .name(format!("compaction-{id}"))
                .spawn(move || {
                    worker_loop(id, receiver, lsm, cancel, stats, in_flight, pending);
                })
                .expect("Failed to spawn compaction worker");
            workers.push(handle);
        }
    }

    /// Attempts to enqueue a task, waiting at most the configured deadline
    /// for queue space. A dropped task is counted and forgotten; the next
    /// cycle will re-observe its level.
    pub fn schedule(&self, task: CompactionTask) {
        if task.blocks.is_empty() {
            return;
        }

        let guard = self.sender.lock().unwrap();
        let Some(sender) = guard.as_ref() else {
            return;
        };

        let source_level = task.source_level;
        self.pending[source_level].fetch_add(1, Ordering::SeqCst);

        match sender.send_timeout(task, self.config.schedule_timeout) {
            Ok(()) => {
                let mut stats = self.stats.lock().unwrap();
                stats.tasks_in_queue = sender.len();
            }
            Err(e) => {
                self.pending[source_level].fetch_sub(1, Ordering::SeqCst);
                let mut stats = self.stats.lock().unwrap();
                stats.tasks_dropped += 1;
                drop(stats);
                tracing::warn!(
                    source_level,
                    error = %e,
                    "Compaction queue full, dropping task"
                );
            }
        }
    }

    /// Runs one scheduling cycle: picks the first over-threshold level
    /// with no task outstanding and enqueues its merge. Only one level is
    /// scheduled per cycle so level 0 drains first.
    pub fn run_cycle(&self) -> Result<()> {
        let queued = self
            .sender
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, |sender| sender.len());
        if queued > 2 * self.config.workers {
            tracing::debug!(queued, "Skipping compaction cycle, queue is deep");
            return Ok(());
        }

        for level in 0..NUM_LEVELS - 1 {
            if self.pending[level].load(Ordering::SeqCst) > 0 {
                continue;
            }
            if !self.lsm.should_compact(level) {
                continue;
            }
            let blocks = self.lsm.level_blocks(level);
            if blocks.is_empty() {
                continue;
            }

            if level == 0 && blocks.len() > self.config.level0_split_threshold {
                if let Some((first, second)) = self.split_level0(&blocks) {
                    tracing::info!(
                        blocks = blocks.len(),
                        "Splitting level 0 compaction into two tasks"
                    );
                    self.schedule(first);
                    self.schedule(second);
                    return Ok(());
                }
            }

            self.schedule(self.task_for(level, blocks));
            return Ok(());
        }

        Ok(())
    }

    /// Builds the task for merging `blocks` from `level` into the level
    /// below, pulling in the target blocks their ranges overlap.
    fn task_for(&self, level: usize, blocks: Vec<BlockInfo>) -> CompactionTask {
        let mut task_blocks = blocks;
        if let Some((min, max)) = key_span(&task_blocks) {
            let overlapping = self.lsm.overlapping_blocks(level + 1, &min, &max);
            task_blocks.extend(overlapping);
        }
        CompactionTask {
            source_level: level,
            target_level: level + 1,
            blocks: task_blocks,
        }
    }

    /// Splits a large level 0 into two independent tasks when the halves'
    /// key ranges (and therefore their target overlaps) are disjoint.
    /// Overlapping halves would produce two overlapping outputs at level
    /// 1, so they merge as a single task instead.
    fn split_level0(&self, blocks: &[BlockInfo]) -> Option<(CompactionTask, CompactionTask)> {
        let mid = (blocks.len() + 1) / 2;
        let first_half = blocks[..mid].to_vec();
        let second_half = blocks[mid..].to_vec();

        let (first_min, first_max) = key_span(&first_half)?;
        let (second_min, second_max) = key_span(&second_half)?;
        let ranges_disjoint = first_max < second_min || second_max < first_min;
        if !ranges_disjoint {
            return None;
        }

        let first = self.task_for(0, first_half);
        let second = self.task_for(0, second_half);

        // A target block spanning the gap between the halves would land in
        // both tasks; merge as one task in that case.
        let shared = first.blocks.iter().any(|a| {
            second.blocks.iter().any(|b| a.path == b.path)
        });
        if shared {
            return None;
        }

        Some((first, second))
    }

    /// Snapshot of the statistics with live queue gauges.
    pub fn stats(&self) -> CompactionStats {
        let mut stats = self.stats.lock().unwrap().clone();
        stats.tasks_in_queue = self
            .sender
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, |sender| sender.len());
        stats.tasks_in_flight = self.in_flight.load(Ordering::SeqCst);
        stats
    }

    /// Whether no tasks are queued, executing, or scheduled-but-unclaimed.
    /// The pending marks cover the window between a worker claiming a task
    /// and recording it in flight.
    pub fn is_idle(&self) -> bool {
        self.pending
            .iter()
            .all(|count| count.load(Ordering::SeqCst) == 0)
            && self.in_flight.load(Ordering::SeqCst) == 0
    }

    /// Signals cancellation, closes the queue, and joins all workers.
    /// Safe to call twice.
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        self.sender.lock().unwrap().take();

        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Compaction worker panicked during shutdown");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    id: usize,
    receiver: Receiver<CompactionTask>,
    lsm: Arc<LsmTree>,
    cancel: Arc<AtomicBool>,
    stats: Arc<Mutex<CompactionStats>>,
    in_flight: Arc<AtomicUsize>,
    pending: Arc<Vec<AtomicUsize>>,
) {
    while let Ok(task) = receiver.recv() {
        if cancel.load(Ordering::SeqCst) {
            pending[task.source_level].fetch_sub(1, Ordering::SeqCst);
            continue;
        }

        in_flight.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();
        let result = run_task(&lsm, &task);
        let duration = start.elapsed();

        match result {
            Ok((bytes_read, bytes_written)) => {
                let mut stats = stats.lock().unwrap();
                stats.compaction_count += 1;
                stats.blocks_compacted += task.blocks.len() as u64;
                stats.bytes_read += bytes_read;
                stats.bytes_written += bytes_written;
                stats.total_time += duration;
                stats.last_compaction = Some(SystemTime::now());
                stats.throughput =
                    (bytes_read + bytes_written) as f64 / duration.as_secs_f64().max(1e-9);
                drop(stats);

                tracing::info!(
                    worker = id,
                    source_level = task.source_level,
                    target_level = task.target_level,
                    blocks = task.blocks.len(),
                    bytes_read,
                    bytes_written,
                    ?duration,
                    "Compaction completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    worker = id,
                    source_level = task.source_level,
                    error = %e,
                    "Compaction failed"
                );
            }
        }

        in_flight.fetch_sub(1, Ordering::SeqCst);
        pending[task.source_level].fetch_sub(1, Ordering::SeqCst);
    }
}

/// Merges the task's blocks into one output at the target level, commits
/// the index swap, and deletes the source files. Returns bytes read and
/// written.
fn run_task(lsm: &LsmTree, task: &CompactionTask) -> Result<(u64, u64)> {
    // Newest block first so duplicate keys keep the freshest record.
    let mut inputs = task.blocks.clone();
    inputs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let mut bytes_read = 0u64;
    let mut runs = Vec::with_capacity(inputs.len());
    let mut merged_created_at = 0u64;
    for (rank, info) in inputs.iter().enumerate() {
        let file = File::open(&info.path)?;
        let mut reader = BufReader::new(file);
        let block = Block::decode(&mut reader)?;
        bytes_read += info.size;
        merged_created_at = merged_created_at.max(info.created_at);

        let records: Vec<_> = block
            .into_records()
            .into_iter()
            .map(|(key, value)| (key, rank, value))
            .collect();
        runs.push(records);
    }

    // K-way merge over the sorted runs; ties on key are won by the lower
    // rank, i.e. the newer block.
    let drop_tombstones = task.target_level == NUM_LEVELS - 1;
    let mut output = Block::new();
    let merged = runs
        .into_iter()
        .map(|run| run.into_iter())
        .kmerge_by(|a, b| (a.0.as_slice(), a.1) < (b.0.as_slice(), b.1))
        .dedup_by(|a, b| a.0 == b.0);
    for (key, _, value) in merged {
        if drop_tombstones && value.is_none() {
            continue;
        }
        output.add(key, value);
    }

    let added = if output.is_empty() {
        None
    } else {
        let info = write_output(lsm, task.target_level, output, merged_created_at)?;
        Some(info)
    };
    let bytes_written = added.as_ref().map_or(0, |info| info.size);

    lsm.apply_compaction(&task.blocks, task.target_level, added)?;

    // Source files are unreachable once the index swap is committed.
    for info in &task.blocks {
        if let Err(e) = fs::remove_file(&info.path) {
            tracing::warn!(
                path = %info.path.display(),
                error = %e,
                "Failed to delete compacted block file"
            );
        }
    }

    Ok((bytes_read, bytes_written))
}

/// Encodes the merged block into the target level directory. The file
/// name carries the newest input's creation timestamp so later merges
/// still resolve duplicate keys newest-wins against level 0.
fn write_output(
    lsm: &LsmTree,
    target_level: usize,
    mut output: Block,
    created_at: u64,
) -> Result<BlockInfo> {
    let level_dir = lsm.level_dir(target_level);
    fs::create_dir_all(&level_dir)?;

    let mut created_at = created_at;
    let mut path: PathBuf = level_dir.join(format!("{created_at}.blk"));
    while path.exists() {
        created_at += 1;
        path = level_dir.join(format!("{created_at}.blk"));
    }

    let tmp_path = path.with_extension("blk.tmp");
    let mut file = File::create(&tmp_path)?;
    output.encode(&mut file)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp_path, &path)?;

    let size = fs::metadata(&path)?.len();
    Ok(BlockInfo {
        path: path.clone(),
        size,
        min_key: output.min_key().to_vec(),
        max_key: output.max_key().to_vec(),
        created_at: parse_created_at(&path).unwrap_or(created_at),
    })
}

/// Overall `[min, max]` key span of a set of blocks.
fn key_span(blocks: &[BlockInfo]) -> Option<(Vec<u8>, Vec<u8>)> {
    let min = blocks.iter().map(|info| &info.min_key).min()?.clone();
    let max = blocks.iter().map(|info| &info.max_key).max()?.clone();
    Some((min, max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open_lsm(dir: &Path, level_base: u64) -> Arc<LsmTree> {
        let config = EngineConfig::new(dir).level_base_size(level_base);
        Arc::new(LsmTree::open(dir, &config).expect("Failed to open LSM"))
    }

    fn write_block(lsm: &LsmTree, entries: &[(&[u8], Option<&[u8]>)]) {
        let mut block = Block::new();
        for &(key, value) in entries {
            block.add(key.to_vec(), value.map(|v| v.to_vec()));
        }
        lsm.write(block).expect("Failed to write block");
    }

    fn wait_idle(manager: &CompactionManager) {
        for _ in 0..200 {
            if manager.is_idle() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("Compaction did not reach quiescence");
    }

    #[test]
    fn test_merge_prefers_newest_record() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        // Tiny cap so two small blocks cross the threshold.
        let lsm = open_lsm(dir.path(), 64);
        write_block(&lsm, &[(b"key", Some(b"old")), (b"other", Some(b"x"))]);
        write_block(&lsm, &[(b"key", Some(b"new"))]);

        let manager = CompactionManager::new(Arc::clone(&lsm), CompactionConfig::default());
        manager.start();
        manager.run_cycle().expect("Cycle failed");
        wait_idle(&manager);
        manager.stop();

        let (_, counts) = lsm.level_totals();
        assert_eq!(counts[0], 0, "L0 should be drained");
        assert_eq!(counts[1], 1, "L1 should hold the merged output");
        assert_eq!(lsm.read(b"key").unwrap(), Some(b"new".to_vec()));
        assert_eq!(lsm.read(b"other").unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn test_source_files_deleted_after_merge() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lsm = open_lsm(dir.path(), 64);
        write_block(&lsm, &[(b"a", Some(b"1"))]);
        write_block(&lsm, &[(b"b", Some(b"2"))]);
        let sources = lsm.level_blocks(0);

        let manager = CompactionManager::new(Arc::clone(&lsm), CompactionConfig::default());
        manager.start();
        manager.run_cycle().expect("Cycle failed");
        wait_idle(&manager);
        manager.stop();

        for info in sources {
            assert!(!info.path.exists(), "source {} should be deleted", info.path.display());
        }

        let stats = manager.stats();
        assert_eq!(stats.compaction_count, 1);
        assert_eq!(stats.blocks_compacted, 2);
        assert!(stats.bytes_read > 0);
        assert!(stats.bytes_written > 0);
        assert!(stats.last_compaction.is_some());
    }

    #[test]
    fn test_tombstones_preserved_above_deepest_level() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lsm = open_lsm(dir.path(), 64);
        write_block(&lsm, &[(b"key", Some(b"value"))]);
        write_block(&lsm, &[(b"key", None)]);

        let manager = CompactionManager::new(Arc::clone(&lsm), CompactionConfig::default());
        manager.start();
        manager.run_cycle().expect("Cycle failed");
        wait_idle(&manager);
        manager.stop();

        // The merge targets L1, not the deepest level, so the tombstone
        // must survive and keep shadowing the key.
        let (_, counts) = lsm.level_totals();
        assert_eq!(counts[1], 1);
        assert_eq!(lsm.read(b"key").unwrap(), None);
    }

    #[test]
    fn test_tombstones_dropped_at_deepest_level() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lsm = open_lsm(dir.path(), 64);
        write_block(&lsm, &[(b"gone", None), (b"kept", Some(b"v"))]);
        let sources = lsm.level_blocks(0);

        // Merge straight into the deepest level.
        let manager = CompactionManager::new(Arc::clone(&lsm), CompactionConfig::default());
        manager.start();
        manager.schedule(CompactionTask {
            source_level: 0,
            target_level: NUM_LEVELS - 1,
            blocks: sources,
        });
        wait_idle(&manager);
        manager.stop();

        let (_, counts) = lsm.level_totals();
        assert_eq!(counts[NUM_LEVELS - 1], 1);
        assert_eq!(lsm.read(b"kept").unwrap(), Some(b"v".to_vec()));
        assert_eq!(lsm.read(b"gone").unwrap(), None);

        // The deepest block must not contain the tombstone record.
        let deepest = lsm.level_blocks(NUM_LEVELS - 1);
        let file = File::open(&deepest[0].path).unwrap();
        let block = Block::decode(&mut BufReader::new(file)).unwrap();
        assert_eq!(block.count(), 1);
    }

    #[test]
    fn test_cycle_skips_levels_below_threshold() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        // Large cap: nothing should be proposed.
        let lsm = open_lsm(dir.path(), 64 * 1024 * 1024);
        write_block(&lsm, &[(b"key", Some(b"value"))]);

        let manager = CompactionManager::new(Arc::clone(&lsm), CompactionConfig::default());
        manager.start();
        manager.run_cycle().expect("Cycle failed");
        wait_idle(&manager);
        manager.stop();

        let stats = manager.stats();
        assert_eq!(stats.compaction_count, 0);
        let (_, counts) = lsm.level_totals();
        assert_eq!(counts[0], 1);
    }

    #[test]
    fn test_merge_into_occupied_target_keeps_disjointness() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lsm = open_lsm(dir.path(), 64);
        let manager = CompactionManager::new(Arc::clone(&lsm), CompactionConfig::default());
        manager.start();

        // First round populates L1.
        write_block(&lsm, &[(b"a", Some(b"1")), (b"m", Some(b"2"))]);
        manager.run_cycle().expect("Cycle failed");
        wait_idle(&manager);

        // Second round overlaps the resident L1 block; the task must pull
        // it in and leave a single disjoint block behind.
        write_block(&lsm, &[(b"b", Some(b"3")), (b"z", Some(b"4"))]);
        manager.run_cycle().expect("Cycle failed");
        wait_idle(&manager);
        manager.stop();

        let level1 = lsm.level_blocks(1);
        assert_eq!(level1.len(), 1);
        for key in [b"a".as_slice(), b"m", b"b", b"z"] {
            assert!(lsm.read(key).unwrap().is_some(), "missing key {key:?}");
        }
    }

    #[test]
    fn test_stop_is_idempotent() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lsm = open_lsm(dir.path(), 1024);
        let manager = CompactionManager::new(lsm, CompactionConfig::default());
        manager.start();
        manager.stop();
        manager.stop();

        // Scheduling after stop is a silent no-op.
        manager.schedule(CompactionTask {
            source_level: 0,
            target_level: 1,
            blocks: vec![],
        });
    }
}
