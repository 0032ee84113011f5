//! The storage engine facade.
//!
//! Coordinates the WAL, memtable, checkpoint, block index and compaction
//! into a single crash-safe key-value store.
//!
//! # Write Path
//!
//! ```text
//! put/delete -> WAL append (fsync) -> memtable -> size check -> flush signal
//! ```
//!
//! The WAL-before-memtable rule is the durability invariant: no mutation
//! becomes visible to readers before its log record is on disk. Once a
//! put or delete returns, a crash at any later instant recovers it.
//!
//! # Read Path
//!
//! Memtable first (a tombstone hit answers "not found" immediately), then
//! the leveled index: level 0 newest-first, deeper levels by binary
//! search.
//!
//! # Recovery
//!
//! Open loads the last checkpoint, then replays only the WAL records
//! newer than the checkpoint's high-water timestamp. The block index is
//! rebuilt from the manifest (or a directory scan) independently.
//!
//! # Background Work
//!
//! Three kinds of threads run behind the API: a flusher draining a
//! single-slot signal, a checkpointer ticking every 500ms, and the
//! compaction worker pool. All are signalled and joined on close.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};

use crate::block::Block;
use crate::checkpoint::Checkpoint;
use crate::compaction::{CompactionManager, CompactionStats};
use crate::config::{EngineConfig, MAX_ENTRY_SIZE, NUM_LEVELS};
use crate::errinput;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::lsm::LsmTree;
use crate::memtable::Memtable;
use crate::wal::{Wal, WalOp};

/// A point-in-time snapshot of engine statistics.
#[derive(Debug, Clone)]
pub struct Stats {
    pub memtable_size: u64,
    pub memtable_keys: usize,
    pub level_sizes: [u64; NUM_LEVELS],
    pub level_blocks: [usize; NUM_LEVELS],
    pub compaction: CompactionStats,
}

/// State covered by the engine's read-write lock.
struct EngineState {
    memtable: Arc<Memtable>,
    /// Timestamp of the highest WAL record applied to the memtable.
    last_wal_timestamp: u64,
    closed: bool,
}

/// Everything the background threads share with the facade.
struct Shared {
    config: EngineConfig,
    state: RwLock<EngineState>,
    wal: Wal,
    lsm: Arc<LsmTree>,
    checkpoint: Checkpoint,
    compaction: CompactionManager,
    /// True between the flusher's memtable swap and the block reaching
    /// level 0. The checkpointer skips its tick in that window so a
    /// checkpoint can never cover records whose only durable home is an
    /// unwritten block.
    flush_in_progress: AtomicBool,
}

/// Embeddable crash-safe key-value storage engine.
pub struct Engine {
    shared: Arc<Shared>,
    flush_tx: Sender<()>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    _lock: FileLock,
    /// WAL records applied during the last recovery.
    #[allow(dead_code)]
    replayed_on_open: usize,
}

impl Engine {
    /// Opens (or creates) an engine over `base_dir` with default
    /// configuration.
    pub fn open(base_dir: impl Into<std::path::PathBuf>) -> Result<Self> {
        Self::open_with_config(EngineConfig::new(base_dir))
    }

    /// Opens (or creates) an engine with the given configuration, running
    /// recovery and starting the background threads.
    pub fn open_with_config(config: EngineConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;

        let lock = FileLock::acquire(&config.dir)?;

        let lsm = Arc::new(LsmTree::open(&config.dir, &config)?);
        let wal = Wal::open(config.dir.join("wal"), config.max_wal_file_size)?;
        let checkpoint = Checkpoint::new(&config.dir)?;
        let compaction = CompactionManager::new(Arc::clone(&lsm), config.compaction.clone());

        // Recovery: checkpoint snapshot first, then the WAL records it
        // does not cover.
        let snapshot = checkpoint.load()?;
        let memtable = Memtable::new();
        for (key, value) in snapshot.entries {
            memtable.put(key, value);
        }

        let mut last_wal_timestamp = snapshot.last_wal_timestamp;
        let mut replayed = 0usize;
        wal.replay_from(snapshot.last_wal_timestamp, |record| {
            match record.op {
                WalOp::Put => memtable.put(record.key, record.value),
                WalOp::Delete => memtable.put(record.key, None),
            }
            last_wal_timestamp = record.timestamp;
            replayed += 1;
            Ok(())
        })?;

        tracing::info!(
            dir = %config.dir.display(),
            checkpoint_entries = memtable.len(),
            replayed,
            "Engine recovered"
        );

        let shared = Arc::new(Shared {
            state: RwLock::new(EngineState {
                memtable: Arc::new(memtable),
                last_wal_timestamp,
                closed: false,
            }),
            wal,
            lsm,
            checkpoint,
            compaction,
            config,
            flush_in_progress: AtomicBool::new(false),
        });

        shared.compaction.start();

        let (flush_tx, flush_rx) = bounded(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let mut threads = Vec::new();
        threads.push(spawn_flusher(Arc::clone(&shared), flush_rx, shutdown_rx.clone()));
        threads.push(spawn_checkpointer(Arc::clone(&shared), shutdown_rx));

        Ok(Self {
            shared,
            flush_tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            threads: Mutex::new(threads),
            _lock: lock,
            replayed_on_open: replayed,
        })
    }

    /// Stores a key-value pair. Durable once this returns.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        validate_key(key)?;
        if value.len() > MAX_ENTRY_SIZE {
            return Err(errinput!("value exceeds {MAX_ENTRY_SIZE} byte cap"));
        }

        let mut state = self.shared.state.write().unwrap();
        if state.closed {
            return Err(Error::Closed);
        }

        let timestamp = self.shared.wal.append_put(key, value)?;
        state.memtable.put(key.to_vec(), Some(value.to_vec()));
        state.last_wal_timestamp = timestamp;

        if state.memtable.size() >= self.shared.config.max_memtable_size {
            // Non-blocking: a full slot means a flush is already queued.
            let _ = self.flush_tx.try_send(());
        }

        Ok(())
    }

    /// Retrieves the value for a key, or `None` if absent or deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;

        {
            let state = self.shared.state.read().unwrap();
            if state.closed {
                return Err(Error::Closed);
            }
            match state.memtable.get(key) {
                Some(Some(value)) => return Ok(Some(value)),
                // Tombstone: the key is deleted no matter what deeper
                // levels still hold.
                Some(None) => return Ok(None),
                None => {}
            }
        }

        // The engine lock is released; the index has its own.
        self.shared.lsm.read(key)
    }

    /// Deletes a key. Durable once this returns; the deletion shadows any
    /// older value already flushed to disk.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        validate_key(key)?;

        let mut state = self.shared.state.write().unwrap();
        if state.closed {
            return Err(Error::Closed);
        }

        let timestamp = self.shared.wal.append_delete(key)?;
        state.memtable.put(key.to_vec(), None);
        state.last_wal_timestamp = timestamp;

        if state.memtable.size() >= self.shared.config.max_memtable_size {
            let _ = self.flush_tx.try_send(());
        }

        Ok(())
    }

    /// Flushes the memtable to a level 0 block. Returns false when there
    /// was nothing to flush.
    pub fn flush(&self) -> Result<bool> {
        if self.shared.state.read().unwrap().closed {
            return Err(Error::Closed);
        }
        self.shared.flush_memtable()
    }

    /// Takes a checkpoint of the current memtable immediately, without
    /// waiting for the periodic checkpointer.
    pub fn checkpoint(&self) -> Result<()> {
        if self.shared.state.read().unwrap().closed {
            return Err(Error::Closed);
        }
        self.shared.checkpoint_now()
    }

    /// Runs one compaction scheduling cycle from the caller's thread.
    pub fn run_compaction(&self) -> Result<()> {
        if self.shared.state.read().unwrap().closed {
            return Err(Error::Closed);
        }
        self.shared.compaction.run_cycle()
    }

    /// Engine statistics snapshot.
    pub fn stats(&self) -> Stats {
        let (memtable_size, memtable_keys) = {
            let state = self.shared.state.read().unwrap();
            (state.memtable.size() as u64, state.memtable.len())
        };
        let (level_sizes, level_blocks) = self.shared.lsm.level_totals();

        Stats {
            memtable_size,
            memtable_keys,
            level_sizes,
            level_blocks,
            compaction: self.shared.compaction.stats(),
        }
    }

    /// Closes the engine: final checkpoint, final flush, background
    /// threads stopped and joined. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.write().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;

            // Final checkpoint while the write lock still excludes
            // writers, so the snapshot is exact.
            let entries = state.memtable.entries();
            let size = state.memtable.size() as u64;
            if let Err(e) =
                self.shared
                    .checkpoint
                    .save(&entries, size, state.last_wal_timestamp)
            {
                tracing::error!(error = %e, "Final checkpoint failed during close");
            }

            // Final flush: swap the memtable out and write it below.
            let memtable = std::mem::replace(&mut state.memtable, Arc::new(Memtable::new()));
            drop(state);

            if !memtable.is_empty() {
                let mut block = Block::new();
                for (key, value) in memtable.entries() {
                    block.add(key, value);
                }
                if let Err(e) = self.shared.lsm.write(block) {
                    tracing::error!(error = %e, "Final flush failed during close");
                }
            }
        }

        // Stop the flusher and checkpointer.
        self.shutdown_tx.lock().unwrap().take();
        for handle in self.threads.lock().unwrap().drain(..) {
            if handle.join().is_err() {
                tracing::error!("Background thread panicked during close");
            }
        }

        self.shared.compaction.stop();

        if let Err(e) = self.shared.wal.close() {
            tracing::error!(error = %e, "Failed to close WAL");
        }
        if let Err(e) = self.shared.lsm.close() {
            tracing::error!(error = %e, "Failed to close block index");
        }

        tracing::info!("Engine closed");
    }

    /// Tears the engine down without the final checkpoint or flush,
    /// leaving the directory exactly as a crash would.
    #[cfg(test)]
    fn simulate_crash(&self) {
        self.shared.state.write().unwrap().closed = true;
        self.shutdown_tx.lock().unwrap().take();
        for handle in self.threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        self.shared.compaction.stop();
        let _ = self.shared.wal.close();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    /// Swaps the memtable out and writes its contents as a level 0
    /// block. Returns false when the memtable was empty.
    fn flush_memtable(&self) -> Result<bool> {
        let memtable = {
            let mut state = self.state.write().unwrap();
            if state.memtable.is_empty() {
                return Ok(false);
            }
            self.flush_in_progress.store(true, Ordering::SeqCst);
            std::mem::replace(&mut state.memtable, Arc::new(Memtable::new()))
        };

        let result = (|| {
            let mut block = Block::new();
            for (key, value) in memtable.entries() {
                block.add(key, value);
            }
            self.lsm.write(block)
        })();

        if result.is_err() {
            // The swapped-out records reached neither level 0 nor the new
            // memtable; put them back (newer writes win) so a later
            // checkpoint cannot claim coverage of records that exist only
            // in the WAL.
            let state = self.state.write().unwrap();
            for (key, value) in memtable.entries() {
                if state.memtable.get(&key).is_none() {
                    state.memtable.put(key, value);
                }
            }
        }
        self.flush_in_progress.store(false, Ordering::SeqCst);

        let level0_hot = result?;

        tracing::debug!(entries = memtable.len(), "Flushed memtable to level 0");

        if level0_hot {
            self.compaction.run_cycle()?;
        }

        Ok(true)
    }

    /// Snapshots the memtable and persists it as the new checkpoint,
    /// records the WAL position in the manifest, and garbage-collects WAL
    /// segments the checkpoint fully covers.
    ///
    /// Skipped while a flush is between its memtable swap and its level 0
    /// write: a checkpoint taken in that window would cover records whose
    /// only durable home is a block that does not exist yet. The flag is
    /// set under the engine write lock, so reading it under the read lock
    /// here is race-free.
    fn checkpoint_now(&self) -> Result<()> {
        let (entries, size, last_wal_timestamp) = {
            let state = self.state.read().unwrap();
            if self.flush_in_progress.load(Ordering::SeqCst) {
                tracing::debug!("Skipping checkpoint, flush in progress");
                return Ok(());
            }
            (
                state.memtable.entries(),
                state.memtable.size() as u64,
                state.last_wal_timestamp,
            )
        };

        self.checkpoint.save(&entries, size, last_wal_timestamp)?;

        let current_wal = self
            .wal
            .current_segment()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
        self.lsm.record_wal_state(current_wal, last_wal_timestamp)?;

        self.wal.remove_obsolete(last_wal_timestamp)?;
        Ok(())
    }

    /// Periodic checkpointer tick; a no-op once the engine is closed.
    fn checkpoint_cycle(&self) -> Result<()> {
        if self.state.read().unwrap().closed {
            return Ok(());
        }
        self.checkpoint_now()
    }
}

fn spawn_flusher(
    shared: Arc<Shared>,
    flush_rx: Receiver<()>,
    shutdown_rx: Receiver<()>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("flusher".to_string())
        .spawn(move || loop {
            select! {
                recv(flush_rx) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                    if shared.state.read().unwrap().closed {
                        break;
                    }
                    if let Err(e) = shared.flush_memtable() {
                        tracing::error!(error = %e, "Background flush failed");
                    }
                }
                recv(shutdown_rx) -> _ => break,
            }
        })
        .expect("Failed to spawn flusher thread")
}

fn spawn_checkpointer(shared: Arc<Shared>, shutdown_rx: Receiver<()>) -> JoinHandle<()> {
    let interval = shared.config.checkpoint_interval;
    std::thread::Builder::new()
        .name("checkpointer".to_string())
        .spawn(move || loop {
            match shutdown_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = shared.checkpoint_cycle() {
                        tracing::error!(error = %e, "Background checkpoint failed");
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })
        .expect("Failed to spawn checkpointer thread")
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(errinput!("empty key"));
    }
    if key.len() > MAX_ENTRY_SIZE {
        return Err(errinput!("key exceeds {MAX_ENTRY_SIZE} byte cap"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompactionConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Engine {
        Engine::open(dir.path()).expect("Failed to open engine")
    }

    fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("Timed out waiting for {what}");
    }

    fn compact_to_quiescence(engine: &Engine) {
        for _ in 0..50 {
            engine.run_compaction().expect("Compaction cycle failed");
            wait_for("compaction idle", || engine.shared.compaction.is_idle());
            let over_threshold =
                (0..NUM_LEVELS - 1).any(|level| engine.shared.lsm.should_compact(level));
            if !over_threshold {
                return;
            }
        }
        panic!("Compaction never reached quiescence");
    }

    #[test]
    fn test_put_get_delete() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let engine = open(&dir);

        engine.put(b"key1", b"value1").expect("Put failed");
        assert_eq!(engine.get(b"key1").unwrap(), Some(b"value1".to_vec()));
        assert_eq!(engine.get(b"missing").unwrap(), None);

        engine.put(b"key1", b"value2").expect("Put failed");
        assert_eq!(engine.get(b"key1").unwrap(), Some(b"value2".to_vec()));

        engine.delete(b"key1").expect("Delete failed");
        assert_eq!(engine.get(b"key1").unwrap(), None);
    }

    #[test]
    fn test_empty_key_rejected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let engine = open(&dir);

        assert!(matches!(engine.put(b"", b"v"), Err(Error::InvalidInput(_))));
        assert!(matches!(engine.get(b""), Err(Error::InvalidInput(_))));
        assert!(matches!(engine.delete(b""), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_put_close_reopen() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        {
            let engine = open(&dir);
            engine.put(b"foo", b"bar").expect("Put failed");
            engine.close();
        }

        let engine = open(&dir);
        assert_eq!(engine.get(b"foo").unwrap(), Some(b"bar".to_vec()));

        // The log holds exactly the one put, and its checksum verifies
        // during replay.
        let wal = Wal::open(dir.path().join("wal"), 64 * 1024 * 1024).unwrap();
        let mut puts = 0;
        wal.replay_from(0, |record| {
            if record.op == WalOp::Put {
                assert_eq!(record.key, b"foo");
                assert_eq!(record.value, Some(b"bar".to_vec()));
                puts += 1;
            }
            Ok(())
        })
        .expect("Replay failed");
        assert_eq!(puts, 1);
    }

    #[test]
    fn test_delete_then_recover() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        {
            let engine = open(&dir);
            engine.put(b"k", b"v").expect("Put failed");
            engine.delete(b"k").expect("Delete failed");
            engine.close();
        }

        let engine = open(&dir);
        assert_eq!(engine.get(b"k").unwrap(), None);

        // The memtable holds the tombstone, nothing else.
        let stats = engine.stats();
        assert_eq!(stats.memtable_keys, 1);
        assert_eq!(stats.memtable_size, 1);
    }

    #[test]
    fn test_durability_without_close() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        {
            let engine = open(&dir);
            for i in 0..100 {
                let key = format!("key{i:03}");
                let value = format!("value{i}");
                engine.put(key.as_bytes(), value.as_bytes()).expect("Put failed");
            }
            engine.delete(b"key050").expect("Delete failed");
            engine.simulate_crash();
        }

        let engine = open(&dir);
        for i in 0..100 {
            let key = format!("key{i:03}");
            let expected = if i == 50 {
                None
            } else {
                Some(format!("value{i}").into_bytes())
            };
            assert_eq!(engine.get(key.as_bytes()).unwrap(), expected, "key {i}");
        }
    }

    #[test]
    fn test_torn_wal_tail_recovers_prefix() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        {
            let engine = open(&dir);
            engine.put(b"a", b"1").expect("Put failed");
            engine.simulate_crash();
        }

        // Append a record header whose payload never made it to disk.
        let wal_dir = dir.path().join("wal");
        let segment = fs::read_dir(&wal_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.extension().and_then(|e| e.to_str()) == Some("wal"))
            .expect("No WAL segment");
        let mut file = fs::OpenOptions::new().append(true).open(&segment).unwrap();
        use std::io::Write as _;
        file.write_all(&0x12345678u32.to_le_bytes()).unwrap();
        file.write_all(&64u32.to_le_bytes()).unwrap();
        file.write_all(b"torn").unwrap();
        file.sync_all().unwrap();

        let engine = open(&dir);
        assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_flush_trigger_writes_level0_blocks() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = EngineConfig::new(dir.path()).max_memtable_size(1024);
        let engine = Engine::open_with_config(config).expect("Failed to open engine");

        for i in 0..40 {
            let key = format!("key{i:04}");
            let value = vec![b'x'; 50];
            engine.put(key.as_bytes(), &value).expect("Put failed");
        }

        wait_for("a flushed block in L0", || {
            engine.stats().level_blocks.iter().sum::<usize>() > 0
        });

        for i in 0..40 {
            let key = format!("key{i:04}");
            assert_eq!(
                engine.get(key.as_bytes()).unwrap(),
                Some(vec![b'x'; 50]),
                "key {i}"
            );
        }
    }

    #[test]
    fn test_compaction_collapses_levels() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = EngineConfig::new(dir.path())
            .max_memtable_size(2048)
            .level_base_size(1024)
            .compaction(CompactionConfig::default().workers(2));
        let engine = Engine::open_with_config(config).expect("Failed to open engine");

        for i in 0..2500 {
            let key = format!("key{i:05}");
            let value = format!("value{i:05}");
            engine.put(key.as_bytes(), value.as_bytes()).expect("Put failed");
        }
        engine.flush().expect("Flush failed");
        compact_to_quiescence(&engine);

        // Every key survives the collapse.
        for i in 0..2500 {
            let key = format!("key{i:05}");
            assert_eq!(
                engine.get(key.as_bytes()).unwrap(),
                Some(format!("value{i:05}").into_bytes()),
                "key {i}"
            );
        }

        // Levels 1..6 stay range-disjoint and sorted.
        for level in 1..NUM_LEVELS {
            let blocks = engine.shared.lsm.level_blocks(level);
            for pair in blocks.windows(2) {
                assert!(
                    pair[0].max_key < pair[1].min_key,
                    "L{level} blocks overlap"
                );
            }
        }

        // Data has moved below L0.
        let stats = engine.stats();
        let deeper: usize = stats.level_blocks[1..].iter().sum();
        assert!(deeper > 0, "expected blocks below level 0");
    }

    #[test]
    fn test_checkpoint_bounds_replay() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        {
            let engine = open(&dir);
            for i in 0..1000 {
                let key = format!("key{i:04}");
                engine.put(key.as_bytes(), b"value").expect("Put failed");
            }
            engine.checkpoint().expect("Checkpoint failed");
            for i in 1000..1010 {
                let key = format!("key{i:04}");
                engine.put(key.as_bytes(), b"value").expect("Put failed");
            }
            engine.simulate_crash();
        }

        let engine = open(&dir);
        assert!(
            engine.replayed_on_open <= 10,
            "replayed {} records, checkpoint should bound replay to 10",
            engine.replayed_on_open
        );
        for i in 0..1010 {
            let key = format!("key{i:04}");
            assert_eq!(engine.get(key.as_bytes()).unwrap(), Some(b"value".to_vec()));
        }
    }

    #[test]
    fn test_tombstone_shadows_flushed_value() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let engine = open(&dir);

        engine.put(b"key", b"value").expect("Put failed");
        engine.flush().expect("Flush failed");
        assert_eq!(engine.get(b"key").unwrap(), Some(b"value".to_vec()));

        // The value now lives in a level 0 block; the delete must still
        // shadow it, including across flush and reopen.
        engine.delete(b"key").expect("Delete failed");
        assert_eq!(engine.get(b"key").unwrap(), None);

        engine.flush().expect("Flush failed");
        assert_eq!(engine.get(b"key").unwrap(), None);

        engine.close();
        drop(engine);

        let engine = open(&dir);
        assert_eq!(engine.get(b"key").unwrap(), None);
    }

    #[test]
    fn test_read_your_writes_across_flush() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let engine = open(&dir);

        engine.put(b"key", b"v1").expect("Put failed");
        assert_eq!(engine.get(b"key").unwrap(), Some(b"v1".to_vec()));

        engine.flush().expect("Flush failed");
        assert_eq!(engine.get(b"key").unwrap(), Some(b"v1".to_vec()));

        engine.put(b"key", b"v2").expect("Put failed");
        assert_eq!(engine.get(b"key").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let engine = open(&dir);

        engine.put(b"key", b"value").expect("Put failed");
        engine.close();
        engine.close();
        engine.close();

        assert!(matches!(engine.put(b"key", b"value"), Err(Error::Closed)));
        assert!(matches!(engine.get(b"key"), Err(Error::Closed)));
        assert!(matches!(engine.delete(b"key"), Err(Error::Closed)));
    }

    #[test]
    fn test_second_open_fails_on_lock() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let engine = open(&dir);

        let second = Engine::open(dir.path());
        assert!(matches!(second, Err(Error::Io(_))));

        drop(engine);
        let _engine = open(&dir);
    }

    #[test]
    fn test_stats_reflect_state() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let engine = open(&dir);

        let empty = engine.stats();
        assert_eq!(empty.memtable_size, 0);
        assert_eq!(empty.memtable_keys, 0);

        engine.put(b"key1", b"value1").expect("Put failed");
        engine.put(b"key2", b"value2").expect("Put failed");

        let stats = engine.stats();
        assert_eq!(stats.memtable_keys, 2);
        assert_eq!(stats.memtable_size, 20);
        assert_eq!(stats.level_blocks, [0; NUM_LEVELS]);

        engine.flush().expect("Flush failed");
        let flushed = engine.stats();
        assert_eq!(flushed.memtable_keys, 0);
        assert_eq!(flushed.level_blocks[0], 1);
        assert!(flushed.level_sizes[0] > 0);
    }

    #[test]
    fn test_background_checkpointer_bounds_replay() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = EngineConfig::new(dir.path()).checkpoint_interval(Duration::from_millis(20));

        {
            let engine = Engine::open_with_config(config).expect("Failed to open engine");
            for i in 0..200 {
                let key = format!("key{i:03}");
                engine.put(key.as_bytes(), b"value").expect("Put failed");
            }
            // Give the checkpointer a few ticks.
            std::thread::sleep(Duration::from_millis(100));
            engine.simulate_crash();
        }

        let engine = open(&dir);
        assert!(
            engine.replayed_on_open < 200,
            "periodic checkpoint should have covered some records"
        );
        for i in 0..200 {
            let key = format!("key{i:03}");
            assert_eq!(engine.get(key.as_bytes()).unwrap(), Some(b"value".to_vec()));
        }
    }
}
