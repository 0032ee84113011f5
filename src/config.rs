use std::path::PathBuf;
use std::time::Duration;

/// Number of levels in the block index.
pub const NUM_LEVELS: usize = 7;

/// Hard cap on a single key or value (64MB). Anything larger is rejected
/// at the engine boundary with InvalidInput.
pub const MAX_ENTRY_SIZE: usize = 64 * 1024 * 1024;

/// Configuration for the storage engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base directory for all storage files
    pub dir: PathBuf,

    /// Maximum size of the memtable before flushing to disk (default: 32MB)
    pub max_memtable_size: usize,

    /// Maximum size of a WAL segment before rotation (default: 64MB)
    pub max_wal_file_size: u64,

    /// Byte cap of level 0; level i caps at `level_base_size * 4^i`
    /// (default: 64MB)
    pub level_base_size: u64,

    /// How often the background checkpointer runs (default: 500ms)
    pub checkpoint_interval: Duration,

    /// Compaction configuration
    pub compaction: CompactionConfig,
}

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Number of compaction worker threads (default: 4)
    pub workers: usize,

    /// Capacity of the bounded compaction task queue (default: 100)
    pub queue_depth: usize,

    /// How long schedule() waits for queue space before dropping a task
    /// (default: 10ms)
    pub schedule_timeout: Duration,

    /// Level 0 block count above which a compaction cycle splits the level
    /// into two tasks (default: 4)
    pub level0_split_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            max_memtable_size: 32 * 1024 * 1024, // 32MB
            max_wal_file_size: 64 * 1024 * 1024, // 64MB
            level_base_size: 64 * 1024 * 1024,   // 64MB
            checkpoint_interval: Duration::from_millis(500),
            compaction: CompactionConfig::default(),
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 100,
            schedule_timeout: Duration::from_millis(10),
            level0_split_threshold: 4,
        }
    }
}

impl EngineConfig {
    /// Create a new config with the given base directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set maximum memtable size
    pub fn max_memtable_size(mut self, size: usize) -> Self {
        self.max_memtable_size = size;
        self
    }

    /// Set maximum WAL segment size
    pub fn max_wal_file_size(mut self, size: u64) -> Self {
        self.max_wal_file_size = size;
        self
    }

    /// Set the byte cap of level 0
    pub fn level_base_size(mut self, size: u64) -> Self {
        self.level_base_size = size;
        self
    }

    /// Set checkpoint interval
    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Configure compaction settings
    pub fn compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = config;
        self
    }

    /// Byte cap of the given level
    pub fn level_cap(&self, level: usize) -> u64 {
        self.level_base_size << (2 * level as u32)
    }

    /// Byte size at which the given level triggers compaction (75% of cap)
    pub fn compaction_threshold(&self, level: usize) -> u64 {
        self.level_cap(level) * 3 / 4
    }
}

impl CompactionConfig {
    /// Set worker thread count
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set task queue capacity
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Set the schedule deadline
    pub fn schedule_timeout(mut self, timeout: Duration) -> Self {
        self.schedule_timeout = timeout;
        self
    }

    /// Set the level 0 split threshold
    pub fn level0_split_threshold(mut self, threshold: usize) -> Self {
        self.level0_split_threshold = threshold;
        self
    }
}
