//! EmberDB: an embeddable, crash-safe, single-node key-value storage
//! engine built as a log-structured merge tree.
//!
//! Writes are logged to a CRC-checked write-ahead log and fsynced before
//! they become visible, buffered in an in-memory table, flushed as sorted
//! immutable blocks into a seven-level on-disk index, and merged by a
//! background compaction pool. Periodic checkpoints of the memtable bound
//! WAL replay so recovery time tracks recent write volume, not total
//! history.
//!
//! ```no_run
//! use emberdb::Engine;
//!
//! # fn main() -> emberdb::Result<()> {
//! let engine = Engine::open("./db")?;
//! engine.put(b"hello", b"world")?;
//! assert_eq!(engine.get(b"hello")?, Some(b"world".to_vec()));
//! engine.delete(b"hello")?;
//! engine.close();
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod checkpoint;
pub mod compaction;
pub mod config;
pub mod engine;
pub mod error;
pub mod flock;
pub mod lsm;
pub mod manifest;
pub mod memtable;
pub mod wal;

pub use compaction::CompactionStats;
pub use config::{CompactionConfig, EngineConfig};
pub use engine::{Engine, Stats};
pub use error::{Error, Result};
