use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const LOCK_FILE: &str = "LOCK";

/// Exclusive ownership of an engine base directory.
///
/// Two engines over one directory would interleave WAL appends, flushes
/// and manifest saves with undefined results, so open takes an advisory
/// lock on `<base_dir>/LOCK` and holds it for the engine's lifetime. The
/// file records the owning process id; when acquisition fails, the error
/// names that owner so "database is locked" is diagnosable.
pub struct FileLock {
    /// Keeps the descriptor, and with it the lock, alive.
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Claims `base_dir` for this process. Fails with `Error::Io` when
    /// another engine already owns it.
    pub fn acquire(base_dir: &Path) -> Result<Self> {
        let path = base_dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        if !try_exclusive(&file)? {
            let mut owner = String::new();
            file.read_to_string(&mut owner).ok();
            let owner = owner.trim();
            return Err(Error::Io(format!(
                "{} is already owned by {}; one engine per directory",
                base_dir.display(),
                if owner.is_empty() {
                    "another engine".to_string()
                } else {
                    format!("process {owner}")
                },
            )));
        }

        // The previous owner's record is stale once the lock is ours.
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;

        Ok(Self { _file: file, path })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Attempts a non-blocking exclusive lock. `Ok(false)` means another
/// holder has it; the lock is released when the descriptor closes.
#[cfg(unix)]
fn try_exclusive(file: &File) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err.into())
    }
}

#[cfg(not(unix))]
fn try_exclusive(_file: &File) -> Result<bool> {
    // No advisory locking on this platform; single ownership is on the
    // operator.
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_records_owner_pid() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        let lock = FileLock::acquire(dir.path()).expect("Failed to acquire lock");
        assert_eq!(lock.path(), dir.path().join(LOCK_FILE));

        let owner = std::fs::read_to_string(lock.path()).expect("Failed to read lock file");
        assert_eq!(owner.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_second_acquire_names_owner() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        let _lock = FileLock::acquire(dir.path()).expect("Failed to acquire first lock");
        match FileLock::acquire(dir.path()) {
            Err(Error::Io(msg)) => {
                assert!(
                    msg.contains(&std::process::id().to_string()),
                    "error should name the owning process: {msg}"
                );
            }
            Err(other) => panic!("Expected Io error, got {other:?}"),
            Ok(_) => panic!("Second acquire should have failed"),
        }
    }

    #[test]
    fn test_released_on_drop() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        {
            let _lock = FileLock::acquire(dir.path()).expect("Failed to acquire lock");
        }

        // The lock file persists, but a new engine can claim it.
        assert!(dir.path().join(LOCK_FILE).exists());
        let _lock = FileLock::acquire(dir.path()).expect("Failed to re-acquire after drop");
    }
}
