//! Advisory session lock.
//!
//! The hosts file and firewall tables are shared by every invocation.
//! Block and unblock hold this lock for their whole sequence so two
//! concurrent runs cannot interleave.
//!
//! The lock is an OS advisory lock (`flock`) on a file that is never
//! deleted. The kernel drops it when the holder exits, so a crashed run
//! leaves nothing to reclaim, and two contenders can never both win. The
//! file holds the owner's PID for error messages only.

use std::fs::{File, OpenOptions, TryLockError};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Lock errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another live process holds the lock.
    #[error("another stopbrowsing run{} holds {}", owner_suffix(.pid), .path.display())]
    Held { path: PathBuf, pid: Option<u32> },

    /// The lock file could not be created or inspected.
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn owner_suffix(pid: &Option<u32>) -> String {
    pid.map(|pid| format!(" (pid {pid})")).unwrap_or_default()
}

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;

/// Held lock; released on drop.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
    file: File,
}

impl SessionLock {
    /// Acquires the lock at `path` without blocking.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let io_error = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let (file, writable) = open_lock_file(&path).map_err(io_error)?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                let pid = read_owner(&path);
                return Err(LockError::Held { path, pid });
            }
            Err(TryLockError::Error(e)) => return Err(io_error(e)),
        }

        if writable {
            if let Err(e) = record_owner(&file) {
                debug!(lock = %path.display(), "cannot record lock owner: {}", e);
            }
        }
        debug!(lock = %path.display(), "session lock acquired");
        Ok(Self { path, file })
    }

    /// Returns the lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        // Clear the owner first; the file itself stays for the next run.
        let _ = self.file.set_len(0);
        if let Err(e) = self.file.unlock() {
            debug!("Failed to release session lock: {}", e);
        }
    }
}

/// Opens the lock file, read-only when another user created it.
fn open_lock_file(path: &Path) -> std::io::Result<(File, bool)> {
    match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
    {
        Ok(file) => Ok((file, true)),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Ok((File::open(path)?, false))
        }
        Err(e) => Err(e),
    }
}

fn record_owner(mut file: &File) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{}", std::process::id())?;
    file.flush()
}

fn read_owner(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("run").join("stopbrowsing.lock");

        let lock = SessionLock::acquire(&path).unwrap();
        assert_eq!(read_owner(lock.path()), Some(std::process::id()));
        drop(lock);

        assert_eq!(read_owner(&path), None);
        assert!(SessionLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_second_acquire_is_held() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stopbrowsing.lock");

        let _lock = SessionLock::acquire(&path).unwrap();
        let err = SessionLock::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::Held { pid: Some(pid), .. } if pid == std::process::id()));
        assert!(err.to_string().contains("(pid "));
    }

    #[test]
    fn test_leftover_file_is_not_a_lock() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stopbrowsing.lock");
        // A run that crashed leaves its PID behind but no kernel lock.
        fs::write(&path, "999999999").unwrap();

        let lock = SessionLock::acquire(&path).unwrap();
        assert_eq!(read_owner(lock.path()), Some(std::process::id()));
    }

    #[test]
    fn test_garbage_lock_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stopbrowsing.lock");
        fs::write(&path, "not a pid").unwrap();

        assert!(SessionLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_racing_acquirers_on_leftover_file_single_winner() {
        let tmp = TempDir::new().unwrap();
        let path = Arc::new(tmp.path().join("stopbrowsing.lock"));
        fs::write(path.as_path(), "999999999").unwrap();

        let contenders = 8;
        let start = Arc::new(Barrier::new(contenders));
        let done = Arc::new(Barrier::new(contenders));

        let handles: Vec<_> = (0..contenders)
            .map(|_| {
                let (path, start, done) = (path.clone(), start.clone(), done.clone());
                thread::spawn(move || {
                    start.wait();
                    let result = SessionLock::acquire(path.as_path());
                    // Hold any winner until every contender has tried.
                    done.wait();
                    result.is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
