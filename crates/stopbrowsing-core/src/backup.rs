//! Timestamped hosts file backups.
//!
//! A backup is taken immediately before every hosts mutation. After each
//! new backup the store prunes the oldest ones down to the retention count,
//! never removing the backup it just wrote.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use thiserror::Error;
use tracing::{debug, warn};

/// File name prefix for backups.
const BACKUP_PREFIX: &str = "hosts.";

/// File name suffix for backups.
const BACKUP_SUFFIX: &str = ".bak";

/// Backup errors.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The backup directory could not be created.
    #[error("failed to create backup directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The source file could not be copied.
    #[error("failed to back up {path}: {source}")]
    Copy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The backup directory could not be listed.
    #[error("failed to list backups in {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No backup exists.
    #[error("no backups found in {0}")]
    NoBackups(PathBuf),
}

impl BackupError {
    /// Returns the underlying I/O error, if any.
    pub fn io_error(&self) -> Option<&std::io::Error> {
        match self {
            Self::CreateDir { source, .. } | Self::Copy { source, .. } | Self::List { source, .. } => {
                Some(source)
            }
            Self::NoBackups(_) => None,
        }
    }
}

/// Result type for backup operations.
pub type Result<T> = std::result::Result<T, BackupError>;

/// Directory of rotating hosts file backups.
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
    retention: usize,
}

impl BackupStore {
    /// Creates a store. A retention of zero still keeps the newest backup.
    pub fn new(dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            dir: dir.into(),
            retention,
        }
    }

    /// Returns the backup directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the effective retention count (at least one).
    pub fn retention(&self) -> usize {
        self.retention.max(1)
    }

    /// Copies `source` into a new backup and prunes old ones.
    ///
    /// Returns the path of the new backup.
    pub fn create(&self, source: &Path) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| BackupError::CreateDir {
            path: self.dir.clone(),
            source: e,
        })?;

        let path = self.next_path();
        fs::copy(source, &path).map_err(|e| BackupError::Copy {
            path: source.to_path_buf(),
            source: e,
        })?;
        debug!(backup = %path.display(), "hosts file backed up");

        self.prune(&path);
        Ok(path)
    }

    /// Lists backups, newest first.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(BackupError::List {
                    path: self.dir.clone(),
                    source: e,
                })
            }
        };

        let mut backups: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| is_backup_name(path))
            .collect();

        // Timestamped names sort chronologically.
        backups.sort_by(|a, b| backup_sort_key(b).cmp(&backup_sort_key(a)));
        Ok(backups)
    }

    /// Returns the newest backup.
    pub fn latest(&self) -> Result<PathBuf> {
        self.list()?
            .into_iter()
            .next()
            .ok_or_else(|| BackupError::NoBackups(self.dir.clone()))
    }

    fn next_path(&self) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d-%H%M%S%.6f").to_string();
        let mut path = self.dir.join(format!("{BACKUP_PREFIX}{stamp}{BACKUP_SUFFIX}"));
        let mut n = 1;
        while path.exists() {
            path = self
                .dir
                .join(format!("{BACKUP_PREFIX}{stamp}-{n}{BACKUP_SUFFIX}"));
            n += 1;
        }
        path
    }

    fn prune(&self, keep: &Path) {
        let backups = match self.list() {
            Ok(backups) => backups,
            Err(e) => {
                warn!("Failed to list backups for pruning: {}", e);
                return;
            }
        };

        for old in backups.iter().skip(self.retention()) {
            if old == keep {
                continue;
            }
            if let Err(e) = fs::remove_file(old) {
                warn!(backup = %old.display(), "Failed to prune backup: {}", e);
            } else {
                debug!(backup = %old.display(), "pruned backup");
            }
        }
    }
}

fn is_backup_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(BACKUP_PREFIX) && n.ends_with(BACKUP_SUFFIX))
        .unwrap_or(false)
}

/// Sort key: the timestamp, then the numeric collision suffix.
fn backup_sort_key(path: &Path) -> (String, u32) {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let core = name
        .strip_prefix(BACKUP_PREFIX)
        .and_then(|n| n.strip_suffix(BACKUP_SUFFIX))
        .unwrap_or(name);

    // "20240101-120000.123456" or "20240101-120000.123456-2"
    match core.rsplit_once('-') {
        Some((stamp, n)) if stamp.contains('-') => {
            (stamp.to_string(), n.parse().unwrap_or(0))
        }
        _ => (core.to_string(), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(retention: usize) -> (TempDir, PathBuf, BackupStore) {
        let tmp = TempDir::new().unwrap();
        let hosts = tmp.path().join("hosts");
        fs::write(&hosts, "127.0.0.1 localhost\n").unwrap();
        let store = BackupStore::new(tmp.path().join("backups"), retention);
        (tmp, hosts, store)
    }

    #[test]
    fn test_create_copies_content() {
        let (_tmp, hosts, store) = setup(3);
        let backup = store.create(&hosts).unwrap();
        assert_eq!(fs::read_to_string(backup).unwrap(), "127.0.0.1 localhost\n");
    }

    #[test]
    fn test_retention_bounds_count() {
        let (_tmp, hosts, store) = setup(3);
        for i in 0..6 {
            fs::write(&hosts, format!("state {i}\n")).unwrap();
            store.create(&hosts).unwrap();
        }
        let backups = store.list().unwrap();
        assert_eq!(backups.len(), 3);
        assert_eq!(fs::read_to_string(&backups[0]).unwrap(), "state 5\n");
    }

    #[test]
    fn test_latest_is_most_recent_state() {
        let (_tmp, hosts, store) = setup(2);
        fs::write(&hosts, "first\n").unwrap();
        store.create(&hosts).unwrap();
        fs::write(&hosts, "second\n").unwrap();
        let newest = store.create(&hosts).unwrap();
        assert_eq!(store.latest().unwrap(), newest);
        assert_eq!(fs::read_to_string(newest).unwrap(), "second\n");
    }

    #[test]
    fn test_zero_retention_keeps_new_backup() {
        let (_tmp, hosts, store) = setup(0);
        store.create(&hosts).unwrap();
        let just_taken = store.create(&hosts).unwrap();
        let backups = store.list().unwrap();
        assert_eq!(backups, vec![just_taken]);
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = BackupStore::new(tmp.path().join("nope"), 5);
        assert!(store.list().unwrap().is_empty());
        assert!(matches!(store.latest(), Err(BackupError::NoBackups(_))));
    }

    #[test]
    fn test_missing_source_fails() {
        let tmp = TempDir::new().unwrap();
        let store = BackupStore::new(tmp.path().join("backups"), 5);
        let err = store.create(&tmp.path().join("absent")).unwrap_err();
        assert!(matches!(err, BackupError::Copy { .. }));
        assert!(err.io_error().is_some());
    }

    #[test]
    fn test_sort_key_orders_collisions() {
        let a = Path::new("hosts.20240101-120000.000001.bak");
        let b = Path::new("hosts.20240101-120000.000001-1.bak");
        let c = Path::new("hosts.20240101-120000.000001-2.bak");
        assert!(backup_sort_key(a) < backup_sort_key(b));
        assert!(backup_sort_key(b) < backup_sort_key(c));
    }

    #[test]
    fn test_unrelated_files_ignored() {
        let (tmp, hosts, store) = setup(5);
        store.create(&hosts).unwrap();
        fs::write(tmp.path().join("backups").join("notes.txt"), "x").unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
