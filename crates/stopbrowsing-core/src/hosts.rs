//! Layer 1: the managed hosts file section.
//!
//! The block lives between two fixed marker lines:
//!
//! ```text
//! # BEGIN STOPBROWSING BLOCK
//! # Generated by stopbrowsing at 2024-05-01 09:30:00
//! # Profile: work
//! 127.0.0.1 example.com
//! ::1 example.com
//! # END STOPBROWSING BLOCK
//! ```
//!
//! Every mutation is a full rewrite: the old section is stripped and a fresh
//! one appended in memory, then the whole file is replaced in one step
//! (temp file + rename). An interrupted run therefore leaves either the old
//! or the new file, never a truncated one. A backup is taken before every
//! mutation.
//!
//! Without write access to the hosts directory the same swap runs through
//! the privileged runner: the content is staged in the backup directory,
//! copied next to the hosts file, then moved over it. A symlinked hosts file
//! is followed so the link survives. A hosts file that cannot be renamed
//! over (a bind mount) is rewritten in place, after the backup.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backup::{BackupError, BackupStore};
use crate::command::{CommandError, SharedRunner};
use crate::error::{io_kind, ErrorKind};

/// First line of the managed section.
pub const BEGIN_MARKER: &str = "# BEGIN STOPBROWSING BLOCK";

/// Last line of the managed section.
pub const END_MARKER: &str = "# END STOPBROWSING BLOCK";

/// IPv4 address blocked domains resolve to.
pub const BLOCK_ADDR_V4: &str = "127.0.0.1";

/// IPv6 address blocked domains resolve to.
pub const BLOCK_ADDR_V6: &str = "::1";

/// Name of the staging file used for privileged installs.
const STAGED_NAME: &str = "hosts.staged";

/// How new content reaches the hosts file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Install {
    /// Sibling temp file renamed over the target.
    Rename,
    /// Target truncated and rewritten.
    InPlace,
}

/// Hosts section errors.
#[derive(Debug, Error)]
pub enum HostsError {
    /// Writing the hosts file was refused.
    #[error("permission denied writing {path}: {message}")]
    PermissionDenied { path: PathBuf, message: String },

    /// The write completed but re-reading shows it did not take effect.
    #[error("write to {0} did not take effect")]
    WriteVerificationFailed(PathBuf),

    /// The hosts file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The hosts file could not be written.
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The pre-mutation backup failed; nothing was changed.
    #[error("backup failed: {0}")]
    Backup(#[from] BackupError),

    /// The privileged install command failed.
    #[error("privileged install failed: {0}")]
    Command(#[from] CommandError),
}

impl HostsError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::WriteVerificationFailed(_) => ErrorKind::WriteVerificationFailed,
            Self::Read { source, .. } | Self::Write { source, .. } => io_kind(source),
            Self::Backup(e) => e.io_error().map(io_kind).unwrap_or(ErrorKind::Other),
            Self::Command(e) => e.kind(),
        }
    }
}

/// Result type for hosts operations.
pub type Result<T> = std::result::Result<T, HostsError>;

/// Owns the managed section of the hosts file.
pub struct HostsSectionManager {
    path: PathBuf,
    backups: BackupStore,
    runner: SharedRunner,
}

impl HostsSectionManager {
    /// Creates a manager for the hosts file at `path`.
    pub fn new(path: impl Into<PathBuf>, backups: BackupStore, runner: SharedRunner) -> Self {
        Self {
            path: path.into(),
            backups,
            runner,
        }
    }

    /// Returns the hosts file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the backup store.
    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Returns true if the begin marker is in the hosts file.
    ///
    /// An unreadable file counts as absent.
    pub fn is_present(&self) -> bool {
        match self.read() {
            Ok(content) => has_section(&content),
            Err(e) => {
                warn!("Cannot read hosts file: {}", e);
                false
            }
        }
    }

    /// Lists the domains in the managed section, sorted and deduplicated.
    pub fn list_blocked(&self) -> BTreeSet<String> {
        match self.read() {
            Ok(content) => parse_blocked(&content),
            Err(e) => {
                warn!("Cannot read hosts file: {}", e);
                BTreeSet::new()
            }
        }
    }

    /// Replaces the managed section with one covering `domains`.
    pub fn replace(&self, domains: &[String], profile: &str) -> Result<()> {
        let current = self.read()?;
        let section = render_section(domains, profile, &timestamp());

        let mut updated = strip_section(&current);
        updated.push_str(&section);

        self.backups.create(&self.path)?;
        self.write(&updated)?;

        if !has_section(&self.read()?) {
            return Err(HostsError::WriteVerificationFailed(self.path.clone()));
        }

        info!(
            domains = domains.len(),
            profile = %profile,
            "Hosts section written"
        );
        Ok(())
    }

    /// Removes the managed section. A missing section is a no-op.
    pub fn remove(&self) -> Result<()> {
        let current = self.read()?;
        if !has_section(&current) {
            debug!("No hosts section to remove");
            return Ok(());
        }

        self.backups.create(&self.path)?;
        self.write(&strip_section(&current))?;

        if has_section(&self.read()?) {
            return Err(HostsError::WriteVerificationFailed(self.path.clone()));
        }

        info!("Hosts section removed");
        Ok(())
    }

    /// Writes the newest backup back over the hosts file.
    ///
    /// The current file is backed up first. Returns the restored backup.
    pub fn restore_latest(&self) -> Result<PathBuf> {
        let source = self.backups.latest()?;
        let content = fs::read_to_string(&source).map_err(|e| HostsError::Read {
            path: source.clone(),
            source: e,
        })?;

        self.backups.create(&self.path)?;
        self.write(&content)?;

        if self.read()? != content {
            return Err(HostsError::WriteVerificationFailed(self.path.clone()));
        }

        info!(backup = %source.display(), "Hosts file restored from backup");
        Ok(source)
    }

    fn read(&self) -> Result<String> {
        fs::read_to_string(&self.path).map_err(|e| HostsError::Read {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Replaces the file contents, escalating through the runner if the
    /// direct write is refused.
    fn write(&self, content: &str) -> Result<()> {
        let target = resolve_target(&self.path);

        match write_atomic(&target, content) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                debug!("Direct hosts write denied, installing through elevated rename");
                self.write_privileged(&target, content, Install::Rename)
            }
            Err(e) if is_unrenamable(&e) => {
                warn!(hosts = %target.display(), "Hosts file cannot be replaced by rename ({}), rewriting in place", e);
                match fs::write(&target, content) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                        self.write_privileged(&target, content, Install::InPlace)
                    }
                    Err(e) => Err(HostsError::Write {
                        path: target,
                        source: e,
                    }),
                }
            }
            Err(e) => Err(HostsError::Write {
                path: target,
                source: e,
            }),
        }
    }

    fn write_privileged(&self, target: &Path, content: &str, install: Install) -> Result<()> {
        let staged = self.backups.dir().join(STAGED_NAME);
        fs::create_dir_all(self.backups.dir())
            .and_then(|_| fs::write(&staged, content))
            .map_err(|e| HostsError::Write {
                path: staged.clone(),
                source: e,
            })?;
        if let Ok(meta) = fs::metadata(target) {
            // cp gives a new file the source's mode.
            let _ = fs::set_permissions(&staged, meta.permissions());
        }

        let result = match install {
            Install::Rename => self.install_by_rename(&staged, target),
            Install::InPlace => self.privileged(&["cp", &path_arg(&staged), &path_arg(target)]),
        };

        if let Err(e) = fs::remove_file(&staged) {
            debug!("Failed to remove staged hosts file: {}", e);
        }
        result
    }

    /// Copies `staged` next to `target`, then renames it over `target`.
    fn install_by_rename(&self, staged: &Path, target: &Path) -> Result<()> {
        let tmp = temp_path(target);
        let (staged_arg, tmp_arg, target_arg) = (path_arg(staged), path_arg(&tmp), path_arg(target));

        self.privileged(&["cp", &staged_arg, &tmp_arg])
            .and_then(|_| self.privileged(&["mv", "-f", &tmp_arg, &target_arg]))
            .or_else(|e| {
                let _ = self.privileged(&["rm", "-f", &tmp_arg]);
                match e {
                    HostsError::Command(CommandError::Failed { ref message, .. })
                        if message.to_lowercase().contains("resource busy") =>
                    {
                        warn!(hosts = %target.display(), "Hosts file cannot be replaced by rename, rewriting in place");
                        self.privileged(&["cp", &staged_arg, &target_arg])
                    }
                    e => Err(e),
                }
            })
    }

    fn privileged(&self, argv: &[&str]) -> Result<()> {
        let program = argv.first().copied().unwrap_or_default();
        match self
            .runner
            .run_privileged(argv)
            .and_then(|out| out.check(program))
        {
            Ok(_) => Ok(()),
            Err(CommandError::PermissionDenied { message, .. }) => {
                Err(HostsError::PermissionDenied {
                    path: self.path.clone(),
                    message,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Follows symlinks so a linked hosts file is replaced at its target.
fn resolve_target(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Sibling temp file used for the rename swap.
fn temp_path(path: &Path) -> PathBuf {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "hosts".to_string());
    dir.join(format!(".{name}.stopbrowsing.tmp"))
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Rename errors that mean the target can only be rewritten in place.
fn is_unrenamable(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ResourceBusy | io::ErrorKind::CrossesDevices
    )
}

/// Writes `content` to a sibling temp file and renames it over `path`.
fn write_atomic(path: &Path, content: &str) -> io::Result<()> {
    let tmp = temp_path(path);

    fs::write(&tmp, content)?;
    if let Ok(meta) = fs::metadata(path) {
        // Keep the original mode; a fresh file gets the umask default.
        let _ = fs::set_permissions(&tmp, meta.permissions());
    }
    fs::rename(&tmp, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Returns true if `content` contains the begin marker.
pub fn has_section(content: &str) -> bool {
    content.lines().any(|line| line.trim() == BEGIN_MARKER)
}

/// Removes every managed section from `content`.
///
/// A begin marker without an end marker removes through end of file. The
/// result always ends with a newline unless it is empty.
pub fn strip_section(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut inside = false;

    for line in content.lines() {
        let trimmed = line.trim();
        if !inside && trimmed == BEGIN_MARKER {
            inside = true;
            continue;
        }
        if inside {
            if trimmed == END_MARKER {
                inside = false;
            }
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }

    out
}

/// Renders a complete section for `domains`.
///
/// Entries that cannot be a single hosts field are skipped.
pub fn render_section(domains: &[String], profile: &str, generated_at: &str) -> String {
    let mut out = String::new();
    out.push_str(BEGIN_MARKER);
    out.push('\n');
    out.push_str(&format!("# Generated by stopbrowsing at {generated_at}\n"));
    out.push_str(&format!("# Profile: {profile}\n"));

    for domain in domains {
        if domain.is_empty() || domain.contains(char::is_whitespace) || domain.contains('#') {
            warn!(domain = %domain, "Skipping malformed domain");
            continue;
        }
        out.push_str(&format!("{BLOCK_ADDR_V4} {domain}\n"));
        out.push_str(&format!("{BLOCK_ADDR_V6} {domain}\n"));
    }

    out.push_str(END_MARKER);
    out.push('\n');
    out
}

/// Extracts blocked domains from the managed section of `content`.
pub fn parse_blocked(content: &str) -> BTreeSet<String> {
    let mut blocked = BTreeSet::new();
    let mut inside = false;

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed == BEGIN_MARKER {
            inside = true;
            continue;
        }
        if trimmed == END_MARKER {
            inside = false;
            continue;
        }
        if !inside {
            continue;
        }

        let mut fields = trimmed.split_whitespace();
        if let (Some(addr), Some(domain)) = (fields.next(), fields.next()) {
            if addr == BLOCK_ADDR_V4 || addr == BLOCK_ADDR_V6 {
                blocked.insert(domain.to_string());
            }
        }
    }

    blocked
}
