//! Configuration document.
//!
//! A single JSON file parsed once per invocation into [`Config`]. Profiles
//! hold the raw domain and exception lists; [`Config::session_context`]
//! turns the selected profile plus the layer switches into the value the
//! session controller consumes.
//!
//! ```json
//! {
//!   "active_profile": "work",
//!   "profiles": {
//!     "work": { "domains": ["youtube.com"], "exceptions": ["+music.youtube.com"] }
//!   },
//!   "layers": { "doh_dot_master": true, "hosts": true, "dot": true, "doh_string": true }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use directories::ProjectDirs;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::command::Elevation;
use crate::domain_filter::EXCEPTION_MARKER;
use crate::session::SessionContext;

/// Name of the profile created by default.
pub const DEFAULT_PROFILE: &str = "default";

/// Default system hosts file.
pub const DEFAULT_HOSTS_PATH: &str = "/etc/hosts";

/// Default number of hosts backups kept.
pub const DEFAULT_BACKUP_RETENTION: usize = 10;

/// Default validator timeout in seconds.
pub const DEFAULT_VALIDATION_TIMEOUT_SECS: u64 = 3;

/// Default redirect page port.
pub const DEFAULT_REDIRECT_PORT: u16 = 80;

/// Session lock file name.
pub const LOCK_FILE: &str = "stopbrowsing.lock";

/// Shared lock directories, in preference order. Root jobs and user runs
/// must agree on one lock, so only world-writable directories qualify.
pub const SYSTEM_LOCK_DIRS: [&str; 2] = ["/run/lock", "/var/lock"];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read or written.
    #[error("config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`Config`].
    #[error("invalid config file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The requested profile does not exist.
    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    /// The input is not a usable domain or exception pattern.
    #[error("not a valid domain: {0:?}")]
    InvalidDomain(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

fn default_true() -> bool {
    true
}

/// Per-layer enable switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Master switch for both encrypted-DNS layers.
    #[serde(default = "default_true")]
    pub doh_dot_master: bool,
    /// Hosts file section (layer 1).
    #[serde(default = "default_true")]
    pub hosts: bool,
    /// DNS-over-TLS port block (layer 2).
    #[serde(default = "default_true")]
    pub dot: bool,
    /// DNS-over-HTTPS string match (layer 3).
    #[serde(default = "default_true")]
    pub doh_string: bool,
    /// Browser tab closing. Carried for front ends; the engine ignores it.
    #[serde(default = "default_true")]
    pub tab_closing: bool,
}

impl LayerConfig {
    /// Every layer off.
    pub fn none() -> Self {
        Self {
            doh_dot_master: false,
            hosts: false,
            dot: false,
            doh_string: false,
            tab_closing: false,
        }
    }

    /// Only the hosts layer on.
    pub fn hosts_only() -> Self {
        Self {
            hosts: true,
            ..Self::none()
        }
    }

    /// Returns true if the hosts layer should run.
    pub fn hosts_enabled(&self) -> bool {
        self.hosts
    }

    /// Returns true if the DoT layer should run.
    pub fn dot_enabled(&self) -> bool {
        self.doh_dot_master && self.dot
    }

    /// Returns true if the DoH layer should run.
    pub fn doh_enabled(&self) -> bool {
        self.doh_dot_master && self.doh_string
    }
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            doh_dot_master: true,
            hosts: true,
            dot: true,
            doh_string: true,
            tab_closing: true,
        }
    }
}

/// Redirect page server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectConfig {
    /// Listen address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Directory holding a custom `index.html`.
    pub page_dir: Option<PathBuf>,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_REDIRECT_PORT,
            page_dir: None,
        }
    }
}

/// A named domain list with its exceptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Domains to block, in order.
    #[serde(default)]
    pub domains: Vec<String>,
    /// Exception patterns, in order.
    #[serde(default)]
    pub exceptions: Vec<String>,
}

impl Profile {
    /// Adds a domain after cleaning it. Returns false if already listed.
    pub fn add_domain(&mut self, input: &str) -> Result<bool> {
        let domain = clean_domain(input).ok_or_else(|| ConfigError::InvalidDomain(input.into()))?;
        if self.domains.contains(&domain) {
            return Ok(false);
        }
        self.domains.push(domain);
        Ok(true)
    }

    /// Removes a domain. Returns false if it was not listed.
    pub fn remove_domain(&mut self, input: &str) -> bool {
        let target = clean_domain(input).unwrap_or_else(|| input.trim().to_string());
        let before = self.domains.len();
        self.domains.retain(|d| *d != target);
        self.domains.len() != before
    }

    /// Adds an exception pattern. Returns false if already listed.
    pub fn add_exception(&mut self, input: &str) -> Result<bool> {
        let pattern =
            clean_exception(input).ok_or_else(|| ConfigError::InvalidDomain(input.into()))?;
        if self.exceptions.iter().any(|e| same_exception(e, &pattern)) {
            return Ok(false);
        }
        self.exceptions.push(pattern);
        Ok(true)
    }

    /// Removes `input` from both lists. Returns true if either held it.
    pub fn remove(&mut self, input: &str) -> bool {
        let domain = self.remove_domain(input);
        let exception = self.remove_exception(input);
        domain || exception
    }

    /// Removes an exception pattern. Returns false if it was not listed.
    pub fn remove_exception(&mut self, input: &str) -> bool {
        let Some(pattern) = clean_exception(input) else {
            return false;
        };
        let before = self.exceptions.len();
        self.exceptions.retain(|e| !same_exception(e, &pattern));
        self.exceptions.len() != before
    }
}

fn same_exception(stored: &str, pattern: &str) -> bool {
    stored.trim().trim_start_matches(EXCEPTION_MARKER).trim() == pattern
}

/// Complete configuration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Profile used when none is named.
    pub active_profile: String,
    /// Profiles by name.
    pub profiles: BTreeMap<String, Profile>,
    /// Layer switches.
    pub layers: LayerConfig,
    /// Hosts file to manage.
    pub hosts_path: PathBuf,
    /// Hosts backup directory.
    pub backup_dir: PathBuf,
    /// Number of hosts backups kept.
    pub backup_retention: usize,
    /// Advisory lock file.
    pub lock_path: PathBuf,
    /// Bound on the post-block resolution check.
    pub validation_timeout_secs: u64,
    /// How privileged commands are elevated.
    pub elevation: Elevation,
    /// Redirect page server.
    pub redirect: RedirectConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            active_profile: DEFAULT_PROFILE.to_string(),
            profiles: BTreeMap::from([(DEFAULT_PROFILE.to_string(), Profile::default())]),
            layers: LayerConfig::default(),
            hosts_path: PathBuf::from(DEFAULT_HOSTS_PATH),
            backup_dir: data_dir.join("backups"),
            backup_retention: DEFAULT_BACKUP_RETENTION,
            lock_path: default_lock_path(),
            validation_timeout_secs: DEFAULT_VALIDATION_TIMEOUT_SECS,
            elevation: Elevation::default(),
            redirect: RedirectConfig::default(),
        }
    }
}

impl Config {
    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "stopbrowsing", "stopbrowsing")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    /// Loads the config at `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        serde_json::from_str(&raw).map_err(|e| ConfigError::Json {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Writes the config as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        let io_err = |e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Json {
            path: path.to_path_buf(),
            source: e,
        })?;
        fs::write(path, json + "\n").map_err(io_err)?;

        info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Returns the named profile.
    pub fn profile(&self, name: &str) -> Result<&Profile> {
        self.profiles
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))
    }

    /// Returns the named profile for editing, creating it if needed.
    pub fn profile_mut(&mut self, name: &str) -> &mut Profile {
        self.profiles.entry(name.to_string()).or_default()
    }

    /// Returns the validator timeout.
    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }

    /// Builds the per-invocation context for `profile`, or the active one.
    pub fn session_context(&self, profile: Option<&str>) -> Result<SessionContext> {
        let name = profile.unwrap_or(&self.active_profile);
        let selected = self.profile(name)?;
        Ok(SessionContext::new(
            name,
            selected.domains.clone(),
            selected.exceptions.clone(),
            self.layers,
        ))
    }
}

/// Platform data directory, or a temp directory if none can be determined.
pub fn data_dir() -> PathBuf {
    ProjectDirs::from("com", "stopbrowsing", "stopbrowsing")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("stopbrowsing"))
}

/// Lock path shared by every user: [`LOCK_FILE`] in the first usable
/// [`SYSTEM_LOCK_DIRS`] entry, else in [`data_dir`].
pub fn default_lock_path() -> PathBuf {
    let candidates: Vec<&Path> = SYSTEM_LOCK_DIRS.iter().map(Path::new).collect();
    shared_lock_dir(&candidates)
        .unwrap_or_else(data_dir)
        .join(LOCK_FILE)
}

#[cfg(unix)]
fn shared_lock_dir(candidates: &[&Path]) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    candidates
        .iter()
        .find(|dir| {
            fs::metadata(dir)
                .map(|meta| meta.is_dir() && meta.permissions().mode() & 0o002 != 0)
                .unwrap_or(false)
        })
        .map(|dir| dir.to_path_buf())
}

#[cfg(not(unix))]
fn shared_lock_dir(_candidates: &[&Path]) -> Option<PathBuf> {
    None
}

fn hostname_regex() -> &'static Regex {
    static HOSTNAME: OnceLock<Regex> = OnceLock::new();
    HOSTNAME.get_or_init(|| {
        Regex::new(r"^(?i)[a-z0-9_](?:[a-z0-9_-]{0,61}[a-z0-9])?(?:\.[a-z0-9_](?:[a-z0-9_-]{0,61}[a-z0-9])?)*$")
            .expect("Invalid regex pattern")
    })
}

/// Strips a leading URL scheme such as `https://`.
fn strip_scheme(input: &str) -> &str {
    match input.find("://") {
        Some(idx) => &input[idx + 3..],
        None => input,
    }
}

/// Normalizes user input to a bare hostname.
///
/// Strips a scheme, a leading `www.`, any path, query, fragment or port,
/// surrounding whitespace and a trailing dot. Case is preserved. Returns
/// `None` if what remains is not a hostname.
pub fn clean_domain(input: &str) -> Option<String> {
    let rest = strip_scheme(input.trim());
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();

    let host = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    };

    let host = host.trim_end_matches('.');
    let host = match host.get(..4) {
        Some(prefix) if prefix.eq_ignore_ascii_case("www.") => &host[4..],
        _ => host,
    };

    if host.len() > 253 || !hostname_regex().is_match(host) {
        return None;
    }
    Some(host.to_string())
}

/// Normalizes an exception pattern.
///
/// Strips whitespace, the exception marker and a scheme. Bare domains are
/// cleaned like [`clean_domain`]; path and glob patterns are kept as typed.
pub fn clean_exception(input: &str) -> Option<String> {
    let trimmed = input.trim();
    let pattern = strip_scheme(trimmed.strip_prefix(EXCEPTION_MARKER).unwrap_or(trimmed).trim());

    if pattern.is_empty() || pattern.contains(char::is_whitespace) || pattern.starts_with('#') {
        return None;
    }
    if pattern.contains(['/', '*']) {
        return Some(pattern.to_string());
    }
    clean_domain(pattern)
}
