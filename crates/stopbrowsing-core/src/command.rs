//! Privileged command runner.
//!
//! Every external tool the engine drives (firewall tables, resolver
//! services, privileged file installs) goes through [`CommandRunner`].
//! The engine only ever sees argv in and exit status plus output back,
//! so it can be exercised in tests without real privilege escalation.
//!
//! ## Elevation
//!
//! [`SystemRunner`] prefixes privileged invocations with an elevation tool:
//!
//! - nothing when the process already runs as root
//! - `pkexec` in a graphical session (PolicyKit prompt)
//! - `sudo` on a terminal

use std::io::{ErrorKind as IoErrorKind, Write};
use std::process::{Command, Stdio};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors raised while running an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The program is not installed.
    #[error("command not found: {0}")]
    NotFound(String),

    /// The program ran but was refused the privilege it needed.
    #[error("permission denied running {program}: {message}")]
    PermissionDenied { program: String, message: String },

    /// The program ran and exited unsuccessfully.
    #[error("{program} exited with status {status}: {message}")]
    Failed {
        program: String,
        status: String,
        message: String,
    },

    /// The program could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// An empty argv was supplied.
    #[error("empty command line")]
    Empty,
}

/// Result type for command operations.
pub type Result<T> = std::result::Result<T, CommandError>;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub status: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// A successful, silent exit.
    pub fn ok() -> Self {
        Self {
            status: Some(0),
            ..Self::default()
        }
    }

    /// A successful exit with the given stdout.
    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// An unsuccessful exit with the given code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true if the command exited with status zero.
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Converts an unsuccessful exit into a classified [`CommandError`].
    pub fn check(self, program: &str) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }

        let message = self.stderr.trim().to_string();
        if looks_like_permission_denied(&message) {
            return Err(CommandError::PermissionDenied {
                program: program.to_string(),
                message,
            });
        }

        Err(CommandError::Failed {
            program: program.to_string(),
            status: self
                .status
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            message,
        })
    }
}

/// Heuristic classification of a failure message as a privilege refusal.
///
/// Covers iptables, sudo, pkexec and coreutils wording.
pub fn looks_like_permission_denied(message: &str) -> bool {
    let lower = message.to_lowercase();
    [
        "permission denied",
        "not permitted",
        "must be root",
        "you must be root",
        "a password is required",
        "dismissed",
        "cancelled",
        "not authorized",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

/// Narrow interface to external programs.
pub trait CommandRunner {
    /// Runs `argv` as the current user.
    fn run(&self, argv: &[&str]) -> Result<CommandOutput>;

    /// Runs `argv` with elevated privilege.
    fn run_privileged(&self, argv: &[&str]) -> Result<CommandOutput> {
        self.run(argv)
    }

    /// Runs `argv` with elevated privilege, feeding `input` on stdin.
    ///
    /// Batch tools such as `iptables-restore` take their whole payload this
    /// way, so one elevation covers many changes.
    fn run_privileged_with_input(&self, argv: &[&str], input: &str) -> Result<CommandOutput>;
}

/// Runner shared by every component of a session.
pub type SharedRunner = Arc<dyn CommandRunner + Send + Sync>;

/// How privileged commands obtain elevation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Elevation {
    /// Pick based on the current user and session type.
    #[default]
    Auto,
    /// Run privileged commands directly.
    None,
    /// Prefix with `sudo`.
    Sudo,
    /// Prefix with `pkexec`.
    Pkexec,
}

impl Elevation {
    /// Returns the mode as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::None => "none",
            Self::Sudo => "sudo",
            Self::Pkexec => "pkexec",
        }
    }

    /// Resolves `Auto` to a concrete mode for this process.
    pub fn resolve(self) -> Self {
        match self {
            Self::Auto => {
                if is_root() {
                    Self::None
                } else if std::env::var("DISPLAY").is_ok()
                    || std::env::var("WAYLAND_DISPLAY").is_ok()
                {
                    Self::Pkexec
                } else {
                    Self::Sudo
                }
            }
            other => other,
        }
    }

    fn prefix(&self) -> Option<&'static str> {
        match self {
            Self::Sudo => Some("sudo"),
            Self::Pkexec => Some("pkexec"),
            Self::Auto | Self::None => None,
        }
    }
}

impl std::fmt::Display for Elevation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Returns true when the effective user is root.
fn is_root() -> bool {
    Command::new("id")
        .arg("-u")
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).trim() == "0")
        .unwrap_or(false)
}

/// Runs real processes via `std::process::Command`.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    elevation: Elevation,
}

impl SystemRunner {
    /// Creates a runner, resolving `Auto` elevation immediately.
    pub fn new(elevation: Elevation) -> Self {
        let elevation = elevation.resolve();
        debug!(elevation = %elevation, "command runner ready");
        Self { elevation }
    }

    /// Returns the resolved elevation mode.
    pub fn elevation(&self) -> Elevation {
        self.elevation
    }

    fn spawn(argv: &[&str], input: Option<&str>) -> Result<CommandOutput> {
        let (program, args) = argv.split_first().ok_or(CommandError::Empty)?;
        let spawn_error = |e: std::io::Error| {
            if e.kind() == IoErrorKind::NotFound {
                CommandError::NotFound(program.to_string())
            } else {
                CommandError::Spawn {
                    program: program.to_string(),
                    source: e,
                }
            }
        };

        debug!(command = %argv.join(" "), "running");
        let mut child = Command::new(program)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(input.as_bytes()).map_err(spawn_error)?;
        }
        let output = child.wait_with_output().map_err(spawn_error)?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn elevated<'a>(&self, argv: &[&'a str]) -> Vec<&'a str> {
        let mut full = Vec::with_capacity(argv.len() + 1);
        if let Some(tool) = self.elevation.prefix() {
            full.push(tool);
        }
        full.extend_from_slice(argv);
        full
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(Elevation::Auto)
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, argv: &[&str]) -> Result<CommandOutput> {
        Self::spawn(argv, None)
    }

    fn run_privileged(&self, argv: &[&str]) -> Result<CommandOutput> {
        Self::spawn(&self.elevated(argv), None)
    }

    fn run_privileged_with_input(&self, argv: &[&str], input: &str) -> Result<CommandOutput> {
        Self::spawn(&self.elevated(argv), Some(input))
    }
}
