//! Error taxonomy shared by every enforcement layer.
//!
//! Each module owns its own error enum; [`ErrorKind`] is the coarse
//! classification reported upward so callers can tell a missing tool
//! from a refused privilege without matching on every variant.

use serde::{Deserialize, Serialize};

use crate::command::CommandError;

/// Coarse error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A privileged operation was rejected.
    PermissionDenied,
    /// An expected external mechanism is not installed.
    ToolUnavailable,
    /// A mutation was attempted but did not take effect.
    WriteVerificationFailed,
    /// Live re-resolution did not confirm the block.
    ValidationInconclusive,
    /// Anything else (I/O, unexpected exit status).
    Other,
}

impl ErrorKind {
    /// Returns the kind as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission_denied",
            Self::ToolUnavailable => "tool_unavailable",
            Self::WriteVerificationFailed => "write_verification_failed",
            Self::ValidationInconclusive => "validation_inconclusive",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl CommandError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::ToolUnavailable,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::Failed { .. } | Self::Spawn { .. } | Self::Empty => ErrorKind::Other,
        }
    }
}

/// Classifies an I/O error.
pub(crate) fn io_kind(err: &std::io::Error) -> ErrorKind {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        _ => ErrorKind::Other,
    }
}
