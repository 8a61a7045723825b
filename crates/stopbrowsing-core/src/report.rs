//! Structured results of block, unblock and status.
//!
//! Every layer's outcome is reported individually so partial protection
//! can be diagnosed; the overall verdict is derived, never stored.

use serde::{Deserialize, Serialize};

use crate::cache::CacheOutcome;
use crate::error::ErrorKind;
use crate::firewall::FirewallError;
use crate::hosts::HostsError;
use crate::validator::ValidationOutcome;

/// Outcome of one enforcement layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LayerOutcome {
    /// Enabled and applied.
    Succeeded,
    /// Enabled but failed.
    Failed { kind: ErrorKind, message: String },
    /// Switched off in the layer configuration.
    DisabledByConfig,
    /// Enabled, but the mechanism is not installed on this host.
    Unavailable { message: String },
}

impl LayerOutcome {
    /// Creates a failed outcome.
    pub fn failed(kind: ErrorKind, message: impl ToString) -> Self {
        Self::Failed {
            kind,
            message: message.to_string(),
        }
    }

    /// Returns true if the layer was applied.
    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns true if the layer was enabled and failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Returns the short status label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded => "ok",
            Self::Failed { .. } => "failed",
            Self::DisabledByConfig => "disabled",
            Self::Unavailable { .. } => "unavailable",
        }
    }
}

impl From<&HostsError> for LayerOutcome {
    fn from(err: &HostsError) -> Self {
        Self::failed(err.kind(), err)
    }
}

impl From<&FirewallError> for LayerOutcome {
    fn from(err: &FirewallError) -> Self {
        match err {
            FirewallError::ToolUnavailable(_) => Self::Unavailable {
                message: err.to_string(),
            },
            _ => Self::failed(err.kind(), err),
        }
    }
}

impl std::fmt::Display for LayerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed { kind, message } => write!(f, "failed ({kind}): {message}"),
            Self::Unavailable { message } => write!(f, "unavailable: {message}"),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Live enforcement state, read back from the system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// The hosts section exists.
    pub hosts_present: bool,
    /// The DoT chain exists.
    pub dot_present: bool,
    /// The DoH chain exists.
    pub doh_present: bool,
    /// Domains listed in the hosts section, sorted.
    pub blocked_domains: Vec<String>,
}

impl SessionStatus {
    /// Returns true if any layer is in place.
    pub fn is_blocked(&self) -> bool {
        self.hosts_present || self.dot_present || self.doh_present
    }

    /// Returns true if firewall chains remain without a hosts section.
    pub fn has_orphaned_firewall(&self) -> bool {
        !self.hosts_present && (self.dot_present || self.doh_present)
    }
}

/// Result of a block run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReport {
    /// Profile the run used.
    pub profile: String,
    /// Layer 1.
    pub hosts: LayerOutcome,
    /// Layer 2.
    pub dot: LayerOutcome,
    /// Layer 3.
    pub doh: LayerOutcome,
    /// Resolver cache flush.
    pub cache: CacheOutcome,
    /// Post-block resolution check.
    pub validation: ValidationOutcome,
    /// Size of the effective block set.
    pub blocked_count: usize,
    /// Domains removed by exceptions.
    pub excluded_count: usize,
    /// The removed domains.
    pub excluded: Vec<String>,
    /// Path-scoped exceptions that could not be enforced.
    pub path_scoped_ignored: Vec<String>,
    /// Live state after the run.
    pub status: SessionStatus,
}

impl BlockReport {
    /// Overall verdict.
    ///
    /// The hosts layer is the minimum viable block. When it is switched
    /// off, the run succeeds if any firewall layer succeeded.
    pub fn is_success(&self) -> bool {
        match self.hosts {
            LayerOutcome::DisabledByConfig => self.dot.is_succeeded() || self.doh.is_succeeded(),
            ref hosts => hosts.is_succeeded(),
        }
    }

    /// Non-fatal problems worth showing to the operator.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for (name, outcome) in [("dot", &self.dot), ("doh", &self.doh)] {
            if matches!(outcome, LayerOutcome::Failed { .. } | LayerOutcome::Unavailable { .. }) {
                warnings.push(format!("{name} layer {outcome}"));
            }
        }
        if !self.cache.is_flushed() {
            warnings.push(self.cache.to_string());
        }
        if let ValidationOutcome::Unverified { .. } = self.validation {
            warnings.push(format!(
                "{}: {}",
                ErrorKind::ValidationInconclusive,
                self.validation
            ));
        }
        if !self.path_scoped_ignored.is_empty() {
            warnings.push(format!(
                "path-scoped exceptions not enforced: {}",
                self.path_scoped_ignored.join(", ")
            ));
        }

        warnings
    }
}

/// Result of an unblock run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnblockReport {
    /// Nothing was in place, so nothing was changed.
    pub nothing_to_do: bool,
    /// Hosts section removal, if attempted.
    pub hosts: Option<LayerOutcome>,
    /// Resolver cache flush, if attempted.
    pub cache: Option<CacheOutcome>,
    /// Live state after the run.
    pub status: SessionStatus,
}

impl UnblockReport {
    /// Report for a system that was not blocked.
    pub fn nothing_to_do(status: SessionStatus) -> Self {
        Self {
            nothing_to_do: true,
            hosts: None,
            cache: None,
            status,
        }
    }

    /// Returns false if the hosts section could not be removed.
    pub fn is_success(&self) -> bool {
        !self.hosts.as_ref().is_some_and(LayerOutcome::is_failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(hosts: LayerOutcome, dot: LayerOutcome, doh: LayerOutcome) -> BlockReport {
        BlockReport {
            profile: "default".into(),
            hosts,
            dot,
            doh,
            cache: CacheOutcome::Flushed {
                mechanism: "resolvectl".into(),
            },
            validation: ValidationOutcome::Verified {
                domain: "b.com".into(),
            },
            blocked_count: 1,
            excluded_count: 0,
            excluded: vec![],
            path_scoped_ignored: vec![],
            status: SessionStatus::default(),
        }
    }

    fn denied() -> LayerOutcome {
        LayerOutcome::failed(ErrorKind::PermissionDenied, "you must be root")
    }

    #[test]
    fn test_hosts_decides_success() {
        assert!(report(LayerOutcome::Succeeded, denied(), denied()).is_success());
        assert!(!report(denied(), LayerOutcome::Succeeded, LayerOutcome::Succeeded).is_success());
    }

    #[test]
    fn test_hosts_disabled_needs_a_firewall_layer() {
        let r = report(
            LayerOutcome::DisabledByConfig,
            denied(),
            LayerOutcome::Succeeded,
        );
        assert!(r.is_success());

        let r = report(
            LayerOutcome::DisabledByConfig,
            LayerOutcome::DisabledByConfig,
            LayerOutcome::DisabledByConfig,
        );
        assert!(!r.is_success());
    }

    #[test]
    fn test_warnings() {
        let mut r = report(
            LayerOutcome::Succeeded,
            LayerOutcome::Unavailable {
                message: "no firewall tool available".into(),
            },
            LayerOutcome::Succeeded,
        );
        r.validation = ValidationOutcome::Unverified {
            domain: "b.com".into(),
            reason: "resolves to 93.184.216.34".into(),
        };
        r.path_scoped_ignored = vec!["b.com/watch".into()];

        let warnings = r.warnings();
        assert_eq!(warnings.len(), 3);
        assert!(warnings[0].starts_with("dot layer unavailable"));
        assert!(warnings[1].starts_with("validation_inconclusive"));
        assert!(warnings[2].contains("b.com/watch"));
    }

    #[test]
    fn test_outcome_json_shape() {
        let json = serde_json::to_value(denied()).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["kind"], "permission_denied");

        let json = serde_json::to_value(LayerOutcome::DisabledByConfig).unwrap();
        assert_eq!(json["status"], "disabled_by_config");
    }

    #[test]
    fn test_firewall_error_mapping() {
        let outcome = LayerOutcome::from(&FirewallError::ToolUnavailable("iptables".into()));
        assert_eq!(outcome.label(), "unavailable");
    }

    #[test]
    fn test_status_derivation() {
        let status = SessionStatus {
            dot_present: true,
            ..SessionStatus::default()
        };
        assert!(status.is_blocked());
        assert!(status.has_orphaned_firewall());
        assert!(!SessionStatus::default().is_blocked());
    }

    #[test]
    fn test_unblock_success() {
        assert!(UnblockReport::nothing_to_do(SessionStatus::default()).is_success());
        let failed = UnblockReport {
            nothing_to_do: false,
            hosts: Some(denied()),
            cache: None,
            status: SessionStatus::default(),
        };
        assert!(!failed.is_success());
    }
}
