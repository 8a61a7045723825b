//! Resolver cache invalidation.
//!
//! After any hosts or firewall change the local resolver may still answer
//! from cache. Invalidation walks an ordered list of [`CacheMechanism`]s and
//! stops at the first one that is present and flushes successfully. Nothing
//! here is fatal: finding no working mechanism is reported as a warning.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, SharedRunner};

/// Alternative local resolver daemons restarted as a last resort.
pub const FALLBACK_DAEMONS: [&str; 4] = ["nscd", "dnsmasq", "unbound", "named"];

/// One way of flushing a resolver cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMechanism {
    /// Human-readable mechanism name.
    pub name: String,
    /// Unprivileged command that succeeds when the mechanism is present.
    pub detect: Vec<String>,
    /// Privileged command performing the flush.
    pub flush: Vec<String>,
}

impl CacheMechanism {
    /// Creates a mechanism.
    pub fn new(name: impl Into<String>, detect: &[&str], flush: &[&str]) -> Self {
        Self {
            name: name.into(),
            detect: detect.iter().map(|s| s.to_string()).collect(),
            flush: flush.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Mechanism restarting a systemd-managed daemon if it is active.
    pub fn service_restart(service: &str) -> Self {
        Self::new(
            format!("restart {service}"),
            &["systemctl", "is-active", "--quiet", service],
            &["systemctl", "restart", service],
        )
    }

    /// Returns true if the mechanism appears to be present.
    pub fn is_present(&self, runner: &dyn CommandRunner) -> bool {
        let argv: Vec<&str> = self.detect.iter().map(String::as_str).collect();
        runner.run(&argv).map(|out| out.success()).unwrap_or(false)
    }

    /// Runs the flush. Returns true on success.
    pub fn flush(&self, runner: &dyn CommandRunner) -> bool {
        let argv: Vec<&str> = self.flush.iter().map(String::as_str).collect();
        match runner.run_privileged(&argv) {
            Ok(out) if out.success() => true,
            Ok(out) => {
                debug!(mechanism = %self.name, "flush failed: {}", out.stderr.trim());
                false
            }
            Err(e) => {
                debug!(mechanism = %self.name, "flush failed: {}", e);
                false
            }
        }
    }
}

/// The default mechanism order.
pub fn default_mechanisms() -> Vec<CacheMechanism> {
    let mut mechanisms = vec![
        CacheMechanism::new(
            "resolvectl",
            &["resolvectl", "--version"],
            &["resolvectl", "flush-caches"],
        ),
        CacheMechanism::new(
            "systemd-resolve",
            &["systemd-resolve", "--version"],
            &["systemd-resolve", "--flush-caches"],
        ),
        CacheMechanism::service_restart("systemd-resolved"),
    ];
    mechanisms.extend(FALLBACK_DAEMONS.iter().map(|d| CacheMechanism::service_restart(d)));
    mechanisms
}

/// Result of a cache invalidation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CacheOutcome {
    /// The named mechanism flushed successfully.
    Flushed { mechanism: String },
    /// No mechanism was present or none succeeded.
    NoMechanism { attempted: Vec<String> },
}

impl CacheOutcome {
    /// Returns true if some cache was flushed.
    pub fn is_flushed(&self) -> bool {
        matches!(self, Self::Flushed { .. })
    }
}

impl std::fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flushed { mechanism } => write!(f, "flushed via {mechanism}"),
            Self::NoMechanism { attempted } if attempted.is_empty() => {
                write!(f, "no cache flush mechanism found")
            }
            Self::NoMechanism { attempted } => {
                write!(f, "no cache flush succeeded (tried {})", attempted.join(", "))
            }
        }
    }
}

/// Best-effort resolver cache flusher.
pub struct CacheInvalidator {
    runner: SharedRunner,
    mechanisms: Vec<CacheMechanism>,
}

impl CacheInvalidator {
    /// Creates an invalidator with [`default_mechanisms`].
    pub fn new(runner: SharedRunner) -> Self {
        Self::with_mechanisms(runner, default_mechanisms())
    }

    /// Creates an invalidator with a custom mechanism order.
    pub fn with_mechanisms(runner: SharedRunner, mechanisms: Vec<CacheMechanism>) -> Self {
        Self { runner, mechanisms }
    }

    /// Returns the mechanism order.
    pub fn mechanisms(&self) -> &[CacheMechanism] {
        &self.mechanisms
    }

    /// Flushes the first present mechanism that works.
    pub fn invalidate(&self) -> CacheOutcome {
        let mut attempted = Vec::new();

        for mechanism in &self.mechanisms {
            if !mechanism.is_present(self.runner.as_ref()) {
                continue;
            }
            attempted.push(mechanism.name.clone());
            if mechanism.flush(self.runner.as_ref()) {
                info!(mechanism = %mechanism.name, "DNS cache flushed");
                return CacheOutcome::Flushed {
                    mechanism: mechanism.name.clone(),
                };
            }
        }

        let outcome = CacheOutcome::NoMechanism { attempted };
        warn!("DNS cache not flushed: {}", outcome);
        outcome
    }
}
