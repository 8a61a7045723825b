//! Post-enforcement check.
//!
//! Resolves one blocked domain through the OS resolver and reports whether
//! the answer is the loopback address the hosts section points it at. An
//! unverified result is only a warning: browser-internal caches and
//! encrypted DNS can hide a block that is in fact effective for other
//! programs, and vice versa.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Default bound on a single resolution.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Name resolution seam.
pub trait NameResolver {
    /// Resolves `host` to its addresses.
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system (honours the hosts file).
///
/// Lookups run on a worker thread and are abandoned after the timeout.
#[derive(Debug, Clone)]
pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    /// Creates a resolver with the given timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl NameResolver for SystemResolver {
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let (tx, rx) = mpsc::channel();
        let target = host.to_string();

        thread::Builder::new()
            .name("stopbrowsing-resolve".into())
            .spawn(move || {
                let result = (target.as_str(), 0)
                    .to_socket_addrs()
                    .map(|addrs| addrs.map(|a| a.ip()).collect::<Vec<_>>());
                // The receiver may have timed out already.
                let _ = tx.send(result);
            })?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("resolving {host} timed out after {:?}", self.timeout),
            )),
        }
    }
}

/// Result of a validation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ValidationOutcome {
    /// The sample resolved to loopback.
    Verified { domain: String },
    /// The sample did not resolve to loopback, or resolution failed.
    Unverified { domain: String, reason: String },
    /// Nothing to validate.
    Skipped { reason: String },
}

impl ValidationOutcome {
    /// Returns true if the block was observed.
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }

    /// Creates a skipped outcome.
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ValidationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Verified { domain } => write!(f, "verified ({domain} resolves to loopback)"),
            Self::Unverified { domain, reason } => write!(f, "unverified ({domain}: {reason})"),
            Self::Skipped { reason } => write!(f, "skipped ({reason})"),
        }
    }
}

/// Checks that a blocked domain resolves to loopback.
pub struct BlockValidator {
    resolver: Box<dyn NameResolver + Send + Sync>,
}

impl BlockValidator {
    /// Creates a validator over the given resolver.
    pub fn new(resolver: Box<dyn NameResolver + Send + Sync>) -> Self {
        Self { resolver }
    }

    /// Creates a validator using the OS resolver.
    pub fn system(timeout: Duration) -> Self {
        Self::new(Box::new(SystemResolver::new(timeout)))
    }

    /// Resolves `domain` and compares against the block addresses.
    ///
    /// Every answer must be a block address; a mix means some lookups
    /// still reach the real site.
    pub fn validate(&self, domain: &str) -> ValidationOutcome {
        let outcome = match self.resolver.resolve(domain) {
            Ok(addrs) if addrs.is_empty() => ValidationOutcome::Unverified {
                domain: domain.to_string(),
                reason: "no addresses returned".to_string(),
            },
            Ok(addrs) if addrs.iter().all(is_block_address) => ValidationOutcome::Verified {
                domain: domain.to_string(),
            },
            Ok(addrs) => {
                let leaked = join_addrs(addrs.iter().filter(|a| !is_block_address(a)));
                let reason = if addrs.iter().any(is_block_address) {
                    format!("also resolves to {leaked}")
                } else {
                    format!("resolves to {leaked}")
                };
                ValidationOutcome::Unverified {
                    domain: domain.to_string(),
                    reason,
                }
            }
            Err(e) => ValidationOutcome::Unverified {
                domain: domain.to_string(),
                reason: e.to_string(),
            },
        };

        if outcome.is_verified() {
            info!(domain = %domain, "Block verified");
        } else {
            warn!(
                "Block not verified: {}. Browser caches or encrypted DNS may mask the result",
                outcome
            );
        }
        outcome
    }
}

fn join_addrs<'a>(addrs: impl Iterator<Item = &'a IpAddr>) -> String {
    addrs.map(|a| a.to_string()).collect::<Vec<_>>().join(", ")
}

/// Returns true for the exact addresses the hosts section writes.
fn is_block_address(addr: &IpAddr) -> bool {
    *addr == IpAddr::V4(Ipv4Addr::LOCALHOST) || *addr == IpAddr::V6(Ipv6Addr::LOCALHOST)
}
