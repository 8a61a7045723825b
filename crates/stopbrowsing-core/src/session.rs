//! Session orchestration.
//!
//! [`SessionController`] sequences the layers for a block run:
//!
//! ```text
//! DomainFilter -> hosts section -> DoT chain -> DoH chain -> cache flush -> validation
//! ```
//!
//! and the inverse for unblock. No layer failure stops the ones after it;
//! each outcome lands in the report. Whether the system is blocked is
//! always read back from the hosts file and firewall tables, never kept in
//! memory, since either can be changed behind our back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::backup::BackupStore;
use crate::cache::CacheInvalidator;
use crate::command::SharedRunner;
use crate::config::{Config, LayerConfig};
use crate::domain_filter::DomainFilter;
use crate::error::ErrorKind;
use crate::firewall::{FirewallLayer, FirewallLayerManager};
use crate::hosts::{HostsError, HostsSectionManager};
use crate::lock::{LockError, SessionLock};
use crate::report::{BlockReport, LayerOutcome, SessionStatus, UnblockReport};
use crate::validator::{BlockValidator, ValidationOutcome};

/// Session errors. Layer failures are reported, not raised.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Another run holds the session lock.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Restoring the hosts file failed.
    #[error("restore failed: {0}")]
    Restore(#[from] HostsError),
}

impl SessionError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Lock(_) => ErrorKind::Other,
            Self::Restore(e) => e.kind(),
        }
    }
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Everything one block run needs, built once per invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Profile name, written into the hosts section header.
    pub profile: String,
    /// Raw domain list, in order.
    pub domains: Vec<String>,
    /// Raw exception patterns, in order.
    pub exceptions: Vec<String>,
    /// Layer switches.
    pub layers: LayerConfig,
}

impl SessionContext {
    /// Creates a context.
    pub fn new(
        profile: impl Into<String>,
        domains: Vec<String>,
        exceptions: Vec<String>,
        layers: LayerConfig,
    ) -> Self {
        Self {
            profile: profile.into(),
            domains,
            exceptions,
            layers,
        }
    }
}

/// Runs block, unblock and status across every layer.
pub struct SessionController {
    hosts: HostsSectionManager,
    firewall: FirewallLayerManager,
    cache: CacheInvalidator,
    validator: BlockValidator,
    lock_path: Option<PathBuf>,
}

impl SessionController {
    /// Creates a controller from its layers. No locking until [`with_lock`](Self::with_lock).
    pub fn new(
        hosts: HostsSectionManager,
        firewall: FirewallLayerManager,
        cache: CacheInvalidator,
        validator: BlockValidator,
    ) -> Self {
        Self {
            hosts,
            firewall,
            cache,
            validator,
            lock_path: None,
        }
    }

    /// Guards block, unblock and restore with the lock file at `path`.
    pub fn with_lock(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = Some(path.into());
        self
    }

    /// Wires every layer from the configuration.
    pub fn from_config(config: &Config, runner: SharedRunner) -> Self {
        let backups = BackupStore::new(&config.backup_dir, config.backup_retention);
        Self::new(
            HostsSectionManager::new(&config.hosts_path, backups, Arc::clone(&runner)),
            FirewallLayerManager::new(Arc::clone(&runner)),
            CacheInvalidator::new(runner),
            BlockValidator::system(config.validation_timeout()),
        )
        .with_lock(&config.lock_path)
    }

    /// Returns the hosts layer.
    pub fn hosts(&self) -> &HostsSectionManager {
        &self.hosts
    }

    /// Returns the firewall layers.
    pub fn firewall(&self) -> &FirewallLayerManager {
        &self.firewall
    }

    /// Returns the lock file path, if locking is enabled.
    pub fn lock_path(&self) -> Option<&Path> {
        self.lock_path.as_deref()
    }

    fn lock(&self) -> Result<Option<SessionLock>> {
        Ok(self
            .lock_path
            .as_ref()
            .map(|path| SessionLock::acquire(path))
            .transpose()?)
    }

    /// Enforces `ctx` on every enabled layer.
    ///
    /// Only lock contention is an error; layer failures are in the report.
    pub fn block(&self, ctx: &SessionContext) -> Result<BlockReport> {
        let _lock = self.lock()?;
        info!(
            profile = %ctx.profile,
            domains = ctx.domains.len(),
            exceptions = ctx.exceptions.len(),
            "Starting block"
        );

        let filtered = DomainFilter::new(&ctx.exceptions).apply(&ctx.domains);
        if !filtered.ignored_exceptions.is_empty() {
            warn!(
                "Path-scoped exceptions cannot be enforced per domain and are ignored: {}",
                filtered.ignored_exceptions.join(", ")
            );
        }

        let hosts = if ctx.layers.hosts_enabled() {
            match self.hosts.replace(&filtered.effective, &ctx.profile) {
                Ok(()) => LayerOutcome::Succeeded,
                Err(e) => {
                    error!("Hosts layer failed: {}", e);
                    LayerOutcome::from(&e)
                }
            }
        } else {
            info!("Hosts layer disabled by configuration");
            LayerOutcome::DisabledByConfig
        };

        let dot = self.apply_firewall(FirewallLayer::Dot, ctx.layers.dot_enabled(), &[]);
        let doh = self.apply_firewall(
            FirewallLayer::Doh,
            ctx.layers.doh_enabled(),
            &filtered.effective,
        );

        let cache = self.cache.invalidate();

        let validation = match (hosts.is_succeeded(), filtered.sample()) {
            (true, Some(sample)) => self.validator.validate(sample),
            (true, None) => ValidationOutcome::skipped("empty block set"),
            (false, _) => ValidationOutcome::skipped("hosts layer not applied"),
        };

        let report = BlockReport {
            profile: ctx.profile.clone(),
            hosts,
            dot,
            doh,
            cache,
            validation,
            blocked_count: filtered.blocked_count(),
            excluded_count: filtered.excluded_count(),
            excluded: filtered.excluded,
            path_scoped_ignored: filtered.ignored_exceptions,
            status: self.status(),
        };

        if report.is_success() {
            info!(
                blocked = report.blocked_count,
                excluded = report.excluded_count,
                "Block complete"
            );
        } else {
            error!("Block failed: no minimum viable layer was applied");
        }
        Ok(report)
    }

    /// Sets up an enabled firewall layer, or tears a disabled one down so
    /// the live state matches the configuration.
    fn apply_firewall(
        &self,
        layer: FirewallLayer,
        enabled: bool,
        domains: &[String],
    ) -> LayerOutcome {
        if !enabled {
            info!(layer = %layer, "Firewall layer disabled by configuration");
            self.firewall.remove_layer(layer);
            return LayerOutcome::DisabledByConfig;
        }

        let result = match layer {
            FirewallLayer::Dot => self.firewall.setup_dot(),
            FirewallLayer::Doh => self.firewall.setup_doh(domains),
        };
        match result {
            Ok(()) => LayerOutcome::Succeeded,
            Err(e) => {
                warn!(layer = %layer, "Firewall layer not applied: {}", e);
                LayerOutcome::from(&e)
            }
        }
    }

    /// Removes every layer. Both firewall chains are removed whatever the
    /// configuration says.
    pub fn unblock(&self) -> Result<UnblockReport> {
        let _lock = self.lock()?;

        let before = self.status();
        if !before.is_blocked() {
            info!("Nothing to unblock");
            return Ok(UnblockReport::nothing_to_do(before));
        }

        let hosts = match self.hosts.remove() {
            Ok(()) => LayerOutcome::Succeeded,
            Err(e) => {
                error!("Failed to remove hosts section: {}", e);
                LayerOutcome::from(&e)
            }
        };
        let cache = self.cache.invalidate();
        self.firewall.remove_all();

        let status = self.status();
        if status.is_blocked() {
            warn!(
                hosts = status.hosts_present,
                dot = status.dot_present,
                doh = status.doh_present,
                "Some layers are still present after unblock"
            );
        } else {
            info!("Unblock complete");
        }

        Ok(UnblockReport {
            nothing_to_do: false,
            hosts: Some(hosts),
            cache: Some(cache),
            status,
        })
    }

    /// Reads the live state of every layer.
    pub fn status(&self) -> SessionStatus {
        let firewall = self.firewall.present_layers();
        SessionStatus {
            hosts_present: self.hosts.is_present(),
            dot_present: firewall.contains(&FirewallLayer::Dot),
            doh_present: firewall.contains(&FirewallLayer::Doh),
            blocked_domains: self.hosts.list_blocked().into_iter().collect(),
        }
    }

    /// Writes the newest hosts backup back and flushes caches.
    pub fn restore(&self) -> Result<PathBuf> {
        let _lock = self.lock()?;
        let restored = self.hosts.restore_latest()?;
        self.cache.invalidate();
        Ok(restored)
    }
}
