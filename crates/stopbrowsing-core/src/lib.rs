//! StopBrowsing Core - multi-layer DNS blocking engine.
//!
//! Computes the effective block set from a profile, enforces it on the
//! local machine, checks that it took effect and reverses every change on
//! unblock.
//!
//! ## Layers
//!
//! 1. A managed section of the hosts file pointing blocked domains at
//!    loopback ([`hosts`]).
//! 2. A firewall chain dropping DNS-over-TLS on port 853 ([`firewall`]).
//! 3. A firewall chain dropping web traffic whose payload names a blocked
//!    domain, defeating DNS-over-HTTPS ([`firewall`]).
//!
//! After enforcement the resolver cache is flushed ([`cache`]) and one
//! domain is re-resolved to confirm the block ([`validator`]).
//!
//! ## Architecture
//!
//! ```text
//! Config → SessionContext → SessionController
//!                               │
//!          ┌────────────────────┼──────────────────────┐
//!          ▼                    ▼                      ▼
//!     DomainFilter      HostsSectionManager    FirewallLayerManager
//!                               │                      │
//!                               └──── CommandRunner ───┘
//!                                         │
//!                               CacheInvalidator → BlockValidator
//! ```
//!
//! Every privileged action goes through [`command::CommandRunner`], so the
//! whole engine runs against a mock in tests.

pub mod backup;
pub mod cache;
pub mod command;
pub mod config;
pub mod domain_filter;
pub mod error;
pub mod firewall;
pub mod hosts;
pub mod lock;
pub mod report;
pub mod session;
pub mod validator;

#[cfg(test)]
mod testing;

pub use backup::{BackupError, BackupStore};
pub use cache::{CacheInvalidator, CacheOutcome, CacheMechanism};
pub use command::{CommandError, CommandOutput, CommandRunner, Elevation, SharedRunner, SystemRunner};
pub use config::{clean_domain, Config, ConfigError, LayerConfig, Profile, RedirectConfig};
pub use domain_filter::{DomainFilter, ExceptionRule, FilterOutcome};
pub use error::ErrorKind;
pub use firewall::{FirewallError, FirewallLayer, FirewallLayerManager};
pub use hosts::{HostsError, HostsSectionManager};
pub use lock::{LockError, SessionLock};
pub use report::{BlockReport, LayerOutcome, SessionStatus, UnblockReport};
pub use session::{SessionContext, SessionController, SessionError};
pub use validator::{BlockValidator, NameResolver, SystemResolver, ValidationOutcome};
