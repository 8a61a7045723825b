//! Layers 2 and 3: firewall chains.
//!
//! Two tool-owned chains hang off `OUTPUT`:
//!
//! - [`DOT_CHAIN`] drops TCP and UDP to port 853 (DNS-over-TLS). Not keyed
//!   by domain.
//! - [`DOH_CHAIN`] drops TCP 80/443 packets whose payload contains a blocked
//!   domain as a byte string, catching TLS SNI and plain Host headers so a
//!   browser using DNS-over-HTTPS still cannot reach the site.
//!
//! Each change is one `iptables-restore --noflush` transaction per address
//! family, so a layer is either fully installed or untouched, and a run
//! needs one elevation per step instead of one per rule. The current table
//! is read first with `iptables-save` so the transaction can be built to
//! converge:
//!
//! - setup declares the chain (creating or flushing it), links it from
//!   `OUTPUT` only if the link is missing, then appends the rules. Running
//!   it twice leaves the same rule set.
//! - removal flushes the chain, drops every link and deletes it. Failures
//!   are logged and swallowed.
//!
//! Rules are applied to every available address family (`iptables`,
//! `ip6tables`), detected once per manager with `--version`.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::command::{CommandError, SharedRunner};
use crate::error::ErrorKind;

/// Chain holding the DNS-over-TLS port block.
pub const DOT_CHAIN: &str = "STOPBROWSING_DOT";

/// Chain holding the DNS-over-HTTPS string-match block.
pub const DOH_CHAIN: &str = "STOPBROWSING_DOH";

/// Built-in chain the owned chains are linked from.
pub const PARENT_CHAIN: &str = "OUTPUT";

/// DNS-over-TLS port.
pub const DOT_PORT: u16 = 853;

/// Web ports matched by the string block, in rule order.
pub const DOH_PORTS: [u16; 2] = [80, 443];

/// Firewall front ends, tried in order.
pub const FIREWALL_TOOLS: [&str; 2] = ["iptables", "ip6tables"];

/// Firewall errors.
#[derive(Debug, Error)]
pub enum FirewallError {
    /// No firewall front end is installed.
    #[error("no firewall tool available (tried {0})")]
    ToolUnavailable(String),

    /// The firewall refused the change.
    #[error("{tool}: permission denied: {message}")]
    PermissionDenied { tool: String, message: String },

    /// A firewall command failed. Restore transactions leave the table
    /// unchanged on failure.
    #[error("{tool}: failed to {step}: {source}")]
    CommandFailed {
        tool: String,
        step: String,
        #[source]
        source: CommandError,
    },
}

impl FirewallError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ToolUnavailable(_) => ErrorKind::ToolUnavailable,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::CommandFailed { source, .. } => source.kind(),
        }
    }
}

/// Result type for firewall operations.
pub type Result<T> = std::result::Result<T, FirewallError>;

/// One of the two firewall layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallLayer {
    /// DNS-over-TLS port block.
    Dot,
    /// DNS-over-HTTPS string-match block.
    Doh,
}

impl FirewallLayer {
    /// Returns the owned chain for this layer.
    pub fn chain(&self) -> &'static str {
        match self {
            Self::Dot => DOT_CHAIN,
            Self::Doh => DOH_CHAIN,
        }
    }

    /// Returns the layer as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dot => "dot",
            Self::Doh => "doh",
        }
    }
}

impl std::fmt::Display for FirewallLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Rule arguments appended to the DoT chain.
pub fn dot_rules() -> Vec<Vec<String>> {
    let port = DOT_PORT.to_string();
    ["tcp", "udp"]
        .into_iter()
        .map(|proto| {
            args(&[
                "-A",
                DOT_CHAIN,
                "-p",
                proto,
                "--dport",
                port.as_str(),
                "-j",
                "DROP",
            ])
        })
        .collect()
}

/// Rule arguments appended to the DoH chain, one per domain per port.
pub fn doh_rules(domains: &[String]) -> Vec<Vec<String>> {
    let mut rules = Vec::with_capacity(domains.len() * DOH_PORTS.len());
    for domain in domains {
        for port in DOH_PORTS {
            let port = port.to_string();
            rules.push(args(&[
                "-A",
                DOH_CHAIN,
                "-p",
                "tcp",
                "--dport",
                port.as_str(),
                "-m",
                "string",
                "--string",
                domain.as_str(),
                "--algo",
                "bm",
                "-j",
                "DROP",
            ]));
        }
    }
    rules
}

/// Manages the DoT and DoH chains.
pub struct FirewallLayerManager {
    runner: SharedRunner,
    tools: Vec<String>,
    available: OnceLock<Vec<String>>,
}

impl FirewallLayerManager {
    /// Creates a manager probing [`FIREWALL_TOOLS`].
    pub fn new(runner: SharedRunner) -> Self {
        Self::with_tools(runner, FIREWALL_TOOLS.iter().map(|t| t.to_string()).collect())
    }

    /// Creates a manager probing the given tools in order.
    pub fn with_tools(runner: SharedRunner, tools: Vec<String>) -> Self {
        Self {
            runner,
            tools,
            available: OnceLock::new(),
        }
    }

    /// Returns the installed firewall tools.
    pub fn available_tools(&self) -> &[String] {
        self.available.get_or_init(|| {
            self.tools
                .iter()
                .filter(|tool| self.is_installed(tool))
                .cloned()
                .collect()
        })
    }

    fn is_installed(&self, tool: &str) -> bool {
        match self.runner.run(&[tool, "--version"]) {
            Ok(out) if out.success() => {
                debug!(tool = %tool, "firewall tool available");
                true
            }
            Ok(_) => false,
            Err(e) => {
                debug!(tool = %tool, "firewall tool unavailable: {}", e);
                false
            }
        }
    }

    /// Installs the DoT port block.
    pub fn setup_dot(&self) -> Result<()> {
        self.setup_layer(FirewallLayer::Dot, &dot_rules())
    }

    /// Installs the DoH string-match block for `domains`.
    pub fn setup_doh(&self, domains: &[String]) -> Result<()> {
        self.setup_layer(FirewallLayer::Doh, &doh_rules(domains))
    }

    /// Removes the DoT chain. Never fails.
    pub fn remove_dot(&self) {
        self.remove_layer(FirewallLayer::Dot);
    }

    /// Removes the DoH chain. Never fails.
    pub fn remove_doh(&self) {
        self.remove_layer(FirewallLayer::Doh);
    }

    /// Removes both chains.
    pub fn remove_all(&self) {
        self.remove_dot();
        self.remove_doh();
    }

    /// Returns true if the DoT chain exists.
    pub fn is_dot_enabled(&self) -> bool {
        self.is_enabled(FirewallLayer::Dot)
    }

    /// Returns true if the DoH chain exists.
    pub fn is_doh_enabled(&self) -> bool {
        self.is_enabled(FirewallLayer::Doh)
    }

    /// Returns true if the layer's chain exists in any family.
    pub fn is_enabled(&self, layer: FirewallLayer) -> bool {
        self.present_layers().contains(&layer)
    }

    /// Returns the layers whose chain exists in any family, reading each
    /// family's table once.
    pub fn present_layers(&self) -> HashSet<FirewallLayer> {
        let mut present = HashSet::new();
        for tool in self.available_tools() {
            match self.snapshot(tool) {
                Ok(table) => {
                    for layer in [FirewallLayer::Dot, FirewallLayer::Doh] {
                        if table.has_chain(layer.chain()) {
                            present.insert(layer);
                        }
                    }
                }
                Err(e) => debug!(tool = %tool, "cannot read firewall table: {}", e),
            }
        }
        present
    }

    /// Installs `rules` for `layer` on every available family.
    ///
    /// Succeeds only if every family succeeded.
    pub fn setup_layer(&self, layer: FirewallLayer, rules: &[Vec<String>]) -> Result<()> {
        let tools = self.available_tools();
        if tools.is_empty() {
            return Err(FirewallError::ToolUnavailable(self.tools.join(", ")));
        }

        let mut first_error = None;
        for tool in tools {
            match self.setup_on(tool, layer.chain(), rules) {
                Ok(()) => {
                    info!(tool = %tool, layer = %layer, rules = rules.len(), "Firewall layer installed");
                }
                Err(e) => {
                    warn!(tool = %tool, layer = %layer, "Firewall layer setup failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn setup_on(&self, tool: &str, chain: &str, rules: &[Vec<String>]) -> Result<()> {
        let table = self.snapshot(tool)?;
        let payload = setup_payload(chain, table.link_count(chain) > 0, rules);
        self.restore(tool, &payload)
    }

    /// Unlinks, flushes and deletes the layer's chain on every family.
    pub fn remove_layer(&self, layer: FirewallLayer) {
        let chain = layer.chain();
        for tool in self.available_tools() {
            let table = match self.snapshot(tool) {
                Ok(table) => table,
                Err(e) => {
                    warn!(tool = %tool, layer = %layer, "Cannot read firewall table: {}", e);
                    continue;
                }
            };

            let Some(payload) = removal_payload(chain, &table) else {
                debug!(tool = %tool, layer = %layer, "firewall layer already absent");
                continue;
            };
            match self.restore(tool, &payload) {
                Ok(()) => debug!(tool = %tool, layer = %layer, "firewall layer removed"),
                Err(e) => warn!(tool = %tool, layer = %layer, "Firewall layer removal failed: {}", e),
            }
        }
    }

    /// Reads the filter table of one family.
    fn snapshot(&self, tool: &str) -> Result<TableSnapshot> {
        let program = format!("{tool}-save");
        let out = self
            .runner
            .run_privileged(&[program.as_str(), "-t", "filter"])
            .and_then(|out| out.check(&program))
            .map_err(|e| classify(tool, "read table", e))?;
        Ok(TableSnapshot::parse(&out.stdout))
    }

    /// Applies `payload` to one family as a single transaction.
    fn restore(&self, tool: &str, payload: &str) -> Result<()> {
        let program = format!("{tool}-restore");
        self.runner
            .run_privileged_with_input(&[program.as_str(), "-w", "--noflush"], payload)
            .and_then(|out| out.check(&program))
            .map(|_| ())
            .map_err(|e| classify(tool, "restore", e))
    }
}

fn classify(tool: &str, step: &str, error: CommandError) -> FirewallError {
    match error {
        CommandError::PermissionDenied { message, .. } => FirewallError::PermissionDenied {
            tool: tool.to_string(),
            message,
        },
        CommandError::NotFound(_) => FirewallError::ToolUnavailable(tool.to_string()),
        other => FirewallError::CommandFailed {
            tool: tool.to_string(),
            step: step.to_string(),
            source: other,
        },
    }
}

/// Chains and `OUTPUT` links of one family's filter table, as printed by
/// `iptables-save -t filter`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSnapshot {
    chains: HashSet<String>,
    links: HashMap<String, usize>,
}

impl TableSnapshot {
    /// Parses `iptables-save` output. Tables other than `filter` are skipped.
    pub fn parse(output: &str) -> Self {
        let mut snapshot = Self::default();
        let mut in_filter = false;

        for line in output.lines().map(str::trim) {
            if let Some(table) = line.strip_prefix('*') {
                in_filter = table == "filter";
                continue;
            }
            if !in_filter {
                continue;
            }
            if let Some(decl) = line.strip_prefix(':') {
                if let Some(name) = decl.split_whitespace().next() {
                    snapshot.chains.insert(name.to_string());
                }
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            if let ["-A", PARENT_CHAIN, "-j", target] = fields.as_slice() {
                *snapshot.links.entry(target.to_string()).or_default() += 1;
            }
        }

        snapshot
    }

    /// Returns true if `chain` exists.
    pub fn has_chain(&self, chain: &str) -> bool {
        self.chains.contains(chain)
    }

    /// Number of plain jumps from `OUTPUT` to `chain`.
    pub fn link_count(&self, chain: &str) -> usize {
        self.links.get(chain).copied().unwrap_or(0)
    }
}

/// Builds the restore transaction installing `rules` in `chain`.
///
/// Declaring the chain creates it, or flushes it if it exists.
pub fn setup_payload(chain: &str, linked: bool, rules: &[Vec<String>]) -> String {
    let mut payload = format!("*filter\n:{chain} - [0:0]\n");
    if !linked {
        payload.push_str(&format!("-I {PARENT_CHAIN} -j {chain}\n"));
    }
    for rule in rules {
        payload.push_str(&rule.join(" "));
        payload.push('\n');
    }
    payload.push_str("COMMIT\n");
    payload
}

/// Builds the restore transaction deleting `chain`, or `None` if there is
/// nothing to remove.
pub fn removal_payload(chain: &str, table: &TableSnapshot) -> Option<String> {
    let links = table.link_count(chain);
    if !table.has_chain(chain) && links == 0 {
        return None;
    }

    let mut payload = String::from("*filter\n");
    if table.has_chain(chain) {
        payload.push_str(&format!(":{chain} - [0:0]\n"));
    }
    for _ in 0..links {
        payload.push_str(&format!("-D {PARENT_CHAIN} -j {chain}\n"));
    }
    if table.has_chain(chain) {
        payload.push_str(&format!("-X {chain}\n"));
    }
    payload.push_str("COMMIT\n");
    Some(payload)
}
