//! Test doubles for the command runner and name resolver.
//!
//! `MockRunner` records every argv and emulates just enough of iptables
//! (chains, rules, links from OUTPUT, `-save` and transactional `-restore`)
//! and of coreutils (`cp`, `mv`, `rm`) for the firewall layer, the hosts
//! install and the session controller to be exercised end to end.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::net::IpAddr;
use std::sync::Mutex;

use crate::command::{CommandError, CommandOutput, CommandRunner, Result};
use crate::validator::NameResolver;

const DENIED: &str = "iptables v1.8.9: Permission denied (you must be root)";

#[derive(Default)]
struct MockState {
    calls: Vec<String>,
    missing: HashSet<String>,
    denied: HashSet<String>,
    failing: Vec<String>,
    tables: Tables,
}

#[derive(Default, Clone)]
struct Tables {
    /// "tool/chain" -> rules
    chains: HashMap<String, Vec<String>>,
    /// tool -> jump targets in OUTPUT
    links: HashMap<String, Vec<String>>,
}

/// `iptables-save` and `iptables-restore` act on the `iptables` family.
fn family(program: &str) -> &str {
    program
        .strip_suffix("-save")
        .or_else(|| program.strip_suffix("-restore"))
        .unwrap_or(program)
}

/// Records commands and emulates a firewall table in memory.
#[derive(Default)]
pub(crate) struct MockRunner {
    state: Mutex<MockState>,
}

impl MockRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The program behaves as if not installed.
    pub(crate) fn with_missing(self, program: &str) -> Self {
        self.state.lock().unwrap().missing.insert(program.to_string());
        self
    }

    /// Privileged invocations of the program, or of its `-save` and
    /// `-restore` companions, are refused.
    pub(crate) fn with_denied(self, program: &str) -> Self {
        self.state.lock().unwrap().denied.insert(program.to_string());
        self
    }

    /// Any command line starting with `prefix` exits with status 1. Lines of
    /// a restore payload are matched as `<family> <line>`.
    pub(crate) fn with_failing(self, prefix: &str) -> Self {
        self.state.lock().unwrap().failing.push(prefix.to_string());
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn chain_rules(&self, tool: &str, chain: &str) -> Option<Vec<String>> {
        self.state
            .lock()
            .unwrap()
            .tables
            .chains
            .get(&format!("{tool}/{chain}"))
            .cloned()
    }

    pub(crate) fn link_count(&self, tool: &str, chain: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .tables
            .links
            .get(tool)
            .map(|links| links.iter().filter(|t| *t == chain).count())
            .unwrap_or(0)
    }

    fn dispatch(&self, argv: &[&str], privileged: bool, input: Option<&str>) -> Result<CommandOutput> {
        let (program, args) = argv.split_first().ok_or(CommandError::Empty)?;
        let line = argv.join(" ");
        let family = family(program);

        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(if privileged { format!("# {line}") } else { line.clone() });

        if state.missing.contains(*program) || state.missing.contains(family) {
            return Err(CommandError::NotFound(program.to_string()));
        }
        if privileged && (state.denied.contains(*program) || state.denied.contains(family)) {
            return Ok(CommandOutput::failed(4, DENIED));
        }
        if state.failing.iter().any(|prefix| line.starts_with(prefix.as_str())) {
            return Ok(CommandOutput::failed(1, format!("{program}: simulated failure")));
        }

        match (*program, args) {
            ("iptables" | "ip6tables", _) => Ok(emulate_iptables(&mut state.tables, program, args)),
            ("iptables-save" | "ip6tables-save", _) => Ok(emulate_save(&state.tables, family)),
            ("iptables-restore" | "ip6tables-restore", _) => {
                Ok(emulate_restore(&mut state, family, input.unwrap_or_default()))
            }
            ("cp", [from, to]) => Ok(file_op(fs::copy(from, to).map(|_| ()))),
            ("mv", ["-f", from, to]) => Ok(file_op(fs::rename(from, to))),
            ("rm", ["-f", target]) => Ok(match fs::remove_file(target) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => CommandOutput::failed(1, e.to_string()),
                _ => CommandOutput::ok(),
            }),
            _ => Ok(CommandOutput::ok()),
        }
    }
}

fn file_op(result: io::Result<()>) -> CommandOutput {
    match result {
        Ok(()) => CommandOutput::ok(),
        Err(e) => CommandOutput::failed(1, e.to_string()),
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, argv: &[&str]) -> Result<CommandOutput> {
        self.dispatch(argv, false, None)
    }

    fn run_privileged(&self, argv: &[&str]) -> Result<CommandOutput> {
        self.dispatch(argv, true, None)
    }

    fn run_privileged_with_input(&self, argv: &[&str], input: &str) -> Result<CommandOutput> {
        self.dispatch(argv, true, Some(input))
    }
}

fn emulate_save(tables: &Tables, tool: &str) -> CommandOutput {
    let prefix = format!("{tool}/");
    let mut chains: Vec<(&str, &Vec<String>)> = tables
        .chains
        .iter()
        .filter_map(|(key, rules)| key.strip_prefix(prefix.as_str()).map(|c| (c, rules)))
        .collect();
    chains.sort();

    let mut out = String::from("*filter\n:INPUT ACCEPT [0:0]\n:FORWARD ACCEPT [0:0]\n:OUTPUT ACCEPT [0:0]\n");
    for (chain, _) in &chains {
        out.push_str(&format!(":{chain} - [0:0]\n"));
    }
    for target in tables.links.get(tool).into_iter().flatten() {
        out.push_str(&format!("-A OUTPUT -j {target}\n"));
    }
    for (chain, rules) in &chains {
        for rule in rules.iter() {
            out.push_str(&format!("-A {chain} {rule}\n"));
        }
    }
    out.push_str("COMMIT\n");
    CommandOutput::with_stdout(out)
}

/// Applies every line or none of them.
fn emulate_restore(state: &mut MockState, tool: &str, payload: &str) -> CommandOutput {
    let mut tables = state.tables.clone();

    for (number, line) in payload.lines().map(str::trim).enumerate() {
        if line.is_empty() || line.starts_with('#') || line == "*filter" || line == "COMMIT" {
            continue;
        }

        let rejected = state
            .failing
            .iter()
            .any(|prefix| format!("{tool} {line}").starts_with(prefix.as_str()));
        let out = if rejected {
            CommandOutput::failed(1, "simulated rule failure")
        } else if let Some(decl) = line.strip_prefix(':') {
            let chain = decl.split_whitespace().next().unwrap_or_default();
            if !["INPUT", "FORWARD", "OUTPUT"].contains(&chain) {
                tables
                    .chains
                    .entry(format!("{tool}/{chain}"))
                    .or_default()
                    .clear();
            }
            CommandOutput::ok()
        } else {
            let args: Vec<&str> = line.split_whitespace().collect();
            emulate_iptables(&mut tables, tool, &args)
        };

        if !out.success() {
            return CommandOutput::failed(
                1,
                format!("{tool}-restore: line {} failed: {}", number + 1, out.stderr),
            );
        }
    }

    state.tables = tables;
    CommandOutput::ok()
}

fn emulate_iptables(state: &mut Tables, tool: &str, args: &[&str]) -> CommandOutput {
    let args: Vec<&str> = args.iter().copied().filter(|a| *a != "-w").collect();
    let missing_chain = || CommandOutput::failed(1, "iptables: No chain/target/match by that name.");

    match args.as_slice() {
        ["--version"] => CommandOutput::with_stdout(format!("{tool} v1.8.9 (nf_tables)")),
        ["-N", chain] => {
            let key = format!("{tool}/{chain}");
            if state.chains.contains_key(&key) {
                CommandOutput::failed(1, "iptables: Chain already exists.")
            } else {
                state.chains.insert(key, Vec::new());
                CommandOutput::ok()
            }
        }
        ["-F", chain] => match state.chains.get_mut(&format!("{tool}/{chain}")) {
            Some(rules) => {
                rules.clear();
                CommandOutput::ok()
            }
            None => missing_chain(),
        },
        ["-X", chain] => {
            let linked = state
                .links
                .get(tool)
                .map(|l| l.iter().any(|t| t == chain))
                .unwrap_or(false);
            if linked {
                return CommandOutput::failed(1, "iptables: Too many links.");
            }
            match state.chains.remove(&format!("{tool}/{chain}")) {
                Some(_) => CommandOutput::ok(),
                None => missing_chain(),
            }
        }
        ["-n", "-L", chain] => match state.chains.get(&format!("{tool}/{chain}")) {
            Some(rules) => CommandOutput::with_stdout(rules.join("\n")),
            None => missing_chain(),
        },
        ["-C", "OUTPUT", "-j", chain] => {
            let linked = state
                .links
                .get(tool)
                .map(|l| l.iter().any(|t| t == chain))
                .unwrap_or(false);
            if linked {
                CommandOutput::ok()
            } else {
                CommandOutput::failed(1, "iptables: Bad rule (does a matching rule exist in that chain?).")
            }
        }
        ["-I", "OUTPUT", "-j", chain] => {
            if !state.chains.contains_key(&format!("{tool}/{chain}")) {
                return missing_chain();
            }
            state
                .links
                .entry(tool.to_string())
                .or_default()
                .insert(0, chain.to_string());
            CommandOutput::ok()
        }
        ["-D", "OUTPUT", "-j", chain] => {
            let links = state.links.entry(tool.to_string()).or_default();
            match links.iter().position(|t| t == chain) {
                Some(idx) => {
                    links.remove(idx);
                    CommandOutput::ok()
                }
                None => CommandOutput::failed(1, "iptables: Bad rule (does a matching rule exist in that chain?)."),
            }
        }
        ["-A", chain, rule @ ..] => match state.chains.get_mut(&format!("{tool}/{chain}")) {
            Some(rules) => {
                rules.push(rule.join(" "));
                CommandOutput::ok()
            }
            None => missing_chain(),
        },
        _ => CommandOutput::failed(2, format!("{tool}: unsupported arguments {args:?}")),
    }
}

/// Resolver returning fixed answers.
pub(crate) struct StaticResolver {
    answer: std::result::Result<Vec<IpAddr>, io::ErrorKind>,
}

impl StaticResolver {
    pub(crate) fn answering(addrs: &[&str]) -> Self {
        Self {
            answer: Ok(addrs.iter().map(|a| a.parse().unwrap()).collect()),
        }
    }

    pub(crate) fn failing(kind: io::ErrorKind) -> Self {
        Self { answer: Err(kind) }
    }
}

impl NameResolver for StaticResolver {
    fn resolve(&self, _host: &str) -> io::Result<Vec<IpAddr>> {
        match &self.answer {
            Ok(addrs) => Ok(addrs.clone()),
            Err(kind) => Err(io::Error::new(*kind, "simulated resolver failure")),
        }
    }
}
