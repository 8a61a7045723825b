//! Human-readable output for reports.

use std::fmt::Write;

use stopbrowsing_core::{BlockReport, Profile, SessionStatus, UnblockReport};

fn present(flag: bool) -> &'static str {
    if flag {
        "present"
    } else {
        "absent"
    }
}

/// Renders a block report.
pub fn block_report(report: &BlockReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Profile: {}", report.profile);
    let _ = writeln!(out, "  hosts   {}", report.hosts);
    let _ = writeln!(out, "  dot     {}", report.dot);
    let _ = writeln!(out, "  doh     {}", report.doh);
    let _ = writeln!(out, "  cache   {}", report.cache);
    let _ = writeln!(out, "  check   {}", report.validation);
    let _ = writeln!(
        out,
        "Blocked {} domain(s), {} excluded by exceptions",
        report.blocked_count, report.excluded_count
    );
    for warning in report.warnings() {
        let _ = writeln!(out, "Warning: {warning}");
    }
    let _ = writeln!(
        out,
        "{}",
        if report.is_success() {
            "Block active"
        } else {
            "Block FAILED"
        }
    );
    out
}

/// Renders an unblock report.
pub fn unblock_report(report: &UnblockReport) -> String {
    if report.nothing_to_do {
        return "Nothing to unblock\n".to_string();
    }

    let mut out = String::new();
    if let Some(hosts) = &report.hosts {
        let _ = writeln!(out, "  hosts   {hosts}");
    }
    if let Some(cache) = &report.cache {
        let _ = writeln!(out, "  cache   {cache}");
    }
    if report.status.is_blocked() {
        out.push_str("Some layers are still in place:\n");
        out.push_str(&status(&report.status));
    } else {
        out.push_str("Unblocked\n");
    }
    out
}

/// Renders the live status.
pub fn status(status: &SessionStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Blocked: {}",
        if status.is_blocked() { "yes" } else { "no" }
    );
    let _ = writeln!(out, "  hosts   {}", present(status.hosts_present));
    let _ = writeln!(out, "  dot     {}", present(status.dot_present));
    let _ = writeln!(out, "  doh     {}", present(status.doh_present));
    if status.has_orphaned_firewall() {
        out.push_str("Firewall chains remain without a hosts section\n");
    }
    if !status.blocked_domains.is_empty() {
        let _ = writeln!(out, "Domains ({}):", status.blocked_domains.len());
        for domain in &status.blocked_domains {
            let _ = writeln!(out, "  {domain}");
        }
    }
    out
}

/// Renders a profile's lists. Exceptions carry the `+` marker.
pub fn profile(name: &str, profile: &Profile) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "# {name}: {} domain(s), {} exception(s)",
        profile.domains.len(),
        profile.exceptions.len()
    );
    for domain in &profile.domains {
        let _ = writeln!(out, "{domain}");
    }
    for exception in &profile.exceptions {
        let exception = exception.trim().trim_start_matches('+');
        let _ = writeln!(out, "+{exception}");
    }
    out
}
