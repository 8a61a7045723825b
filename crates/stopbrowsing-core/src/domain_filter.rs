//! Exception filtering.
//!
//! Turns the raw profile domain list into the effective block set.
//!
//! An exception removes a domain only when it is *domain-wide*, i.e. it is
//! textually one of:
//!
//! - `example.com`
//! - `example.com/*`
//! - `*.example.com`
//!
//! Anything else (`example.com/watch`, `*.example.com/*`, free-form globs) is
//! path-scoped. Path-scoped exceptions are accepted and kept, but every
//! enforcement layer works per domain, so they cannot carve a path out of
//! a blocked domain and are ignored when building the block set.
//!
//! ## Usage
//!
//! ```
//! use stopbrowsing_core::domain_filter::DomainFilter;
//!
//! let filter = DomainFilter::new(["a.com"]);
//! let outcome = filter.apply(&["a.com", "b.com"]);
//! assert_eq!(outcome.effective, vec!["b.com".to_string()]);
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Optional prefix marking a profile line as an exception.
pub const EXCEPTION_MARKER: char = '+';

/// How much of a domain an exception covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionScope {
    /// Covers the whole domain.
    DomainWide,
    /// Covers only part of a domain; not enforceable per domain.
    PathScoped,
}

/// A single parsed exception pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRule {
    pattern: String,
    scope: ExceptionScope,
}

impl ExceptionRule {
    /// Parses a raw exception line.
    ///
    /// Strips surrounding whitespace and an optional [`EXCEPTION_MARKER`].
    /// Returns `None` for blank lines and `#` comments.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let pattern = trimmed
            .strip_prefix(EXCEPTION_MARKER)
            .unwrap_or(trimmed)
            .trim();

        if pattern.is_empty() || pattern.starts_with('#') {
            return None;
        }

        let scope = if domain_wide_target(pattern).is_some() {
            ExceptionScope::DomainWide
        } else {
            ExceptionScope::PathScoped
        };

        Some(Self {
            pattern: pattern.to_string(),
            scope,
        })
    }

    /// Returns the pattern with the marker stripped.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Returns the scope of this exception.
    pub fn scope(&self) -> ExceptionScope {
        self.scope
    }

    /// Returns true if this exception covers a whole domain.
    pub fn is_domain_wide(&self) -> bool {
        self.scope == ExceptionScope::DomainWide
    }

    /// Returns true if this exception removes `domain` from the block set.
    ///
    /// Comparison is textual; no case folding is applied.
    pub fn excludes(&self, domain: &str) -> bool {
        self.is_domain_wide() && domain_wide_target(&self.pattern) == Some(domain)
    }
}

/// Returns the bare domain a domain-wide pattern refers to.
fn domain_wide_target(pattern: &str) -> Option<&str> {
    let target = if let Some(rest) = pattern.strip_prefix("*.") {
        rest
    } else if let Some(rest) = pattern.strip_suffix("/*") {
        rest
    } else {
        pattern
    };

    if is_bare_domain(target) {
        Some(target)
    } else {
        None
    }
}

fn is_bare_domain(s: &str) -> bool {
    !s.is_empty() && !s.contains(['/', '*']) && !s.chars().any(char::is_whitespace)
}

/// Result of applying exceptions to a domain list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOutcome {
    /// Domains to enforce, unique, in input order.
    pub effective: Vec<String>,
    /// Domains removed by a domain-wide exception, unique, in input order.
    pub excluded: Vec<String>,
    /// Path-scoped exception patterns that could not be enforced.
    pub ignored_exceptions: Vec<String>,
}

impl FilterOutcome {
    /// Number of domains that will be blocked.
    pub fn blocked_count(&self) -> usize {
        self.effective.len()
    }

    /// Number of domains removed by exceptions.
    pub fn excluded_count(&self) -> usize {
        self.excluded.len()
    }

    /// Returns the first effective domain, used as the validation sample.
    pub fn sample(&self) -> Option<&str> {
        self.effective.first().map(String::as_str)
    }
}

/// Applies exception rules to a domain list.
#[derive(Debug, Clone, Default)]
pub struct DomainFilter {
    rules: Vec<ExceptionRule>,
}

impl DomainFilter {
    /// Creates a filter from raw exception lines.
    pub fn new<I, S>(exceptions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rules = exceptions
            .into_iter()
            .filter_map(|raw| ExceptionRule::parse(raw.as_ref()))
            .collect();
        Self { rules }
    }

    /// Returns the parsed rules.
    pub fn rules(&self) -> &[ExceptionRule] {
        &self.rules
    }

    /// Returns true if any domain-wide exception removes `domain`.
    pub fn is_excepted(&self, domain: &str) -> bool {
        self.rules.iter().any(|rule| rule.excludes(domain))
    }

    /// Builds the effective block set.
    ///
    /// Blank entries are skipped; duplicates keep their first position.
    pub fn apply<S: AsRef<str>>(&self, domains: &[S]) -> FilterOutcome {
        let mut seen = HashSet::new();
        let mut outcome = FilterOutcome {
            ignored_exceptions: self
                .rules
                .iter()
                .filter(|r| !r.is_domain_wide())
                .map(|r| r.pattern.clone())
                .collect(),
            ..FilterOutcome::default()
        };

        for domain in domains {
            let domain = domain.as_ref().trim();
            if domain.is_empty() || !seen.insert(domain) {
                continue;
            }

            if self.is_excepted(domain) {
                outcome.excluded.push(domain.to_string());
            } else {
                outcome.effective.push(domain.to_string());
            }
        }

        outcome
    }
}
