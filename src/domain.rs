//! Domain matching for the proxy's allow/deny policy.
//!
//! A [`DomainSet`] is a pair of an exact hostname set and an ordered list of
//! wildcard patterns. Unlike a naive suffix check, a `*.suffix` pattern never
//! matches the bare `suffix` itself — only a proper subdomain.

use std::collections::HashSet;
use std::fmt;

/// A normalized, lowercased, port-stripped hostname.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(host);
    let host = if host.bytes().filter(|b| *b == b':').count() == 1 {
        host.split(':').next().unwrap_or(host)
    } else {
        host
    };
    host.to_ascii_lowercase()
}

/// A single wildcard pattern of the form `*.suffix`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern(String);

impl Pattern {
    /// Parse and validate a pattern string.
    ///
    /// Valid shape: starts with `*.`, at least 3 characters, and the suffix
    /// after `*.` is non-empty and does not itself start with a dot.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.len() < 3 || !input.starts_with("*.") {
            return None;
        }
        let suffix = &input[2..];
        if suffix.is_empty() || suffix.starts_with('.') || !suffix.contains('.') {
            return None;
        }
        Some(Self(normalize_host(suffix)))
    }

    /// The suffix this pattern matches against (without the `*.` prefix).
    pub fn suffix(&self) -> &str {
        &self.0
    }

    /// True if `host` is a proper subdomain of this pattern's suffix.
    ///
    /// The bare suffix itself never matches: `*.evil.com` matches
    /// `cdn.evil.com` but not `evil.com`.
    pub fn matches(&self, host: &str) -> bool {
        match host.strip_suffix(&format!(".{}", self.0)) {
            Some(left_label) => !left_label.is_empty(),
            None => false,
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "*.{}", self.0)
    }
}

/// Either an exact domain or a wildcard pattern — the unit stored in
/// decision files and passed around when recording a new decision.
///
/// `Pattern` holds the full `*.suffix` string, matching the on-disk and wire
/// representation; use [`Pattern::parse`] to validate and extract a suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Domain(String),
    Pattern(String),
}

/// A set of exact hostnames plus an ordered list of wildcard patterns.
#[derive(Debug, Clone, Default)]
pub struct DomainSet {
    exact: HashSet<String>,
    patterns: Vec<Pattern>,
}

impl DomainSet {
    /// Build a set from exact domains and raw pattern strings. Invalid
    /// patterns are silently dropped; duplicates are deduplicated.
    pub fn new(domains: &[String], patterns: &[String]) -> Self {
        let mut set = Self::default();
        for d in domains {
            set.add_domain(d);
        }
        for p in patterns {
            set.add_pattern(p);
        }
        set
    }

    /// An empty set that matches nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add an exact domain, normalizing it first.
    pub fn add_domain(&mut self, domain: &str) {
        self.exact.insert(normalize_host(domain));
    }

    /// Add a wildcard pattern. Invalid shapes and duplicates are no-ops.
    pub fn add_pattern(&mut self, pattern: &str) {
        if let Some(p) = Pattern::parse(pattern)
            && !self.patterns.contains(&p)
        {
            self.patterns.push(p);
        }
    }

    /// Add a parsed [`Entry`], dispatching to `add_domain`/`add_pattern`.
    pub fn add_entry(&mut self, entry: &Entry) {
        match entry {
            Entry::Domain(d) => self.add_domain(d),
            Entry::Pattern(p) => self.add_pattern(p),
        }
    }

    /// True if `host` (optionally `host:port`) is covered by this set.
    pub fn contains(&self, host: &str) -> bool {
        let host = normalize_host(host);
        if self.exact.contains(&host) {
            return true;
        }
        self.patterns.iter().any(|p| p.matches(&host))
    }

    /// True if the set has neither exact domains nor patterns.
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.patterns.is_empty()
    }

    /// Iterate exact domains in the set.
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.exact.iter().map(String::as_str)
    }

    /// Iterate patterns in the set.
    pub fn patterns(&self) -> impl Iterator<Item = &Pattern> {
        self.patterns.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_is_case_insensitive() {
        let set = DomainSet::new(&["Api.Example.COM".to_string()], &[]);
        assert!(set.contains("api.example.com"));
        assert!(set.contains("API.EXAMPLE.COM"));
        assert!(!set.contains("other.example.com"));
    }

    #[test]
    fn pattern_does_not_match_bare_suffix() {
        let set = DomainSet::new(&[], &["*.evil.com".to_string()]);
        assert!(!set.contains("evil.com"));
        assert!(set.contains("cdn.evil.com"));
        assert!(set.contains("a.b.evil.com"));
    }

    #[test]
    fn pattern_at_depth_matches_any_level() {
        let set = DomainSet::new(&[], &["*.a.b".to_string()]);
        assert!(!set.contains("a.b"));
        assert!(set.contains("x.a.b"));
        assert!(set.contains("y.x.a.b"));
    }

    #[test]
    fn invalid_patterns_are_dropped_silently() {
        let mut set = DomainSet::empty();
        set.add_pattern("*.");
        set.add_pattern("*x");
        set.add_pattern("*");
        set.add_pattern("**.example.com");
        set.add_pattern("*.com");
        assert!(set.is_empty());
    }

    #[test]
    fn pattern_parse_requires_suffix_with_a_dot() {
        assert!(Pattern::parse("*.com").is_none());
        assert!(Pattern::parse("*.localhost").is_none());
        assert!(Pattern::parse("*.example.com").is_some());
    }

    #[test]
    fn duplicate_patterns_are_deduped() {
        let mut set = DomainSet::empty();
        set.add_pattern("*.example.com");
        set.add_pattern("*.EXAMPLE.com");
        assert_eq!(set.patterns().count(), 1);
    }

    #[test]
    fn contains_strips_port() {
        let set = DomainSet::new(&["example.com".to_string()], &[]);
        assert!(set.contains("example.com:443"));
        assert!(set.contains("example.com:8443"));
    }

    #[test]
    fn contains_strips_ipv6_brackets() {
        let set = DomainSet::new(&["::1".to_string()], &[]);
        assert!(set.contains("[::1]"));
    }

    #[test]
    fn subdomain_of_exact_domain_does_not_match() {
        let set = DomainSet::new(&["api.example.com".to_string()], &[]);
        assert!(!set.contains("evil.api.example.com"));
        assert!(!set.contains("api.example.com.evil.com"));
    }

    #[test]
    fn empty_set_matches_nothing() {
        let set = DomainSet::empty();
        assert!(!set.contains("anything.com"));
        assert!(set.is_empty());
    }
}
