//! Lazily-compiled regexes shared across the crate.

use std::sync::OnceLock;

use regex::Regex;

fn cached(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(pattern).expect("static regex must compile")
    })
}

/// `#<issueKey>` references in issue/PR bodies.
pub fn issue_ref() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"#([A-Za-z0-9][A-Za-z0-9._-]*[A-Za-z0-9])")
}

/// `Closes #<issueKey>` link markers in PR bodies.
pub fn closes_ref() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"(?i)closes\s+#([A-Za-z0-9][A-Za-z0-9._-]*[A-Za-z0-9])")
}

/// `<!-- escalate: name[, name…] -->` markers in review bodies.
pub fn escalation_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    cached(&RE, r"(?is)<!--\s*escalate:(.*?)-->")
}
