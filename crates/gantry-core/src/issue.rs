use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GantryError;

// ── Enums ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl Default for Status {
    fn default() -> Self {
        Self::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Task,
    Bug,
    Feature,
    Epic,
}

impl Default for Kind {
    fn default() -> Self {
        Self::Task
    }
}

// ── Issue record ─────────────────────────────────────────────────────────

/// Canonical issue record, shared by the beads file, the server-side
/// mirror, and the reconciler's view of the forge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    /// Stable local id: slug plus short random suffix (e.g. `demo-ab12`).
    pub id: String,
    /// Forge issue number once the record exists on the forge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forge_number: Option<i64>,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub status: Status,
    /// 0 (highest) .. 4; clamped on every parse path.
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub blocks: BTreeSet<String>,
    /// Parent epic, when this issue is a child of one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

pub fn default_priority() -> u8 {
    2
}

impl Issue {
    pub fn new(id: impl Into<String>, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            forge_number: None,
            title: title.into(),
            body: String::new(),
            status: Status::Open,
            priority: default_priority(),
            kind: Kind::Task,
            assignee: None,
            labels: BTreeSet::new(),
            depends_on: BTreeSet::new(),
            blocks: BTreeSet::new(),
            parent: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status == Status::Closed
    }

    pub fn close(&mut self, now: DateTime<Utc>) {
        self.status = Status::Closed;
        self.closed_at = Some(now);
        self.updated_at = now;
    }
}

// ── Id helpers ───────────────────────────────────────────────────────────

/// Validate a local issue id: must be non-empty after trimming.
pub fn validate_id(raw: &str) -> Result<String, GantryError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(GantryError::MalformedPayload("empty issue id".into()));
    }
    Ok(trimmed.to_string())
}

/// Mint a new local id from a slug: `<slug>-<4 hex chars>`.
pub fn new_issue_id(slug: &str) -> String {
    let mut bytes = [0u8; 2];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
    format!("{}-{}", slug.trim_matches('-'), hex::encode(bytes))
}

// ── Priority parsing ─────────────────────────────────────────────────────

/// Clamp an integer priority into 0..=4.
pub fn clamp_priority(n: i64) -> u8 {
    n.clamp(0, 4) as u8
}

/// Parse a priority from free-form input.
///
/// Out-of-range values clamp (`-1` → 0, `10` → 4); anything non-numeric,
/// including NaN, falls back to the default of 2.
pub fn parse_priority(raw: &str) -> u8 {
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => clamp_priority(v.round() as i64),
        _ => default_priority(),
    }
}

/// Forge label for a priority (`P0`..`P4`).
pub fn priority_label(priority: u8) -> String {
    format!("P{}", priority.min(4))
}

/// Extract a priority from a forge label set.
///
/// Returns `None` when no `P0`..`P4` label is present. Callers must treat
/// `None` as "unchanged": the local store's merge tool is known to elide a
/// zero-valued priority, so absence is not a reset to default.
pub fn priority_from_labels<'a, I: IntoIterator<Item = &'a String>>(labels: I) -> Option<u8> {
    for label in labels {
        if let Some(rest) = label.strip_prefix('P') {
            if let Ok(n) = rest.parse::<i64>() {
                if (0..=4).contains(&n) {
                    return Some(n as u8);
                }
            }
        }
    }
    None
}

/// Whether a label is one of the reserved priority labels.
pub fn is_priority_label(label: &str) -> bool {
    matches!(label, "P0" | "P1" | "P2" | "P3" | "P4")
}

// ── Body references ──────────────────────────────────────────────────────

/// Detect `#<issueKey>` references in an issue body.
///
/// These are surfaced as dependency suggestions only; nothing is
/// auto-added unless the repository opts in.
pub fn detect_refs(body: &str) -> Vec<String> {
    let re = crate::regex_cache::issue_ref();
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for cap in re.captures_iter(body) {
        let key = cap[1].to_string();
        if seen.insert(key.clone()) {
            out.push(key);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_parse_boundaries() {
        assert_eq!(parse_priority("-1"), 0);
        assert_eq!(parse_priority("0"), 0);
        assert_eq!(parse_priority("4"), 4);
        assert_eq!(parse_priority("5"), 4);
        assert_eq!(parse_priority("10"), 4);
        assert_eq!(parse_priority("high"), 2);
        assert_eq!(parse_priority("NaN"), 2);
        assert_eq!(parse_priority(""), 2);
    }

    #[test]
    fn id_validation() {
        assert!(validate_id("").is_err());
        assert!(validate_id("   ").is_err());
        assert_eq!(validate_id(" demo-ab12 ").ok().as_deref(), Some("demo-ab12"));
    }

    #[test]
    fn minted_ids_carry_slug_and_suffix() {
        let id = new_issue_id("demo");
        assert!(id.starts_with("demo-"));
        assert_eq!(id.len(), "demo-".len() + 4);
        assert_ne!(new_issue_id("demo"), new_issue_id("demo"));
    }

    #[test]
    fn priority_labels_round_trip() {
        assert_eq!(priority_label(0), "P0");
        let labels = vec!["bug".to_string(), "P3".to_string()];
        assert_eq!(priority_from_labels(labels.iter()), Some(3));
    }

    #[test]
    fn missing_priority_label_is_none_not_default() {
        let labels = vec!["bug".to_string(), "backend".to_string()];
        assert_eq!(priority_from_labels(labels.iter()), None);
    }

    #[test]
    fn malformed_priority_labels_ignored() {
        let labels = vec!["P9".to_string(), "Prod".to_string(), "P".to_string()];
        assert_eq!(priority_from_labels(labels.iter()), None);
    }

    #[test]
    fn ref_detection_dedupes() {
        let refs = detect_refs("see #demo-ab12 and #core-ff01, also #demo-ab12");
        assert_eq!(refs, vec!["demo-ab12".to_string(), "core-ff01".to_string()]);
        assert!(detect_refs("no refs here").is_empty());
    }

    #[test]
    fn issue_json_round_trip() {
        let now = Utc::now();
        let mut issue = Issue::new("demo-ab12", "Fix the thing", now);
        issue.depends_on.insert("demo-0001".into());
        let line = serde_json::to_string(&issue).unwrap();
        let back: Issue = serde_json::from_str(&line).unwrap();
        assert_eq!(back, issue);
    }

    #[test]
    fn absent_priority_deserializes_to_default() {
        let line = r#"{"id":"a-1","title":"t","created_at":"2026-01-01T00:00:00Z","updated_at":"2026-01-01T00:00:00Z"}"#;
        let issue: Issue = serde_json::from_str(line).unwrap();
        assert_eq!(issue.priority, 2);
        assert_eq!(issue.status, Status::Open);
    }
}
