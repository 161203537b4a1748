//! Three-way reconciliation between the local beads store, the server-side
//! mirror, and the forge, per (repo, issueKey).
//!
//! The mirror is the merge base. Field-level diffs use `updated_at` as the
//! tiebreak; changes to the same field within the conflict window are
//! resolved by the caller-selected policy. Closed state propagates both
//! ways; `blocked` never crosses the boundary (it is derived from edges).

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::issue::{self, Issue, Status};

/// Conflict window: same-field writes on both sides within this span are a
/// conflict rather than a clean newest-wins.
pub fn default_window() -> Duration {
    Duration::days(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    LocalWins,
    RemoteWins,
    NewestWins,
    SurfaceConflict,
}

impl Default for Policy {
    fn default() -> Self {
        Self::NewestWins
    }
}

impl Policy {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "local-wins" => Self::LocalWins,
            "remote-wins" => Self::RemoteWins,
            "surface-conflict" => Self::SurfaceConflict,
            _ => Self::NewestWins,
        }
    }
}

/// The forge's view of one issue, mapped into reconcilable shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ForgeView {
    pub number: i64,
    pub title: String,
    pub body: String,
    pub closed: bool,
    /// Raw forge labels, priority labels included.
    pub labels: BTreeSet<String>,
    pub assignee: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldConflict {
    pub field: &'static str,
    pub local: serde_json::Value,
    pub forge: serde_json::Value,
}

/// Patch to apply on the forge side. `None` fields are untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForgeWrite {
    /// Create the issue on the forge (it exists locally only).
    pub create: bool,
    pub title: Option<String>,
    pub body: Option<String>,
    pub closed: Option<bool>,
    pub labels: Option<BTreeSet<String>>,
    /// `Some(None)` clears the assignee.
    pub assignee: Option<Option<String>>,
}

impl ForgeWrite {
    pub fn is_empty(&self) -> bool {
        !self.create
            && self.title.is_none()
            && self.body.is_none()
            && self.closed.is_none()
            && self.labels.is_none()
            && self.assignee.is_none()
    }
}

/// Outcome of one reconciliation.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Updated local record (write back to beads), when it changed.
    pub local: Option<Issue>,
    /// Newly-created local record for a forge-only issue.
    pub create_local: Option<Issue>,
    pub forge: Option<ForgeWrite>,
    /// New mirror snapshot (always present when any side exists).
    pub mirror: Option<Issue>,
    pub conflicts: Vec<FieldConflict>,
    /// Set when reconciliation lands a new assignee; the dispatcher decides
    /// whether that starts a workflow.
    pub assignee_changed_to: Option<String>,
}

// ── Normalized field set ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct Fields {
    title: String,
    body: String,
    closed: bool,
    priority: u8,
    assignee: Option<String>,
    /// Non-priority labels only; priority travels as its own field.
    labels: BTreeSet<String>,
}

fn fields_of_issue(i: &Issue) -> Fields {
    Fields {
        title: i.title.clone(),
        body: i.body.clone(),
        closed: i.is_closed(),
        priority: i.priority,
        assignee: i.assignee.clone(),
        labels: i
            .labels
            .iter()
            .filter(|l| !issue::is_priority_label(l))
            .cloned()
            .collect(),
    }
}

/// Map the forge view into fields. A missing `P0`..`P4` label means the
/// priority is *unchanged* (`fallback`), never reset: the local merge tool
/// is known to elide priority 0.
fn fields_of_forge(f: &ForgeView, fallback_priority: u8) -> Fields {
    Fields {
        title: f.title.clone(),
        body: f.body.clone(),
        closed: f.closed,
        priority: issue::priority_from_labels(f.labels.iter()).unwrap_or(fallback_priority),
        assignee: f.assignee.clone(),
        labels: f
            .labels
            .iter()
            .filter(|l| !issue::is_priority_label(l))
            .cloned()
            .collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Source {
    Base,
    Local,
    Forge,
}

struct FieldPick {
    source: Source,
    conflict: bool,
}

fn pick(
    local_changed: bool,
    forge_changed: bool,
    sides_equal: bool,
    local_newer: bool,
    within_window: bool,
    policy: Policy,
) -> FieldPick {
    match (local_changed, forge_changed) {
        (false, false) => FieldPick { source: Source::Base, conflict: false },
        (true, false) => FieldPick { source: Source::Local, conflict: false },
        (false, true) => FieldPick { source: Source::Forge, conflict: false },
        (true, true) if sides_equal => FieldPick { source: Source::Local, conflict: false },
        (true, true) => {
            let conflict = within_window;
            let source = match policy {
                Policy::LocalWins => Source::Local,
                Policy::RemoteWins => Source::Forge,
                Policy::NewestWins => {
                    if local_newer {
                        Source::Local
                    } else {
                        Source::Forge
                    }
                }
                Policy::SurfaceConflict => {
                    if conflict {
                        Source::Base
                    } else if local_newer {
                        Source::Local
                    } else {
                        Source::Forge
                    }
                }
            };
            FieldPick { source, conflict }
        }
    }
}

// ── Reconcile ────────────────────────────────────────────────────────────

/// Reconcile one (local, mirror, forge) triple.
///
/// `local_id` is the issueKey; it names the local record when one has to be
/// created from a forge-only issue.
pub fn reconcile(
    local_id: &str,
    local: Option<&Issue>,
    mirror: Option<&Issue>,
    forge: Option<&ForgeView>,
    policy: Policy,
    window: Duration,
    now: DateTime<Utc>,
) -> Plan {
    match (local, forge) {
        (None, None) => Plan::default(),
        // Local-only: create on the forge, mirror the local record.
        (Some(l), None) => {
            let mut write = ForgeWrite { create: true, ..Default::default() };
            write.title = Some(l.title.clone());
            write.body = Some(l.body.clone());
            write.closed = Some(l.is_closed());
            let mut labels = fields_of_issue(l).labels;
            labels.insert(issue::priority_label(l.priority));
            write.labels = Some(labels);
            write.assignee = Some(l.assignee.clone());
            Plan {
                forge: Some(write),
                mirror: Some(l.clone()),
                ..Default::default()
            }
        }
        // Forge-only: create locally.
        (None, Some(f)) => {
            let mut created = Issue::new(local_id, f.title.clone(), now);
            created.forge_number = Some(f.number);
            created.body = f.body.clone();
            created.priority =
                issue::priority_from_labels(f.labels.iter()).unwrap_or(issue::default_priority());
            created.assignee = f.assignee.clone();
            created.labels = f
                .labels
                .iter()
                .filter(|l| !issue::is_priority_label(l))
                .cloned()
                .collect();
            if f.closed {
                created.close(now);
            }
            created.updated_at = f.updated_at;
            let assignee_changed_to = created.assignee.clone();
            Plan {
                create_local: Some(created.clone()),
                mirror: Some(created),
                assignee_changed_to,
                ..Default::default()
            }
        }
        (Some(l), Some(f)) => reconcile_both(l, mirror, f, policy, window, now),
    }
}

fn reconcile_both(
    local: &Issue,
    mirror: Option<&Issue>,
    forge: &ForgeView,
    policy: Policy,
    window: Duration,
    now: DateTime<Utc>,
) -> Plan {
    let base_priority = mirror.map(|m| m.priority).unwrap_or(local.priority);
    let lf = fields_of_issue(local);
    let ff = fields_of_forge(forge, base_priority);
    let base = mirror.map(fields_of_issue);

    let local_newer = local.updated_at >= forge.updated_at;
    let within_window = (local.updated_at - forge.updated_at).abs() <= window;

    let mut conflicts = Vec::new();
    let mut surfaced: Vec<&'static str> = Vec::new();
    let mut merged = lf.clone();

    macro_rules! resolve {
        ($field:ident, $name:literal) => {{
            let l_val = &lf.$field;
            let f_val = &ff.$field;
            let b_val = base.as_ref().map(|b| &b.$field);
            let local_changed = b_val.map(|b| l_val != b).unwrap_or(l_val != f_val);
            let forge_changed = b_val.map(|b| f_val != b).unwrap_or(l_val != f_val);
            let p = pick(
                local_changed,
                forge_changed,
                l_val == f_val,
                local_newer,
                within_window,
                policy,
            );
            merged.$field = match p.source {
                Source::Local => l_val.clone(),
                Source::Forge => f_val.clone(),
                Source::Base => b_val.cloned().unwrap_or_else(|| l_val.clone()),
            };
            if p.conflict && policy == Policy::SurfaceConflict {
                surfaced.push($name);
                conflicts.push(FieldConflict {
                    field: $name,
                    local: serde_json::json!(l_val),
                    forge: serde_json::json!(f_val),
                });
            }
        }};
    }

    resolve!(title, "title");
    resolve!(body, "body");
    resolve!(closed, "closed");
    resolve!(priority, "priority");
    resolve!(assignee, "assignee");
    resolve!(labels, "labels");

    // Surfaced conflicts are for the operator: each side keeps its own
    // value, the mirror records the base, and no cross-write happens.
    let frozen = |name: &'static str| surfaced.contains(&name);

    // Apply merged fields to a new local record; frozen fields keep the
    // local side's own value.
    let mut updated_local = local.clone();
    updated_local.forge_number = Some(forge.number);
    if !frozen("title") {
        updated_local.title = merged.title.clone();
    }
    if !frozen("body") {
        updated_local.body = merged.body.clone();
    }
    if !frozen("priority") {
        updated_local.priority = merged.priority;
    }
    if !frozen("assignee") {
        updated_local.assignee = merged.assignee.clone();
    }
    if !frozen("labels") {
        updated_local.labels = merged.labels.clone();
    }
    if !frozen("closed") {
        if merged.closed && !local.is_closed() {
            updated_local.close(now);
        } else if !merged.closed && local.is_closed() {
            // Reopened on the forge; blocked/open is re-derived from
            // edges later.
            updated_local.status = Status::Open;
            updated_local.closed_at = None;
            updated_local.updated_at = now;
        }
    }
    updated_local.updated_at = updated_local
        .updated_at
        .max(local.updated_at)
        .max(forge.updated_at);

    let local_dirty = updated_local.title != local.title
        || updated_local.body != local.body
        || updated_local.priority != local.priority
        || updated_local.assignee != local.assignee
        || updated_local.labels != local.labels
        || updated_local.is_closed() != local.is_closed()
        || local.forge_number != Some(forge.number);

    // Mirror snapshot always carries the merged view (base values for
    // surfaced conflicts).
    let mut mirror_rec = updated_local.clone();
    mirror_rec.title = merged.title.clone();
    mirror_rec.body = merged.body.clone();
    mirror_rec.priority = merged.priority;
    mirror_rec.assignee = merged.assignee.clone();
    mirror_rec.labels = merged.labels.clone();
    if merged.closed != mirror_rec.is_closed() {
        if merged.closed {
            mirror_rec.close(now);
        } else {
            mirror_rec.status = Status::Open;
            mirror_rec.closed_at = None;
        }
    }

    // Forge patch for fields where the forge view disagrees with merged.
    let mut write = ForgeWrite::default();
    if merged.title != ff.title && !frozen("title") {
        write.title = Some(merged.title.clone());
    }
    if merged.body != ff.body && !frozen("body") {
        write.body = Some(merged.body.clone());
    }
    if merged.closed != ff.closed && !frozen("closed") {
        write.closed = Some(merged.closed);
    }
    if merged.assignee != ff.assignee {
        write.assignee = Some(merged.assignee.clone());
    }
    if merged.labels != ff.labels || merged.priority != ff.priority {
        let mut labels = merged.labels.clone();
        labels.insert(issue::priority_label(merged.priority));
        write.labels = Some(labels);
    }

    let assignee_changed_to = if updated_local.assignee != mirror.and_then(|m| m.assignee.clone())
    {
        updated_local.assignee.clone()
    } else {
        None
    };

    Plan {
        local: local_dirty.then_some(updated_local),
        create_local: None,
        forge: (!write.is_empty()).then_some(write),
        mirror: Some(mirror_rec),
        conflicts,
        assignee_changed_to,
    }
}
