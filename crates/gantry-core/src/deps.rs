//! Dependency-graph operations over a loaded issue set.
//!
//! `blocked` is always derived from open depends-on edges; it is never
//! written across a sync boundary. Acyclicity is enforced at write time by
//! a reachability check before the edge is persisted.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};

use crate::error::GantryError;
use crate::issue::{Issue, Kind, Status};

pub type IssueMap = BTreeMap<String, Issue>;

/// Would adding `from depends-on to` create a cycle?
///
/// Walks depends-on edges out of `to`; if `from` is reachable, the new
/// edge closes a loop.
pub fn would_cycle(issues: &IssueMap, from: &str, to: &str) -> bool {
    if from == to {
        return true;
    }
    let mut queue: VecDeque<&str> = VecDeque::new();
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    queue.push_back(to);
    while let Some(cur) = queue.pop_front() {
        if cur == from {
            return true;
        }
        if !seen.insert(cur) {
            continue;
        }
        if let Some(issue) = issues.get(cur) {
            for dep in &issue.depends_on {
                queue.push_back(dep.as_str());
            }
        }
    }
    false
}

/// Add `from depends-on to`, keeping the inverse `blocks` edge in sync.
pub fn add_dependency(issues: &mut IssueMap, from: &str, to: &str) -> Result<(), GantryError> {
    if !issues.contains_key(from) {
        return Err(GantryError::NotFound(from.to_string()));
    }
    if !issues.contains_key(to) {
        return Err(GantryError::NotFound(to.to_string()));
    }
    if would_cycle(issues, from, to) {
        return Err(GantryError::CircularDependency(format!("{from} -> {to}")));
    }
    if let Some(issue) = issues.get_mut(from) {
        issue.depends_on.insert(to.to_string());
    }
    if let Some(issue) = issues.get_mut(to) {
        issue.blocks.insert(from.to_string());
    }
    Ok(())
}

/// An issue is blocked when any depends-on target is not closed.
pub fn is_blocked(issues: &IssueMap, id: &str) -> bool {
    let Some(issue) = issues.get(id) else {
        return false;
    };
    issue
        .depends_on
        .iter()
        .any(|dep| issues.get(dep).map(|d| !d.is_closed()).unwrap_or(false))
}

/// Ready to work: open with every dependency closed.
pub fn is_ready(issues: &IssueMap, id: &str) -> bool {
    match issues.get(id) {
        Some(issue) => issue.status == Status::Open && !is_blocked(issues, id),
        None => false,
    }
}

/// Re-derive open/blocked for every non-terminal issue. Returns ids whose
/// status actually changed.
pub fn recompute_blocked(issues: &mut IssueMap, now: DateTime<Utc>) -> Vec<String> {
    let ids: Vec<String> = issues.keys().cloned().collect();
    let mut changed = Vec::new();
    for id in ids {
        let derived = is_blocked(issues, &id);
        if let Some(issue) = issues.get_mut(&id) {
            match (issue.status, derived) {
                (Status::Open, true) => {
                    issue.status = Status::Blocked;
                    issue.updated_at = now;
                    changed.push(id);
                }
                (Status::Blocked, false) => {
                    issue.status = Status::Open;
                    issue.updated_at = now;
                    changed.push(id);
                }
                _ => {}
            }
        }
    }
    changed
}

/// Number of issues transitively blocked by `id` (its "impact").
pub fn impact(issues: &IssueMap, id: &str) -> usize {
    let mut queue: VecDeque<&str> = VecDeque::new();
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    queue.push_back(id);
    while let Some(cur) = queue.pop_front() {
        if let Some(issue) = issues.get(cur) {
            for blocked in &issue.blocks {
                if seen.insert(blocked.as_str()) {
                    queue.push_back(blocked.as_str());
                }
            }
        }
    }
    seen.len()
}

/// Issues that become ready once `closed_id` is closed.
pub fn newly_ready_after_close(issues: &IssueMap, closed_id: &str) -> Vec<String> {
    let Some(closed) = issues.get(closed_id) else {
        return Vec::new();
    };
    closed
        .blocks
        .iter()
        .filter(|dependent| {
            issues
                .get(dependent.as_str())
                .map(|i| !i.is_closed())
                .unwrap_or(false)
        })
        .filter(|dependent| {
            // Ready once every *other* dependency is closed too.
            issues
                .get(dependent.as_str())
                .map(|i| {
                    i.depends_on.iter().all(|dep| {
                        dep == closed_id
                            || issues.get(dep).map(Issue::is_closed).unwrap_or(true)
                    })
                })
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Epics whose children are all closed (and are themselves still open).
pub fn completable_epics(issues: &IssueMap) -> Vec<String> {
    issues
        .values()
        .filter(|i| i.kind == Kind::Epic && !i.is_closed())
        .filter(|epic| {
            let children: Vec<&Issue> = issues
                .values()
                .filter(|i| i.parent.as_deref() == Some(epic.id.as_str()))
                .collect();
            !children.is_empty() && children.iter().all(|c| c.is_closed())
        })
        .map(|i| i.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(id: &str) -> Issue {
        Issue::new(id, id, Utc::now())
    }

    fn map(ids: &[&str]) -> IssueMap {
        ids.iter().map(|id| (id.to_string(), issue(id))).collect()
    }

    #[test]
    fn cycle_rejected_at_write_time() {
        let mut issues = map(&["a", "b"]);
        add_dependency(&mut issues, "a", "b").unwrap();
        let err = add_dependency(&mut issues, "b", "a").unwrap_err();
        assert!(matches!(err, GantryError::CircularDependency(_)));
    }

    #[test]
    fn self_dependency_rejected() {
        let mut issues = map(&["a"]);
        assert!(add_dependency(&mut issues, "a", "a").is_err());
    }

    #[test]
    fn transitive_cycle_rejected() {
        let mut issues = map(&["a", "b", "c"]);
        add_dependency(&mut issues, "a", "b").unwrap();
        add_dependency(&mut issues, "b", "c").unwrap();
        assert!(add_dependency(&mut issues, "c", "a").is_err());
    }

    #[test]
    fn blocked_follows_dependency_state() {
        let mut issues = map(&["blk1", "blk2"]);
        add_dependency(&mut issues, "blk2", "blk1").unwrap();
        assert!(is_blocked(&issues, "blk2"));

        let now = Utc::now();
        recompute_blocked(&mut issues, now);
        assert_eq!(issues["blk2"].status, Status::Blocked);

        issues.get_mut("blk1").unwrap().close(now);
        let changed = recompute_blocked(&mut issues, now);
        assert_eq!(changed, vec!["blk2".to_string()]);
        assert_eq!(issues["blk2"].status, Status::Open);
        assert!(is_ready(&issues, "blk2"));
    }

    #[test]
    fn impact_counts_transitive_dependents() {
        let mut issues = map(&["root", "mid", "leaf1", "leaf2"]);
        add_dependency(&mut issues, "mid", "root").unwrap();
        add_dependency(&mut issues, "leaf1", "mid").unwrap();
        add_dependency(&mut issues, "leaf2", "mid").unwrap();
        assert_eq!(impact(&issues, "root"), 3);
        assert_eq!(impact(&issues, "mid"), 2);
        assert_eq!(impact(&issues, "leaf1"), 0);
    }

    #[test]
    fn newly_ready_requires_all_deps_closed() {
        let mut issues = map(&["a", "b", "c"]);
        add_dependency(&mut issues, "c", "a").unwrap();
        add_dependency(&mut issues, "c", "b").unwrap();

        let now = Utc::now();
        issues.get_mut("a").unwrap().close(now);
        assert!(newly_ready_after_close(&issues, "a").is_empty());

        issues.get_mut("b").unwrap().close(now);
        assert_eq!(newly_ready_after_close(&issues, "b"), vec!["c".to_string()]);
    }

    #[test]
    fn epic_completion_requires_children() {
        let mut issues = map(&["epic1", "child1", "child2"]);
        issues.get_mut("epic1").unwrap().kind = Kind::Epic;
        issues.get_mut("child1").unwrap().parent = Some("epic1".into());
        issues.get_mut("child2").unwrap().parent = Some("epic1".into());

        assert!(completable_epics(&issues).is_empty());

        let now = Utc::now();
        issues.get_mut("child1").unwrap().close(now);
        issues.get_mut("child2").unwrap().close(now);
        assert_eq!(completable_epics(&issues), vec!["epic1".to_string()]);
    }

    #[test]
    fn childless_epic_not_auto_closed() {
        let mut issues = map(&["epic1"]);
        issues.get_mut("epic1").unwrap().kind = Kind::Epic;
        assert!(completable_epics(&issues).is_empty());
    }
}
