//! Per-PR durable state machine (PR-DO).
//!
//! One logical instance per (repo, PR number): a persisted snapshot plus an
//! applied-delivery log. Events for one PR are applied strictly in arrival
//! order under a per-key lock; `apply` itself is a pure function of
//! (record, event) so the final state is a function of the ordered event
//! sequence, and every handler is safe under duplicate delivery.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::db::Db;
use crate::error::GantryError;

// ── Types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    AwaitingReview,
    ChangesRequested,
    Approved,
    Merged,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pending,
    Approved,
    ChangesRequested,
    Commented,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeType {
    None,
    Normal,
    Forced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewerSlot {
    pub name: String,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict_at: Option<DateTime<Utc>>,
}

impl ReviewerSlot {
    fn pending(name: impl Into<String>) -> Self {
        Self { name: name.into(), verdict: Verdict::Pending, verdict_at: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutsideReview {
    pub reviewer: String,
    pub state: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrRecord {
    pub number: i64,
    pub head_ref: String,
    pub base_ref: String,
    pub author: String,
    #[serde(default)]
    pub body: String,
    pub state: PrState,
    pub queue: Vec<ReviewerSlot>,
    pub merge_type: MergeType,
    /// Timestamp of the newest head commit (open or synchronize).
    pub head_commit_at: DateTime<Utc>,
    /// Every changes_requested verdict that ever existed on this PR.
    #[serde(default)]
    pub cr_history: Vec<DateTime<Utc>>,
    /// State to restore on reopen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_state: Option<PrState>,
    /// Reviews from users outside the queue: recorded, no state effect.
    #[serde(default)]
    pub outside_reviews: Vec<OutsideReview>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Commented,
}

#[derive(Debug, Clone)]
pub enum PrEvent {
    Opened {
        head_ref: String,
        base_ref: String,
        author: String,
        body: String,
        reviewers: Vec<String>,
        at: DateTime<Utc>,
    },
    Reopened {
        at: DateTime<Utc>,
    },
    Synchronize {
        at: DateTime<Utc>,
    },
    Review {
        reviewer: String,
        state: ReviewState,
        body: String,
        at: DateTime<Utc>,
    },
    Closed {
        merged: bool,
        at: DateTime<Utc>,
    },
}

/// Side effects requested by an applied event. Repeating the event yields
/// the same (state, effects) pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Effects {
    /// Reviewers that need a review session dispatched.
    pub dispatch_reviewers: Vec<String>,
    /// `Closes #key` issues to close locally (merged PRs only).
    pub close_issue_keys: Vec<String>,
}

// ── Escalation parsing ───────────────────────────────────────────────────

/// Extract reviewer names from `<!-- escalate: a, b -->` markers.
///
/// The keyword matches case-insensitively; names keep their original
/// casing; duplicates across markers collapse (first occurrence wins).
pub fn parse_escalations(body: &str) -> Vec<String> {
    let re = crate::regex_cache::escalation_marker();
    let mut seen_lower: Vec<String> = Vec::new();
    let mut out = Vec::new();
    for cap in re.captures_iter(body) {
        for name in cap[1].split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let lower = name.to_lowercase();
            if !seen_lower.contains(&lower) {
                seen_lower.push(lower);
                out.push(name.to_string());
            }
        }
    }
    out
}

/// `Closes #key` references in a PR body.
pub fn closes_refs(body: &str) -> Vec<String> {
    let re = crate::regex_cache::closes_ref();
    let mut out = Vec::new();
    for cap in re.captures_iter(body) {
        let key = cap[1].to_string();
        if !out.contains(&key) {
            out.push(key);
        }
    }
    out
}

// ── Pure transition function ─────────────────────────────────────────────

impl PrRecord {
    pub fn new_opened(
        number: i64,
        head_ref: &str,
        base_ref: &str,
        author: &str,
        body: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            number,
            head_ref: head_ref.to_string(),
            base_ref: base_ref.to_string(),
            author: author.to_string(),
            body: body.to_string(),
            state: PrState::AwaitingReview,
            queue: Vec::new(),
            merge_type: MergeType::None,
            head_commit_at: at,
            cr_history: Vec::new(),
            prior_state: None,
            outside_reviews: Vec::new(),
        }
    }

    fn slot_mut(&mut self, name: &str) -> Option<&mut ReviewerSlot> {
        self.queue.iter_mut().find(|s| s.name == name)
    }

    fn all_approved(&self) -> bool {
        !self.queue.is_empty() && self.queue.iter().all(|s| s.verdict == Verdict::Approved)
    }

    fn pending_reviewers(&self) -> Vec<String> {
        self.queue
            .iter()
            .filter(|s| s.verdict == Verdict::Pending)
            .map(|s| s.name.clone())
            .collect()
    }
}

/// Apply one event to a PR record, returning the requested side effects.
pub fn apply(rec: &mut PrRecord, event: &PrEvent) -> Effects {
    let mut effects = Effects::default();
    match event {
        PrEvent::Opened { head_ref, base_ref, author, body, reviewers, at } => {
            rec.head_ref = head_ref.clone();
            rec.base_ref = base_ref.clone();
            rec.author = author.clone();
            rec.body = body.clone();
            if rec.state != PrState::Merged {
                rec.state = PrState::AwaitingReview;
            }
            rec.head_commit_at = rec.head_commit_at.max(*at);
            for name in reviewers {
                if rec.slot_mut(name).is_none() {
                    rec.queue.push(ReviewerSlot::pending(name.clone()));
                }
            }
            effects.dispatch_reviewers = rec.pending_reviewers();
        }
        PrEvent::Reopened { at: _ } => {
            if rec.state == PrState::Closed {
                rec.state = rec.prior_state.take().unwrap_or(PrState::AwaitingReview);
            }
            effects.dispatch_reviewers = rec.pending_reviewers();
        }
        PrEvent::Synchronize { at } => {
            rec.head_commit_at = rec.head_commit_at.max(*at);
            let mut cleared = Vec::new();
            for slot in &mut rec.queue {
                if slot.verdict == Verdict::ChangesRequested {
                    slot.verdict = Verdict::Pending;
                    slot.verdict_at = None;
                    cleared.push(slot.name.clone());
                }
            }
            if rec.state == PrState::ChangesRequested {
                rec.state = PrState::AwaitingReview;
            }
            effects.dispatch_reviewers = cleared;
        }
        PrEvent::Review { reviewer, state, body, at } => {
            if rec.slot_mut(reviewer).is_none() {
                // Not in the queue: record only.
                let already = rec
                    .outside_reviews
                    .iter()
                    .any(|r| r.reviewer == *reviewer && r.at == *at);
                if !already {
                    rec.outside_reviews.push(OutsideReview {
                        reviewer: reviewer.clone(),
                        state: format!("{state:?}").to_lowercase(),
                        at: *at,
                    });
                }
                return effects;
            }
            match state {
                ReviewState::Commented => {
                    if let Some(slot) = rec.slot_mut(reviewer) {
                        if slot.verdict == Verdict::Pending {
                            slot.verdict = Verdict::Commented;
                            slot.verdict_at = Some(*at);
                        }
                    }
                }
                ReviewState::Approved => {
                    if let Some(slot) = rec.slot_mut(reviewer) {
                        slot.verdict = Verdict::Approved;
                        slot.verdict_at = Some(*at);
                    }
                    for name in parse_escalations(body) {
                        if rec.slot_mut(&name).is_none() {
                            rec.queue.push(ReviewerSlot::pending(name.clone()));
                            effects.dispatch_reviewers.push(name);
                        }
                    }
                    if rec.all_approved()
                        && matches!(rec.state, PrState::Open | PrState::AwaitingReview | PrState::Approved)
                    {
                        rec.state = PrState::Approved;
                    }
                }
                ReviewState::ChangesRequested => {
                    // A later changes_requested from an already-approved
                    // reviewer replaces their verdict and reverts the PR.
                    if let Some(slot) = rec.slot_mut(reviewer) {
                        slot.verdict = Verdict::ChangesRequested;
                        slot.verdict_at = Some(*at);
                    }
                    if !rec.cr_history.contains(at) {
                        rec.cr_history.push(*at);
                    }
                    if !matches!(rec.state, PrState::Merged | PrState::Closed) {
                        rec.state = PrState::ChangesRequested;
                    }
                }
            }
        }
        PrEvent::Closed { merged, at } => {
            if *merged {
                rec.state = PrState::Merged;
                rec.merge_type = if rec.all_approved() { MergeType::Normal } else { MergeType::Forced };
                rec.head_commit_at = rec.head_commit_at.max(*at);
                effects.close_issue_keys = closes_refs(&rec.body);
            } else if rec.state != PrState::Merged {
                if rec.state != PrState::Closed {
                    rec.prior_state = Some(rec.state);
                }
                rec.state = PrState::Closed;
            }
        }
    }
    effects
}

/// Gate for the merge wrapper: approved, no standing changes_requested
/// verdicts, and the head carries a commit newer than every
/// changes_requested verdict that ever existed.
pub fn ready_to_merge(rec: &PrRecord) -> bool {
    rec.state == PrState::Approved
        && rec.queue.iter().all(|s| s.verdict != Verdict::ChangesRequested)
        && rec.cr_history.iter().all(|t| rec.head_commit_at > *t)
}

// ── Durable machine ──────────────────────────────────────────────────────

type PrKey = (i64, i64);

pub struct PrMachine {
    db: Arc<Db>,
    locks: Mutex<HashMap<PrKey, Arc<Mutex<()>>>>,
}

impl PrMachine {
    pub fn new(db: Arc<Db>) -> Arc<Self> {
        Arc::new(Self { db, locks: Mutex::new(HashMap::new()) })
    }

    async fn lock_for(&self, key: PrKey) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().await;
        Arc::clone(map.entry(key).or_default())
    }

    pub fn load(&self, repo_id: i64, number: i64) -> Result<Option<PrRecord>> {
        match self.db.get_pr_json(repo_id, number)? {
            None => Ok(None),
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        }
    }

    /// Apply one webhook event. Duplicate deliveries (same delivery id) are
    /// no-ops returning the current record with no effects.
    pub async fn handle(
        &self,
        repo_id: i64,
        number: i64,
        delivery_id: &str,
        event: PrEvent,
    ) -> Result<(PrRecord, Effects)> {
        let lock = self.lock_for((repo_id, number)).await;
        let _guard = lock.lock().await;

        if !delivery_id.is_empty() && self.db.has_pr_delivery(repo_id, number, delivery_id)? {
            let rec = self
                .load(repo_id, number)?
                .ok_or_else(|| GantryError::NotFound(format!("PR #{number}")))?;
            return Ok((rec, Effects::default()));
        }

        let mut rec = match (self.load(repo_id, number)?, &event) {
            (Some(rec), _) => rec,
            (None, PrEvent::Opened { head_ref, base_ref, author, body, at, .. }) => {
                PrRecord::new_opened(number, head_ref, base_ref, author, body, *at)
            }
            (None, _) => {
                return Err(GantryError::NotFound(format!("PR #{number}")).into());
            }
        };

        let effects = apply(&mut rec, &event);

        self.db.put_pr_json(repo_id, number, &serde_json::to_string(&rec)?)?;
        if !delivery_id.is_empty() {
            self.db.record_pr_delivery(repo_id, number, delivery_id)?;
        }
        Ok((rec, effects))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap()
    }

    fn opened(reviewers: &[&str]) -> PrEvent {
        PrEvent::Opened {
            head_ref: "cody/demo-ab12".into(),
            base_ref: "main".into(),
            author: "cody".into(),
            body: "Closes #demo-ab12".into(),
            reviewers: reviewers.iter().map(|s| s.to_string()).collect(),
            at: at(1),
        }
    }

    fn review(reviewer: &str, state: ReviewState, body: &str, hour: u32) -> PrEvent {
        PrEvent::Review {
            reviewer: reviewer.into(),
            state,
            body: body.into(),
            at: at(hour),
        }
    }

    fn fresh(reviewers: &[&str]) -> PrRecord {
        let mut rec = PrRecord::new_opened(7, "cody/demo-ab12", "main", "cody", "Closes #demo-ab12", at(1));
        apply(&mut rec, &opened(reviewers));
        rec
    }

    // ── escalation parser ───────────────────────────────────────────────

    #[test]
    fn escalation_empty_inputs() {
        assert!(parse_escalations("").is_empty());
        assert!(parse_escalations("no markers").is_empty());
    }

    #[test]
    fn escalation_basic_and_case_insensitive_keyword() {
        assert_eq!(
            parse_escalations("LGTM <!-- escalate: sam, priya -->"),
            vec!["sam", "priya"]
        );
        assert_eq!(parse_escalations("<!-- ESCALATE: Sam -->"), vec!["Sam"]);
    }

    #[test]
    fn escalation_dedupes_across_markers_preserving_case() {
        let body = "<!-- escalate: Sam, priya --> then <!-- escalate: sam, omar -->";
        assert_eq!(parse_escalations(body), vec!["Sam", "priya", "omar"]);
    }

    #[test]
    fn escalation_drops_empty_names() {
        assert_eq!(parse_escalations("<!-- escalate: , sam,, -->"), vec!["sam"]);
    }

    #[test]
    fn closes_refs_parsing() {
        assert_eq!(closes_refs("Closes #demo-ab12"), vec!["demo-ab12"]);
        assert_eq!(closes_refs("closes #a-1 and Closes #b-2"), vec!["a-1", "b-2"]);
        assert!(closes_refs("fixes nothing").is_empty());
    }

    // ── transitions ─────────────────────────────────────────────────────

    #[test]
    fn opened_seeds_queue_and_dispatches() {
        let mut rec =
            PrRecord::new_opened(7, "h", "main", "cody", "", at(1));
        let effects = apply(&mut rec, &opened(&["quinn"]));
        assert_eq!(rec.state, PrState::AwaitingReview);
        assert_eq!(rec.queue.len(), 1);
        assert_eq!(effects.dispatch_reviewers, vec!["quinn"]);
    }

    #[test]
    fn escalation_scenario_full_approval_then_normal_merge() {
        let mut rec = fresh(&["quinn"]);

        let effects = apply(
            &mut rec,
            &review("quinn", ReviewState::Approved, "LGTM <!-- escalate: sam, priya -->", 2),
        );
        assert_eq!(effects.dispatch_reviewers, vec!["sam", "priya"]);
        assert_eq!(rec.state, PrState::AwaitingReview);
        assert_eq!(rec.queue.len(), 3);
        assert_eq!(rec.queue[0].verdict, Verdict::Approved);

        apply(&mut rec, &review("sam", ReviewState::Approved, "ok", 3));
        assert_eq!(rec.state, PrState::AwaitingReview);
        apply(&mut rec, &review("priya", ReviewState::Approved, "ok", 4));
        assert_eq!(rec.state, PrState::Approved);

        let effects = apply(&mut rec, &PrEvent::Closed { merged: true, at: at(5) });
        assert_eq!(rec.state, PrState::Merged);
        assert_eq!(rec.merge_type, MergeType::Normal);
        assert_eq!(effects.close_issue_keys, vec!["demo-ab12"]);
    }

    #[test]
    fn force_merge_before_approval() {
        let mut rec = fresh(&["quinn"]);
        apply(&mut rec, &PrEvent::Closed { merged: true, at: at(2) });
        assert_eq!(rec.state, PrState::Merged);
        assert_eq!(rec.merge_type, MergeType::Forced);
    }

    #[test]
    fn changes_requested_blocks_until_synchronize() {
        let mut rec = fresh(&["quinn"]);
        apply(&mut rec, &review("quinn", ReviewState::ChangesRequested, "fix it", 2));
        assert_eq!(rec.state, PrState::ChangesRequested);
        assert!(!ready_to_merge(&rec));

        // Approval without a new commit cannot happen: verdict stays CR
        // until a synchronize clears it.
        let effects = apply(&mut rec, &PrEvent::Synchronize { at: at(3) });
        assert_eq!(effects.dispatch_reviewers, vec!["quinn"]);
        assert_eq!(rec.state, PrState::AwaitingReview);
        assert_eq!(rec.queue[0].verdict, Verdict::Pending);

        apply(&mut rec, &review("quinn", ReviewState::Approved, "better", 4));
        assert_eq!(rec.state, PrState::Approved);
        assert!(ready_to_merge(&rec));
    }

    #[test]
    fn ready_to_merge_requires_commit_newer_than_every_cr() {
        let mut rec = fresh(&["quinn"]);
        apply(&mut rec, &review("quinn", ReviewState::ChangesRequested, "no", 5));
        apply(&mut rec, &PrEvent::Synchronize { at: at(3) });
        apply(&mut rec, &review("quinn", ReviewState::Approved, "ok", 6));
        // Head commit (hour 3) predates the CR verdict (hour 5).
        assert_eq!(rec.state, PrState::Approved);
        assert!(!ready_to_merge(&rec));
    }

    #[test]
    fn commented_records_without_transition() {
        let mut rec = fresh(&["quinn"]);
        apply(&mut rec, &review("quinn", ReviewState::Commented, "hmm", 2));
        assert_eq!(rec.state, PrState::AwaitingReview);
        assert_eq!(rec.queue[0].verdict, Verdict::Commented);
    }

    #[test]
    fn outside_review_has_no_state_effect() {
        let mut rec = fresh(&["quinn"]);
        let effects = apply(&mut rec, &review("rando", ReviewState::Approved, "lgtm", 2));
        assert_eq!(rec.state, PrState::AwaitingReview);
        assert!(effects.dispatch_reviewers.is_empty());
        assert_eq!(rec.outside_reviews.len(), 1);
        assert_eq!(rec.queue.len(), 1);
    }

    #[test]
    fn approval_then_later_changes_requested_reverts() {
        let mut rec = fresh(&["quinn"]);
        apply(&mut rec, &review("quinn", ReviewState::Approved, "ok", 2));
        assert_eq!(rec.state, PrState::Approved);
        apply(&mut rec, &review("quinn", ReviewState::ChangesRequested, "wait", 3));
        assert_eq!(rec.state, PrState::ChangesRequested);
        assert_eq!(rec.queue[0].verdict, Verdict::ChangesRequested);
    }

    #[test]
    fn close_unmerged_then_reopen_restores_state() {
        let mut rec = fresh(&["quinn"]);
        apply(&mut rec, &review("quinn", ReviewState::ChangesRequested, "no", 2));
        apply(&mut rec, &PrEvent::Closed { merged: false, at: at(3) });
        assert_eq!(rec.state, PrState::Closed);
        apply(&mut rec, &PrEvent::Reopened { at: at(4) });
        assert_eq!(rec.state, PrState::ChangesRequested);
    }

    #[test]
    fn apply_is_idempotent_for_repeated_events() {
        let mut rec = fresh(&["quinn"]);
        let ev = review("quinn", ReviewState::Approved, "LGTM <!-- escalate: sam -->", 2);
        apply(&mut rec, &ev);
        let snapshot = rec.clone();
        apply(&mut rec, &ev);
        assert_eq!(rec.state, snapshot.state);
        assert_eq!(rec.queue, snapshot.queue);
        assert_eq!(rec.cr_history, snapshot.cr_history);
    }

    // ── durable machine ─────────────────────────────────────────────────

    fn machine() -> Arc<PrMachine> {
        let db = Db::open_in_memory().unwrap();
        db.migrate().unwrap();
        PrMachine::new(Arc::new(db))
    }

    #[tokio::test]
    async fn duplicate_delivery_is_a_no_op() {
        let m = machine();
        let (_, effects) = m.handle(1, 7, "d-1", opened(&["quinn"])).await.unwrap();
        assert_eq!(effects.dispatch_reviewers, vec!["quinn"]);

        let (rec, effects) = m.handle(1, 7, "d-1", opened(&["quinn"])).await.unwrap();
        assert!(effects.dispatch_reviewers.is_empty());
        assert_eq!(rec.queue.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_survives_machine_restart() {
        let db = Arc::new({
            let db = Db::open_in_memory().unwrap();
            db.migrate().unwrap();
            db
        });
        let m = PrMachine::new(Arc::clone(&db));
        m.handle(1, 7, "d-1", opened(&["quinn"])).await.unwrap();
        m.handle(1, 7, "d-2", review("quinn", ReviewState::Approved, "ok", 2))
            .await
            .unwrap();
        drop(m);

        // New machine over the same Db sees the approved snapshot.
        let m2 = PrMachine::new(db);
        let rec = m2.load(1, 7).unwrap().unwrap();
        assert_eq!(rec.state, PrState::Approved);
    }

    #[tokio::test]
    async fn review_for_unknown_pr_is_not_found() {
        let m = machine();
        let err = m
            .handle(1, 99, "d-1", review("quinn", ReviewState::Approved, "ok", 2))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GantryError>(),
            Some(GantryError::NotFound(_))
        ));
    }
}
