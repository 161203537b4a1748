//! Event router: scheduled triggers and lifecycle hooks that keep the
//! backlog alive. Classification and planning are pure over a loaded issue
//! set; the async wrappers mutate the mirror and lean on the sync
//! coordinator to propagate.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::Db;
use crate::deps::{self, IssueMap};
use crate::dispatch::Dispatcher;
use crate::forge::RepoBinding;
use crate::issue::{Issue, Status};
use crate::pr::closes_refs;
use crate::sync::{SyncKind, SyncManager, SyncRequest};

#[derive(Debug, Clone, Default, Serialize)]
pub struct DailySummary {
    pub in_progress: Vec<String>,
    pub blocked: Vec<String>,
    pub ready: Vec<String>,
    /// Blocked issues at priority 0 or 1, worth flagging loudly.
    pub high_priority_blocked: Vec<String>,
}

/// Classify the issue set for the daily summary.
pub fn daily_summary(issues: &IssueMap) -> DailySummary {
    let mut summary = DailySummary::default();
    for issue in issues.values() {
        match issue.status {
            Status::InProgress => summary.in_progress.push(issue.id.clone()),
            Status::Blocked => {
                summary.blocked.push(issue.id.clone());
                if issue.priority <= 1 {
                    summary.high_priority_blocked.push(issue.id.clone());
                }
            }
            Status::Open => {
                if deps::is_ready(issues, &issue.id) {
                    summary.ready.push(issue.id.clone());
                }
            }
            Status::Closed => {}
        }
    }
    summary
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanEntry {
    pub id: String,
    pub priority: u8,
    /// Number of issues transitively blocked by this one.
    pub impact: usize,
}

/// Weekly planning: the readiness DAG ranked by priority, then impact.
pub fn weekly_plan(issues: &IssueMap) -> Vec<PlanEntry> {
    let mut entries: Vec<PlanEntry> = issues
        .values()
        .filter(|i| deps::is_ready(issues, &i.id))
        .map(|i| PlanEntry {
            id: i.id.clone(),
            priority: i.priority,
            impact: deps::impact(issues, &i.id),
        })
        .collect();
    entries.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(b.impact.cmp(&a.impact))
            .then(a.id.cmp(&b.id))
    });
    entries
}

// ── Router ───────────────────────────────────────────────────────────────

pub struct Router {
    db: Arc<Db>,
    config: Arc<Config>,
    dispatcher: Option<Arc<Dispatcher>>,
    sync: Option<Arc<SyncManager>>,
}

impl Router {
    pub fn new(
        db: Arc<Db>,
        config: Arc<Config>,
        dispatcher: Option<Arc<Dispatcher>>,
        sync: Option<Arc<SyncManager>>,
    ) -> Arc<Self> {
        Arc::new(Self { db, config, dispatcher, sync })
    }

    fn issues(&self, repo: &RepoBinding) -> Result<IssueMap> {
        self.db.mirror_all(repo.id)
    }

    async fn enqueue_issue_sync(&self, repo: &RepoBinding) {
        if let Some(sync) = &self.sync {
            sync.enqueue(repo, SyncRequest::new(SyncKind::Issues, "router"))
                .await;
        }
    }

    /// Daily tick: classify and log the summary.
    pub fn run_daily(&self, repo: &RepoBinding) -> Result<DailySummary> {
        let issues = self.issues(repo)?;
        let summary = daily_summary(&issues);
        info!(
            repo = %repo.full_name(),
            in_progress = summary.in_progress.len(),
            blocked = summary.blocked.len(),
            ready = summary.ready.len(),
            high_priority_blocked = ?summary.high_priority_blocked,
            "daily summary"
        );
        Ok(summary)
    }

    /// Weekly tick: rank ready work.
    pub fn run_weekly(&self, repo: &RepoBinding) -> Result<Vec<PlanEntry>> {
        let issues = self.issues(repo)?;
        let plan = weekly_plan(&issues);
        info!(repo = %repo.full_name(), entries = plan.len(), "weekly plan computed");
        Ok(plan)
    }

    /// Hook: an issue closed. Reclassify the issues it blocked; newly
    /// ready issues with an agent assignee are dispatched.
    pub async fn on_issue_closed(&self, repo: &RepoBinding, issue_id: &str) -> Result<Vec<String>> {
        let mut issues = self.issues(repo)?;
        let newly_ready = deps::newly_ready_after_close(&issues, issue_id);

        let now = Utc::now();
        let changed = deps::recompute_blocked(&mut issues, now);
        for id in &changed {
            if let Some(rec) = issues.get(id) {
                self.db.mirror_upsert(repo.id, rec)?;
            }
        }

        for ready_id in &newly_ready {
            let assignee = issues.get(ready_id).and_then(|i| i.assignee.clone());
            if let (Some(dispatcher), Some(assignee)) = (&self.dispatcher, assignee) {
                match dispatcher.assign(repo, ready_id, &assignee).await {
                    Ok(outcome) if outcome.triggered => {
                        info!(issue = %ready_id, %assignee, "unblocked issue dispatched");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(issue = %ready_id, "dispatch after unblock failed: {e}"),
                }
            }
        }

        // Epic auto-close: an epic whose children are now all closed.
        for epic_id in deps::completable_epics(&issues) {
            if let Some(epic) = issues.get_mut(&epic_id) {
                epic.close(now);
                self.db.mirror_upsert(repo.id, epic)?;
                info!(epic = %epic_id, "epic completed; closing");
            }
        }

        if !newly_ready.is_empty() || !changed.is_empty() {
            self.enqueue_issue_sync(repo).await;
        }
        Ok(newly_ready)
    }

    /// Hook: an issue became blocked. Its assignee is cleared so the agent
    /// frees up; by default the in-flight workflow is cancelled too.
    pub async fn on_issue_blocked(&self, repo: &RepoBinding, issue_id: &str) -> Result<()> {
        if let Some(mut issue) = self.db.mirror_get(repo.id, issue_id)? {
            if issue.assignee.take().is_some() {
                issue.updated_at = Utc::now();
                self.db.mirror_upsert(repo.id, &issue)?;
                self.enqueue_issue_sync(repo).await;
            }
        }
        if self.config.cancel_in_flight {
            if let Some(dispatcher) = &self.dispatcher {
                if let Some(wf) = dispatcher.cancel_for_issue(repo.id, issue_id).await? {
                    info!(issue = %issue_id, workflow = %wf, "cancelled in-flight workflow for blocked issue");
                }
            }
        }
        Ok(())
    }

    /// Hook: a PR merged. `Closes #K` issues are closed locally.
    pub async fn on_pr_merged(&self, repo: &RepoBinding, pr_body: &str) -> Result<Vec<String>> {
        let mut closed = Vec::new();
        let now = Utc::now();
        for key in closes_refs(pr_body) {
            if let Some(mut issue) = self.db.mirror_get(repo.id, &key)? {
                if !issue.is_closed() {
                    issue.close(now);
                    self.db.mirror_upsert(repo.id, &issue)?;
                    closed.push(key.clone());
                }
            }
        }
        for key in closed.clone() {
            // Cascade: closing may unblock dependents.
            self.on_issue_closed(repo, &key).await?;
        }
        Ok(closed)
    }
}
