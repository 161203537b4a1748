//! Assignment dispatcher: gates "issue assigned to agent" events into
//! develop-workflow starts.
//!
//! The decision table is evaluated in order; the first matching row wins.
//! Gating outcomes are normal decisions, not errors: the caller always gets
//! an `ok` envelope with `triggered` communicating the result.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::{Db, Intent};
use crate::deps;
use crate::error::GantryError;
use crate::forge::{Forge, RepoBinding};
use crate::issue::Status;
use crate::runner::SandboxRunner;
use crate::workflow::{self, WorkflowCtx};

#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub triggered: bool,
    #[serde(rename = "workflowID", skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DispatchOutcome {
    fn skipped(reason: &str) -> Self {
        Self { triggered: false, workflow_id: None, reason: Some(reason.to_string()) }
    }

    fn triggered(workflow_id: String) -> Self {
        Self { triggered: true, workflow_id: Some(workflow_id), reason: None }
    }
}

pub struct Dispatcher {
    db: Arc<Db>,
    config: Arc<Config>,
    forge: Arc<dyn Forge>,
    runner: Arc<dyn SandboxRunner>,
    cancels: Mutex<HashMap<String, CancellationToken>>,
}

fn new_workflow_id() -> String {
    let mut bytes = [0u8; 6];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
    format!("wf-{}", hex::encode(bytes))
}

impl Dispatcher {
    pub fn new(
        db: Arc<Db>,
        config: Arc<Config>,
        forge: Arc<dyn Forge>,
        runner: Arc<dyn SandboxRunner>,
    ) -> Arc<Self> {
        Arc::new(Self { db, config, forge, runner, cancels: Mutex::new(HashMap::new()) })
    }

    /// Evaluate an assignment change for `issue_id`.
    ///
    /// Different issues trigger concurrently; each successful trigger
    /// returns a workflow id never returned before.
    pub async fn assign(
        self: &Arc<Self>,
        repo: &RepoBinding,
        issue_id: &str,
        assignee: &str,
    ) -> Result<DispatchOutcome> {
        let registry = &self.config.registry;
        if registry.get(assignee).is_none() {
            if registry.is_known_human(assignee) {
                return Ok(DispatchOutcome::skipped("assignee not an agent"));
            }
            return Ok(DispatchOutcome::skipped("agent not found"));
        }

        let issues = self.db.mirror_all(repo.id)?;
        let issue = issues
            .get(issue_id)
            .cloned()
            .ok_or_else(|| GantryError::NotFound(format!("issue {issue_id}")))?;

        if issue.status == Status::Closed {
            return Ok(DispatchOutcome::skipped("issue is closed"));
        }
        if issue.status == Status::Blocked || deps::is_blocked(&issues, issue_id) {
            return Ok(DispatchOutcome::skipped("issue is blocked"));
        }

        if let Some(prior) = self.db.running_intent_for_issue(repo.id, issue_id)? {
            if prior.agent == assignee {
                return Ok(DispatchOutcome::skipped("already assigned"));
            }
            // Re-assignment: the prior intent is cancelled before the new
            // workflow id is handed out.
            self.cancel_workflow(&prior.workflow_id).await?;
        }

        let workflow_id = new_workflow_id();
        let intent = Intent {
            workflow_id: workflow_id.clone(),
            repo_id: repo.id,
            issue_id: issue_id.to_string(),
            agent: assignee.to_string(),
            state: "running".into(),
            session_id: String::new(),
            error: String::new(),
            started_at: Utc::now(),
            finished_at: None,
        };
        self.db.insert_intent(&intent)?;

        let cancel = CancellationToken::new();
        self.cancels
            .lock()
            .await
            .insert(workflow_id.clone(), cancel.clone());

        let ctx = WorkflowCtx {
            db: Arc::clone(&self.db),
            config: Arc::clone(&self.config),
            forge: Arc::clone(&self.forge),
            runner: Arc::clone(&self.runner),
        };
        let repo = repo.clone();
        let agent = assignee.to_string();
        let wf_id = workflow_id.clone();
        let this = Arc::clone(self);
        let deadline = std::time::Duration::from_secs(self.config.workflow_timeout_s.max(60));
        tokio::spawn(async move {
            let db = Arc::clone(&ctx.db);
            let run = workflow::run_develop(ctx, repo, issue, agent, wf_id.clone(), cancel.clone());
            match tokio::time::timeout(deadline, run).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(workflow_id = %wf_id, "develop workflow error: {e}");
                }
                Err(_) => {
                    tracing::error!(workflow_id = %wf_id, "develop workflow timed out");
                    cancel.cancel();
                    if let Ok(Some(intent)) = db.get_intent(&wf_id) {
                        if !intent.is_terminal() {
                            let _ = db.update_intent_state(&wf_id, "failed", "workflow timed out");
                        }
                    }
                }
            }
            this.cancels.lock().await.remove(&wf_id);
        });

        Ok(DispatchOutcome::triggered(workflow_id))
    }

    /// Move a workflow to `cancelled` and fire its cancellation token.
    pub async fn cancel_workflow(&self, workflow_id: &str) -> Result<()> {
        if let Some(token) = self.cancels.lock().await.remove(workflow_id) {
            token.cancel();
        }
        if let Some(intent) = self.db.get_intent(workflow_id)? {
            if !intent.is_terminal() {
                self.db.update_intent_state(workflow_id, "cancelled", "")?;
            }
        }
        Ok(())
    }

    /// Cancel whatever workflow is running for an issue (used by the event
    /// router when an issue becomes blocked).
    pub async fn cancel_for_issue(&self, repo_id: i64, issue_id: &str) -> Result<Option<String>> {
        match self.db.running_intent_for_issue(repo_id, issue_id)? {
            None => Ok(None),
            Some(intent) => {
                self.cancel_workflow(&intent.workflow_id).await?;
                Ok(Some(intent.workflow_id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::{ForgeIssue, ForgePr, IssuePatch, NewPr, ReviewVerdict};
    use crate::issue::Issue;
    use crate::runner::{ExecOutput, ExecSpec, SessionHandle};
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    struct StubForge;

    #[async_trait]
    impl Forge for StubForge {
        async fn list_issues(&self, _: &RepoBinding) -> Result<Vec<ForgeIssue>> {
            Ok(Vec::new())
        }
        async fn create_issue(
            &self,
            _: &RepoBinding,
            title: &str,
            _: &str,
            _: &BTreeSet<String>,
        ) -> Result<ForgeIssue> {
            Ok(ForgeIssue {
                number: 1,
                title: title.into(),
                body: String::new(),
                state: "open".into(),
                labels: BTreeSet::new(),
                assignee: None,
                updated_at: Utc::now(),
            })
        }
        async fn update_issue(&self, _: &RepoBinding, _: i64, _: IssuePatch) -> Result<()> {
            Ok(())
        }
        async fn create_pr(&self, _: &RepoBinding, new: NewPr) -> Result<ForgePr> {
            Ok(ForgePr {
                number: 11,
                head_ref: new.head,
                base_ref: new.base,
                html_url: "http://forge/pr/11".into(),
            })
        }
        async fn submit_review(
            &self,
            _: &RepoBinding,
            _: i64,
            _: ReviewVerdict,
            _: &str,
        ) -> Result<()> {
            Ok(())
        }
        async fn merge_pr(&self, _: &RepoBinding, _: i64) -> Result<()> {
            Ok(())
        }
        async fn list_milestones(&self, _: &RepoBinding) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn ensure_milestone(&self, _: &RepoBinding, _: &str) -> Result<()> {
            Ok(())
        }
        async fn installation_token(&self, _: &RepoBinding) -> Result<String> {
            Ok("tok_test".into())
        }
    }

    /// Runner whose exec blocks until the workflow is cancelled, keeping
    /// intents in `running` for the duration of a test.
    struct BlockingRunner;

    #[async_trait]
    impl SandboxRunner for BlockingRunner {
        async fn acquire(&self) -> Result<SessionHandle> {
            Ok(SessionHandle { id: "sess-1".into() })
        }
        async fn exec(
            &self,
            _: &SessionHandle,
            _: ExecSpec,
            cancel: &CancellationToken,
        ) -> Result<ExecOutput> {
            cancel.cancelled().await;
            Err(GantryError::Cancelled.into())
        }
        async fn release(&self, _: SessionHandle) -> Result<()> {
            Ok(())
        }
    }

    fn fixture() -> (Arc<Dispatcher>, RepoBinding, Arc<Db>) {
        let db = Arc::new({
            let db = Db::open_in_memory().unwrap();
            db.migrate().unwrap();
            db
        });
        let repo_id = db.upsert_repo("acme", "widgets", 1, "s", "main").unwrap();
        let repo = db.get_repo("acme", "widgets").unwrap().unwrap();
        assert_eq!(repo.id, repo_id);

        let mut config = test_config();
        config.registry = crate::registry::AgentRegistry::parse(
            "cody:sandbox,tom:sandbox,quinn:light:reviewer",
            "alice",
            "",
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&db),
            Arc::new(config),
            Arc::new(StubForge),
            Arc::new(BlockingRunner),
        );
        (dispatcher, repo, db)
    }

    fn test_config() -> Config {
        // from_env with no env set yields defaults.
        Config::from_env().unwrap()
    }

    fn seed_issue(db: &Db, repo_id: i64, id: &str) -> Issue {
        let issue = Issue::new(id, id, Utc::now());
        db.mirror_upsert(repo_id, &issue).unwrap();
        issue
    }

    #[tokio::test]
    async fn happy_path_then_duplicate_then_reassign() {
        let (dispatcher, repo, db) = fixture();
        seed_issue(&db, repo.id, "demo-ab12");

        let first = dispatcher.assign(&repo, "demo-ab12", "cody").await.unwrap();
        assert!(first.triggered);
        let wf_x = first.workflow_id.unwrap();

        let dup = dispatcher.assign(&repo, "demo-ab12", "cody").await.unwrap();
        assert!(!dup.triggered);
        assert_eq!(dup.reason.as_deref(), Some("already assigned"));

        let reassigned = dispatcher.assign(&repo, "demo-ab12", "tom").await.unwrap();
        assert!(reassigned.triggered);
        let wf_y = reassigned.workflow_id.unwrap();
        assert_ne!(wf_x, wf_y);

        let prior = db.get_intent(&wf_x).unwrap().unwrap();
        assert_eq!(prior.state, "cancelled");
        let current = db.get_intent(&wf_y).unwrap().unwrap();
        assert_eq!(current.state, "running");
    }

    #[tokio::test]
    async fn non_agents_do_not_trigger() {
        let (dispatcher, repo, db) = fixture();
        seed_issue(&db, repo.id, "demo-ab12");

        let human = dispatcher.assign(&repo, "demo-ab12", "alice").await.unwrap();
        assert!(!human.triggered);
        assert_eq!(human.reason.as_deref(), Some("assignee not an agent"));

        let unknown = dispatcher.assign(&repo, "demo-ab12", "nobody").await.unwrap();
        assert!(!unknown.triggered);
        assert_eq!(unknown.reason.as_deref(), Some("agent not found"));
    }

    #[tokio::test]
    async fn closed_and_blocked_issues_do_not_trigger() {
        let (dispatcher, repo, db) = fixture();

        let mut closed = seed_issue(&db, repo.id, "demo-done");
        closed.close(Utc::now());
        db.mirror_upsert(repo.id, &closed).unwrap();
        let out = dispatcher.assign(&repo, "demo-done", "cody").await.unwrap();
        assert_eq!(out.reason.as_deref(), Some("issue is closed"));

        // blk2 depends on open blk1.
        seed_issue(&db, repo.id, "demo-blk1");
        let mut blk2 = seed_issue(&db, repo.id, "demo-blk2");
        blk2.depends_on.insert("demo-blk1".into());
        db.mirror_upsert(repo.id, &blk2).unwrap();
        let out = dispatcher.assign(&repo, "demo-blk2", "cody").await.unwrap();
        assert!(!out.triggered);
        assert_eq!(out.reason.as_deref(), Some("issue is blocked"));

        // Closing the blocker unblocks dispatch.
        let mut blk1 = db.mirror_get(repo.id, "demo-blk1").unwrap().unwrap();
        blk1.close(Utc::now());
        db.mirror_upsert(repo.id, &blk1).unwrap();
        let out = dispatcher.assign(&repo, "demo-blk2", "cody").await.unwrap();
        assert!(out.triggered);
    }

    #[tokio::test]
    async fn unknown_issue_is_not_found() {
        let (dispatcher, repo, _db) = fixture();
        let err = dispatcher.assign(&repo, "ghost-1", "cody").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GantryError>(),
            Some(GantryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn distinct_issues_trigger_concurrently() {
        let (dispatcher, repo, db) = fixture();
        seed_issue(&db, repo.id, "demo-a");
        seed_issue(&db, repo.id, "demo-b");

        let a = dispatcher.assign(&repo, "demo-a", "cody").await.unwrap();
        let b = dispatcher.assign(&repo, "demo-b", "tom").await.unwrap();
        assert!(a.triggered && b.triggered);
        assert_ne!(a.workflow_id, b.workflow_id);
        assert_eq!(db.list_running_intents().unwrap().len(), 2);
    }
}
