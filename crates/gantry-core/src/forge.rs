//! The outbound forge surface consumed by the sync coordinator, the develop
//! workflow, and the PR wrapper routes. `gantry-forge` provides the GitHub
//! implementation; tests use in-memory fakes.

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One repository binding: identifies the installation and carries the
/// webhook secret and default branch. Owns one sync coordinator instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoBinding {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub installation_id: i64,
    pub webhook_secret: String,
    pub default_branch: String,
}

impl RepoBinding {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeIssue {
    pub number: i64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    /// "open" | "closed"
    pub state: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgePr {
    pub number: i64,
    pub head_ref: String,
    pub base_ref: String,
    pub html_url: String,
}

#[derive(Debug, Clone)]
pub struct NewPr {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

/// Patch for an existing forge issue. `None` leaves the field untouched;
/// `assignee: Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct IssuePatch {
    pub title: Option<String>,
    pub body: Option<String>,
    pub state: Option<String>,
    pub labels: Option<BTreeSet<String>>,
    pub assignee: Option<Option<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewVerdict {
    Approve,
    RequestChanges,
    Comment,
}

#[async_trait]
pub trait Forge: Send + Sync {
    async fn list_issues(&self, repo: &RepoBinding) -> Result<Vec<ForgeIssue>>;
    async fn create_issue(
        &self,
        repo: &RepoBinding,
        title: &str,
        body: &str,
        labels: &BTreeSet<String>,
    ) -> Result<ForgeIssue>;
    async fn update_issue(&self, repo: &RepoBinding, number: i64, patch: IssuePatch) -> Result<()>;

    async fn create_pr(&self, repo: &RepoBinding, new: NewPr) -> Result<ForgePr>;
    async fn submit_review(
        &self,
        repo: &RepoBinding,
        number: i64,
        verdict: ReviewVerdict,
        body: &str,
    ) -> Result<()>;
    async fn merge_pr(&self, repo: &RepoBinding, number: i64) -> Result<()>;

    async fn list_milestones(&self, repo: &RepoBinding) -> Result<Vec<String>>;
    async fn ensure_milestone(&self, repo: &RepoBinding, title: &str) -> Result<()>;

    /// Short-lived installation token for git smart-HTTP auth.
    async fn installation_token(&self, repo: &RepoBinding) -> Result<String>;
}
