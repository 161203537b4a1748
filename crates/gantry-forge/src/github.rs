//! GitHub REST client.
//!
//! Authentication: per-installation short-lived tokens minted from a
//! configured app JWT, cached until shortly before expiry; a static token
//! is the fallback when no app JWT is configured. 429 and 5xx responses
//! surface as retryable error kinds so callers back off.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use gantry_core::error::GantryError;
use gantry_core::forge::{
    Forge, ForgeIssue, ForgePr, IssuePatch, NewPr, RepoBinding, ReviewVerdict,
};

const UA: &str = "gantry-orchestrator";

pub struct GithubClient {
    http: reqwest::Client,
    api_base: String,
    static_token: String,
    app_jwt: String,
    token_cache: Mutex<HashMap<i64, (String, DateTime<Utc>)>>,
}

#[derive(Deserialize)]
struct InstallationToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawLabel {
    name: String,
}

#[derive(Deserialize)]
struct RawUser {
    login: String,
}

#[derive(Deserialize)]
struct RawIssue {
    number: i64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    state: String,
    #[serde(default)]
    labels: Vec<RawLabel>,
    #[serde(default)]
    assignee: Option<RawUser>,
    updated_at: DateTime<Utc>,
    /// Present when the "issue" is actually a pull request.
    #[serde(default)]
    pull_request: Option<Value>,
}

#[derive(Deserialize)]
struct RawPr {
    number: i64,
    html_url: String,
    head: RawRef,
    base: RawRef,
}

#[derive(Deserialize)]
struct RawRef {
    #[serde(rename = "ref")]
    git_ref: String,
}

#[derive(Deserialize)]
struct RawMilestone {
    title: String,
}

impl GithubClient {
    pub fn new(api_base: &str, static_token: &str, app_jwt: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            static_token: static_token.to_string(),
            app_jwt: app_jwt.to_string(),
            token_cache: Mutex::new(HashMap::new()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }

    async fn token_for(&self, repo: &RepoBinding) -> Result<String> {
        if self.app_jwt.is_empty() {
            return Ok(self.static_token.clone());
        }
        {
            let cache = self.token_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((token, expires_at)) = cache.get(&repo.installation_id) {
                if *expires_at - Utc::now() > Duration::minutes(2) {
                    return Ok(token.clone());
                }
            }
        }

        let url = self.url(&format!(
            "/app/installations/{}/access_tokens",
            repo.installation_id
        ));
        let resp = self
            .http
            .post(&url)
            .header(USER_AGENT, UA)
            .header(ACCEPT, "application/vnd.github+json")
            .bearer_auth(&self.app_jwt)
            .send()
            .await
            .map_err(|e| GantryError::Transient(format!("token exchange: {e}")))?;
        let resp = check_status(resp).await?;
        let minted: InstallationToken = resp.json().await.context("decode installation token")?;

        let mut cache = self.token_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            repo.installation_id,
            (minted.token.clone(), minted.expires_at),
        );
        Ok(minted.token)
    }

    async fn request(
        &self,
        repo: &RepoBinding,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<reqwest::Response> {
        let token = self.token_for(repo).await?;
        let mut req = self
            .http
            .request(method.clone(), self.url(path))
            .header(USER_AGENT, UA)
            .header(ACCEPT, "application/vnd.github+json")
            .bearer_auth(token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        debug!(%method, path, "forge request");
        let resp = req
            .send()
            .await
            .map_err(|e| GantryError::Transient(format!("forge request {path}: {e}")))?;
        check_status(resp).await
    }
}

/// Map forge HTTP failures onto error kinds: 429 → RateLimited, 5xx →
/// Transient, 404 → NotFound; anything else 4xx is permanent.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let path = resp.url().path().to_string();
    let body = resp.text().await.unwrap_or_default();
    let brief: String = body.chars().take(200).collect();
    let err = match status {
        StatusCode::TOO_MANY_REQUESTS => GantryError::RateLimited(format!("{path}: {brief}")),
        StatusCode::NOT_FOUND => GantryError::NotFound(path),
        s if s.is_server_error() => GantryError::Transient(format!("{path}: {s}")),
        s => GantryError::Conflict(format!("{path}: {s}: {brief}")),
    };
    Err(err.into())
}

fn issue_of(raw: RawIssue) -> ForgeIssue {
    ForgeIssue {
        number: raw.number,
        title: raw.title,
        body: raw.body.unwrap_or_default(),
        state: raw.state,
        labels: raw.labels.into_iter().map(|l| l.name).collect(),
        assignee: raw.assignee.map(|u| u.login),
        updated_at: raw.updated_at,
    }
}

#[async_trait]
impl Forge for GithubClient {
    async fn list_issues(&self, repo: &RepoBinding) -> Result<Vec<ForgeIssue>> {
        let mut out = Vec::new();
        let mut page = 1u32;
        loop {
            let path = format!(
                "/repos/{}/{}/issues?state=all&per_page=100&page={page}",
                repo.owner, repo.name
            );
            let resp = self.request(repo, reqwest::Method::GET, &path, None).await?;
            let batch: Vec<RawIssue> = resp.json().await.context("decode issues page")?;
            let len = batch.len();
            out.extend(
                batch
                    .into_iter()
                    .filter(|i| i.pull_request.is_none())
                    .map(issue_of),
            );
            if len < 100 {
                break;
            }
            page += 1;
        }
        Ok(out)
    }

    async fn create_issue(
        &self,
        repo: &RepoBinding,
        title: &str,
        body: &str,
        labels: &BTreeSet<String>,
    ) -> Result<ForgeIssue> {
        let path = format!("/repos/{}/{}/issues", repo.owner, repo.name);
        let payload = json!({
            "title": title,
            "body": body,
            "labels": labels,
        });
        let resp = self
            .request(repo, reqwest::Method::POST, &path, Some(payload))
            .await?;
        let raw: RawIssue = resp.json().await.context("decode created issue")?;
        Ok(issue_of(raw))
    }

    async fn update_issue(&self, repo: &RepoBinding, number: i64, patch: IssuePatch) -> Result<()> {
        let path = format!("/repos/{}/{}/issues/{number}", repo.owner, repo.name);
        let mut payload = serde_json::Map::new();
        if let Some(title) = patch.title {
            payload.insert("title".into(), json!(title));
        }
        if let Some(body) = patch.body {
            payload.insert("body".into(), json!(body));
        }
        if let Some(state) = patch.state {
            payload.insert("state".into(), json!(state));
        }
        if let Some(labels) = patch.labels {
            payload.insert("labels".into(), json!(labels));
        }
        if let Some(assignee) = patch.assignee {
            let assignees: Vec<String> = assignee.into_iter().collect();
            payload.insert("assignees".into(), json!(assignees));
        }
        if payload.is_empty() {
            return Ok(());
        }
        self.request(
            repo,
            reqwest::Method::PATCH,
            &path,
            Some(Value::Object(payload)),
        )
        .await?;
        Ok(())
    }

    async fn create_pr(&self, repo: &RepoBinding, new: NewPr) -> Result<ForgePr> {
        let path = format!("/repos/{}/{}/pulls", repo.owner, repo.name);
        let payload = json!({
            "title": new.title,
            "body": new.body,
            "head": new.head,
            "base": new.base,
        });
        let resp = self
            .request(repo, reqwest::Method::POST, &path, Some(payload))
            .await?;
        let raw: RawPr = resp.json().await.context("decode created pr")?;
        Ok(ForgePr {
            number: raw.number,
            head_ref: raw.head.git_ref,
            base_ref: raw.base.git_ref,
            html_url: raw.html_url,
        })
    }

    async fn submit_review(
        &self,
        repo: &RepoBinding,
        number: i64,
        verdict: ReviewVerdict,
        body: &str,
    ) -> Result<()> {
        let path = format!("/repos/{}/{}/pulls/{number}/reviews", repo.owner, repo.name);
        let event = match verdict {
            ReviewVerdict::Approve => "APPROVE",
            ReviewVerdict::RequestChanges => "REQUEST_CHANGES",
            ReviewVerdict::Comment => "COMMENT",
        };
        let payload = json!({ "event": event, "body": body });
        self.request(repo, reqwest::Method::POST, &path, Some(payload))
            .await?;
        Ok(())
    }

    async fn merge_pr(&self, repo: &RepoBinding, number: i64) -> Result<()> {
        let path = format!("/repos/{}/{}/pulls/{number}/merge", repo.owner, repo.name);
        self.request(repo, reqwest::Method::PUT, &path, Some(json!({})))
            .await?;
        Ok(())
    }

    async fn list_milestones(&self, repo: &RepoBinding) -> Result<Vec<String>> {
        let path = format!(
            "/repos/{}/{}/milestones?state=all&per_page=100",
            repo.owner, repo.name
        );
        let resp = self.request(repo, reqwest::Method::GET, &path, None).await?;
        let raw: Vec<RawMilestone> = resp.json().await.context("decode milestones")?;
        Ok(raw.into_iter().map(|m| m.title).collect())
    }

    async fn ensure_milestone(&self, repo: &RepoBinding, title: &str) -> Result<()> {
        let path = format!("/repos/{}/{}/milestones", repo.owner, repo.name);
        self.request(repo, reqwest::Method::POST, &path, Some(json!({ "title": title })))
            .await?;
        Ok(())
    }

    async fn installation_token(&self, repo: &RepoBinding) -> Result<String> {
        self.token_for(repo).await
    }
}
