use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use gantry_core::error::{kind_of, GantryError};
use gantry_core::forge::{NewPr, RepoBinding, ReviewVerdict};
use gantry_core::pr::ready_to_merge;
use gantry_core::sync::{SyncKind, SyncRequest};
use gantry_sandbox::SessionOptions;

use crate::AppState;

// ── Error envelope ───────────────────────────────────────────────────────

/// Map an error chain onto the uniform `{ok:false, error:<kind>}` envelope.
pub(crate) fn fail(e: anyhow::Error) -> (StatusCode, Json<Value>) {
    let (status, message) = match e.downcast_ref::<GantryError>() {
        Some(kind) => (
            StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            kind.to_string(),
        ),
        None => {
            warn!("internal error: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
        }
    };
    (
        status,
        Json(json!({ "ok": false, "error": kind_of(&e), "message": message })),
    )
}

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn repo_of(state: &AppState, owner: &str, name: &str) -> Result<RepoBinding, anyhow::Error> {
    state
        .db
        .get_repo(owner, name)?
        .ok_or_else(|| GantryError::NotFound(format!("repo {owner}/{name}")).into())
}

// ── Health / repos ───────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_s": state.start_time.elapsed().as_secs(),
    }))
}

pub(crate) async fn list_repos(State(state): State<Arc<AppState>>) -> ApiResult {
    let repos = state.db.list_repos().map_err(fail)?;
    let arr: Vec<Value> = repos
        .iter()
        .map(|r| {
            json!({
                "owner": r.owner,
                "name": r.name,
                "installationId": r.installation_id,
                "defaultBranch": r.default_branch,
            })
        })
        .collect();
    Ok(Json(json!({ "ok": true, "repos": arr })))
}

// ── Sandbox sessions ─────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
pub(crate) struct CreateSessionBody {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    #[serde(rename = "ttlS")]
    pub ttl_s: Option<i64>,
}

pub(crate) async fn create_session(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CreateSessionBody>>,
) -> ApiResult {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let created = state
        .sessions
        .create(
            body.session_id,
            SessionOptions { ttl_s: body.ttl_s, env: Vec::new() },
        )
        .await
        .map_err(fail)?;
    Ok(Json(json!({
        "ok": true,
        "sessionId": created.id,
        "wsUrl": format!("/api/sandbox/sessions/{}/ws", created.id),
        "expiresIn": created.expires_in_s,
    })))
}

pub(crate) async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let info = state.sessions.get(&id).await.map_err(fail)?;
    Ok(Json(json!({ "ok": true, "session": info })))
}

pub(crate) async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    state.sessions.delete(&id).await.map_err(fail)?;
    Ok(Json(json!({ "ok": true })))
}

pub(crate) async fn ws_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    // Validate the session before upgrading so a bad id 404s.
    match state.sessions.get(&id).await {
        Ok(_) => upgrade
            .on_upgrade(move |socket| drive_ws(state, id, socket))
            .into_response(),
        Err(e) => fail(e).into_response(),
    }
}

/// Pump frames between the WebSocket and the session multiplexer. Each
/// connection gets its own multiplexer: one child at a time, isolated from
/// other connections on the same session.
async fn drive_ws(state: Arc<AppState>, session_id: String, mut socket: WebSocket) {
    let (mut mux, mut out_rx) = match state.sessions.connect(&session_id).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(session_id, "ws connect failed: {e}");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if socket.send(Message::Binary(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Binary(raw))) => {
                        if let Err(e) = mux.handle_frame(&raw).await {
                            // Rejected frames (stdin after EOF, bad signal)
                            // drop without killing the connection.
                            debug!(session_id, "frame rejected: {e}");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // text/ping/pong ignored
                    Some(Err(e)) => {
                        debug!(session_id, "ws error: {e}");
                        break;
                    }
                }
            }
        }
    }
}

// ── Sync & repo status ───────────────────────────────────────────────────

pub(crate) async fn repo_status(
    State(state): State<Arc<AppState>>,
    Path((owner, name)): Path<(String, String)>,
) -> ApiResult {
    let repo = repo_of(&state, &owner, &name).map_err(fail)?;
    let coordinator = state.sync.coordinator(&repo).await;
    let status = coordinator.status().map_err(fail)?;
    Ok(Json(json!({
        "ok": true,
        "issueCount": status.issue_count,
        "milestones": status.milestone_count,
        "syncStatus": {
            "state": status.state,
            "errorCount": status.error_count,
            "lastSuccess": status.last_success,
        },
        "recentSyncs": status.recent,
    })))
}

pub(crate) async fn sync_issues(
    State(state): State<Arc<AppState>>,
    Path((owner, name)): Path<(String, String)>,
) -> ApiResult {
    let repo = repo_of(&state, &owner, &name).map_err(fail)?;
    let enqueued = state
        .sync
        .enqueue(&repo, SyncRequest::new(SyncKind::Issues, "api"))
        .await;
    Ok(Json(json!({ "ok": true, "enqueued": enqueued })))
}

pub(crate) async fn sync_reset(
    State(state): State<Arc<AppState>>,
    Path((owner, name)): Path<(String, String)>,
) -> ApiResult {
    let repo = repo_of(&state, &owner, &name).map_err(fail)?;
    let coordinator = state.sync.coordinator(&repo).await;
    coordinator.reset().map_err(fail)?;
    Ok(Json(json!({ "ok": true })))
}

// ── Workflow dispatch ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct AssignBody {
    pub issue: AssignIssue,
    pub repo: AssignRepo,
}

#[derive(Deserialize)]
pub(crate) struct AssignIssue {
    pub id: String,
    pub assignee: String,
}

#[derive(Deserialize)]
pub(crate) struct AssignRepo {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "fullName")]
    pub full_name: Option<String>,
}

impl AssignRepo {
    fn owner_name(&self) -> Option<(String, String)> {
        if let (Some(owner), Some(name)) = (&self.owner, &self.name) {
            return Some((owner.clone(), name.clone()));
        }
        self.full_name
            .as_deref()
            .and_then(|full| full.split_once('/'))
            .map(|(o, n)| (o.to_string(), n.to_string()))
    }
}

/// Assignment gating is a normal decision, not an error: the response is
/// 200 with `triggered` carrying the outcome.
pub(crate) async fn assign_workflow(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AssignBody>,
) -> ApiResult {
    let (owner, name) = body
        .repo
        .owner_name()
        .ok_or_else(|| fail(GantryError::MalformedPayload("repo not specified".into()).into()))?;
    let repo = repo_of(&state, &owner, &name).map_err(fail)?;
    let issue_id = gantry_core::issue::validate_id(&body.issue.id)
        .map_err(|e| fail(e.into()))?;

    let outcome = state
        .dispatcher
        .assign(&repo, &issue_id, &body.issue.assignee)
        .await
        .map_err(fail)?;
    let mut envelope = serde_json::to_value(&outcome).unwrap_or_else(|_| json!({}));
    if let Some(map) = envelope.as_object_mut() {
        map.insert("ok".into(), json!(true));
    }
    Ok(Json(envelope))
}

// ── PR wrappers ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct PrCreateBody {
    pub repo: AssignRepo,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub head: String,
    #[serde(default)]
    pub base: Option<String>,
}

pub(crate) async fn pr_create(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PrCreateBody>,
) -> ApiResult {
    let (owner, name) = body
        .repo
        .owner_name()
        .ok_or_else(|| fail(GantryError::MalformedPayload("repo not specified".into()).into()))?;
    let repo = repo_of(&state, &owner, &name).map_err(fail)?;
    let pr = state
        .forge
        .create_pr(
            &repo,
            NewPr {
                title: body.title,
                body: body.body,
                head: body.head,
                base: body.base.unwrap_or_else(|| repo.default_branch.clone()),
            },
        )
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "ok": true, "pr": pr })))
}

#[derive(Deserialize)]
pub(crate) struct PrReviewBody {
    pub repo: AssignRepo,
    pub number: i64,
    /// "approve" | "request_changes" | "comment"
    pub verdict: String,
    #[serde(default)]
    pub body: String,
}

pub(crate) async fn pr_review(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PrReviewBody>,
) -> ApiResult {
    let (owner, name) = body
        .repo
        .owner_name()
        .ok_or_else(|| fail(GantryError::MalformedPayload("repo not specified".into()).into()))?;
    let repo = repo_of(&state, &owner, &name).map_err(fail)?;
    let verdict = match body.verdict.as_str() {
        "approve" => ReviewVerdict::Approve,
        "request_changes" => ReviewVerdict::RequestChanges,
        _ => ReviewVerdict::Comment,
    };
    state
        .forge
        .submit_review(&repo, body.number, verdict, &body.body)
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
pub(crate) struct PrMergeBody {
    pub repo: AssignRepo,
    pub number: i64,
    /// Merge even when the reviewer queue has not fully approved.
    #[serde(default)]
    pub force: bool,
}

pub(crate) async fn pr_merge(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PrMergeBody>,
) -> ApiResult {
    let (owner, name) = body
        .repo
        .owner_name()
        .ok_or_else(|| fail(GantryError::MalformedPayload("repo not specified".into()).into()))?;
    let repo = repo_of(&state, &owner, &name).map_err(fail)?;

    if !body.force {
        let record = state
            .prs
            .load(repo.id, body.number)
            .map_err(fail)?
            .ok_or_else(|| fail(GantryError::NotFound(format!("PR #{}", body.number)).into()))?;
        if !ready_to_merge(&record) {
            return Err(fail(
                GantryError::Conflict("PR is not ready to merge".into()).into(),
            ));
        }
    }

    state
        .forge
        .merge_pr(&repo, body.number)
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "ok": true })))
}
